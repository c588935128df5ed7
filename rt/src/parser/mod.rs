//! Workflow file ingestion.
//!
//! Three input forms land on one pipeline: parse into [`ParsedItem`]s,
//! expand parametric templates against the remote, translate wait
//! barriers into implicit predecessors, and build the validated DAG.

mod expand;
mod lines;
mod structured;
mod tokens;

pub use expand::expand_templates;
pub use lines::{parse_barrier_form, parse_dependency_form, translate_barriers};
pub use structured::{StructuredParse, emit_structured, parse_structured};
pub use tokens::{quote_if_needed, tokenize};

use std::path::Path;

use thiserror::Error;

use crate::model::{Dag, DagError, ParsedItem};
use crate::remote::ClientFactory;
use crate::settings::SettingsOverlay;

/// Failures while turning a workflow file into a DAG.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("structured workflow: {0}")]
    Structured(String),

    #[error("expansion of '{expression}' on instance '{instance}' failed: {message}")]
    Expansion {
        instance: String,
        expression: String,
        message: String,
    },

    #[error(transparent)]
    Graph(#[from] DagError),

    #[error("failed to read '{path}': {message}")]
    Io { path: String, message: String },
}

/// Which input form a file was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    WaitBarrier,
    Dependency,
    Structured,
}

/// A parsed (not yet expanded) workflow.
#[derive(Debug)]
pub struct ParsedWorkflow {
    pub mode: ParseMode,
    pub items: Vec<ParsedItem>,
    /// Workflow name from structured metadata, when present
    pub workflow: Option<String>,
    /// Settings block from the structured form, when present
    pub settings: Option<SettingsOverlay>,
    pub warnings: Vec<String>,
}

/// Strip a UTF-8 BOM if present.
fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

/// Decide which form a payload is in. A payload that parses as a JSON
/// object is structured; otherwise any line containing `id=` selects
/// the dependency form; anything else is the wait-barrier form.
pub fn detect_mode(content: &str) -> ParseMode {
    let content = strip_bom(content);
    if content.trim_start().starts_with('{') {
        return ParseMode::Structured;
    }
    let has_id = content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .any(|l| l.contains("id="));
    if has_id {
        ParseMode::Dependency
    } else {
        ParseMode::WaitBarrier
    }
}

/// Parse a workflow payload in whichever form it is in.
pub fn parse_str(content: &str) -> Result<ParsedWorkflow, ParseError> {
    let content = strip_bom(content);
    match detect_mode(content) {
        ParseMode::Structured => {
            let parsed = parse_structured(content)?;
            Ok(ParsedWorkflow {
                mode: ParseMode::Structured,
                items: parsed.items,
                workflow: parsed.workflow,
                settings: parsed.settings,
                warnings: parsed.warnings,
            })
        }
        ParseMode::Dependency => Ok(ParsedWorkflow {
            mode: ParseMode::Dependency,
            items: parse_dependency_form(content)?,
            workflow: None,
            settings: None,
            warnings: Vec::new(),
        }),
        ParseMode::WaitBarrier => Ok(ParsedWorkflow {
            mode: ParseMode::WaitBarrier,
            items: parse_barrier_form(content)?,
            workflow: None,
            settings: None,
            warnings: Vec::new(),
        }),
    }
}

/// Read and parse a workflow file.
pub fn parse_file(path: &Path) -> Result<ParsedWorkflow, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| ParseError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_str(&content)
}

/// Expand templates and translate barriers, yielding the final DAG.
pub async fn resolve_dag(
    workflow: ParsedWorkflow,
    factory: &dyn ClientFactory,
    session_tag: &str,
) -> Result<(Dag, Vec<String>), ParseError> {
    let (items, warnings) = expand_templates(workflow.items, factory, session_tag).await?;
    let tasks = translate_barriers(items);
    let dag = Dag::build(tasks)?;
    Ok((dag, warnings))
}
