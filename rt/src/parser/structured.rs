//! The structured (JSON) workflow form, including canonical emission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::model::{ParsedItem, Task};
use crate::settings::SettingsOverlay;

use super::ParseError;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StructuredWorkflow {
    #[allow(dead_code)]
    version: Option<String>,
    metadata: Option<Metadata>,
    settings: Option<SettingsOverlay>,
    tasks: Option<Vec<StructuredTask>>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Metadata {
    workflow: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StructuredTask {
    id: String,
    instance: String,
    process: String,
    parameters: BTreeMap<String, Value>,
    predecessors: Vec<String>,
    stage: Option<String>,
    timeout_sec: Option<u64>,
    cancel_at_timeout: bool,
    require_predecessor_success: bool,
    safe_retry: bool,
    succeed_on_minor_errors: bool,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

/// Result of parsing the structured form.
#[derive(Debug)]
pub struct StructuredParse {
    pub items: Vec<ParsedItem>,
    pub workflow: Option<String>,
    pub settings: Option<SettingsOverlay>,
    pub warnings: Vec<String>,
}

fn scalar_to_string(task_id: &str, key: &str, value: &Value) -> Result<String, ParseError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ParseError::Structured(format!(
            "task '{task_id}': parameter '{key}' must be a scalar, got {other}"
        ))),
    }
}

/// Parse a structured workflow payload.
pub fn parse_structured(content: &str) -> Result<StructuredParse, ParseError> {
    let parsed: StructuredWorkflow =
        serde_json::from_str(content).map_err(|e| ParseError::Structured(e.to_string()))?;

    let mut warnings = Vec::new();
    for key in parsed.unknown.keys() {
        warnings.push(format!("unknown workflow key '{key}'"));
    }

    let tasks = parsed
        .tasks
        .ok_or_else(|| ParseError::Structured("missing required 'tasks' array".to_string()))?;

    let mut items = Vec::with_capacity(tasks.len());
    for st in tasks {
        for key in st.unknown.keys() {
            warnings.push(format!("task '{}': unknown key '{}'", st.id, key));
        }
        let mut task = Task::new(st.id.clone(), st.instance, st.process);
        for (key, value) in &st.parameters {
            task.parameters.push((key.clone(), scalar_to_string(&st.id, key, value)?));
        }
        task.predecessors = st.predecessors;
        task.stage = st.stage;
        task.timeout_sec = st.timeout_sec;
        task.cancel_at_timeout = st.cancel_at_timeout;
        task.require_predecessor_success = st.require_predecessor_success;
        task.safe_retry = st.safe_retry;
        task.succeed_on_minor_errors = st.succeed_on_minor_errors;

        items.push(if task.is_template() {
            ParsedItem::Template(task)
        } else {
            ParsedItem::Task(task)
        });
    }

    Ok(StructuredParse {
        items,
        workflow: parsed.metadata.and_then(|m| m.workflow),
        settings: parsed.settings,
        warnings,
    })
}

/// Emit the canonical structured form: parameters sorted by key, every
/// flag explicit. `Parse(emit_structured(tasks)) == tasks` up to
/// parameter ordering, which emission canonicalizes.
pub fn emit_structured(tasks: &[Task], workflow: Option<&str>, settings: Option<&SettingsOverlay>) -> String {
    let task_values: Vec<Value> = tasks
        .iter()
        .map(|t| {
            let mut params: Vec<(&String, &String)> = t.parameters.iter().map(|(k, v)| (k, v)).collect();
            params.sort_by(|a, b| a.0.cmp(b.0));
            let parameters: Map<String, Value> = params
                .into_iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();

            json!({
                "id": t.id,
                "instance": t.instance,
                "process": t.process,
                "parameters": parameters,
                "predecessors": t.predecessors,
                "stage": t.stage,
                "timeout_sec": t.timeout_sec,
                "cancel_at_timeout": t.cancel_at_timeout,
                "require_predecessor_success": t.require_predecessor_success,
                "safe_retry": t.safe_retry,
                "succeed_on_minor_errors": t.succeed_on_minor_errors,
            })
        })
        .collect();

    let mut root = Map::new();
    root.insert("version".to_string(), Value::String("1".to_string()));
    if let Some(name) = workflow {
        root.insert("metadata".to_string(), json!({ "workflow": name }));
    }
    if let Some(settings) = settings {
        if let Ok(value) = serde_json::to_value(settings) {
            root.insert("settings".to_string(), prune_nulls(value));
        }
    }
    root.insert("tasks".to_string(), Value::Array(task_values));

    serde_json::to_string_pretty(&Value::Object(root)).unwrap_or_else(|_| "{}".to_string())
}

/// Drop `null` members so emitted settings only show what is set.
fn prune_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, prune_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}
