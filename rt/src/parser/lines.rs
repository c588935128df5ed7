//! The two line-oriented workflow forms.

use crate::model::{ParsedItem, Task};

use super::ParseError;
use super::tokens::tokenize;

const WAIT_KEYWORD: &str = "wait";

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn classify(task: Task) -> ParsedItem {
    if task.is_template() {
        ParsedItem::Template(task)
    } else {
        ParsedItem::Task(task)
    }
}

/// Parse the legacy wait-barrier form: anonymous tasks separated by
/// `wait` lines. Tasks get implicit ids "1", "2", ... in file order.
pub fn parse_barrier_form(content: &str) -> Result<Vec<ParsedItem>, ParseError> {
    let mut items = Vec::new();
    let mut next_id: u32 = 0;

    for (idx, raw) in content.lines().enumerate() {
        let lineno = idx + 1;
        if is_comment_or_blank(raw) {
            continue;
        }
        if raw.trim() == WAIT_KEYWORD {
            items.push(ParsedItem::Wait);
            continue;
        }

        let pairs = tokenize(raw, lineno)?;
        next_id += 1;
        let mut task = Task::new(next_id.to_string(), "", "");
        for (key, value) in pairs {
            match key.as_str() {
                "instance" => task.instance = value,
                "process" => task.process = value,
                _ => task.parameters.push((key, value)),
            }
        }
        require_key(&task.instance, "instance", lineno)?;
        require_key(&task.process, "process", lineno)?;
        items.push(classify(task));
    }

    Ok(items)
}

/// Parse the dependency form: explicitly identified tasks with
/// `predecessors` lists and per-task flags.
pub fn parse_dependency_form(content: &str) -> Result<Vec<ParsedItem>, ParseError> {
    let mut items = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let lineno = idx + 1;
        if is_comment_or_blank(raw) {
            continue;
        }

        let pairs = tokenize(raw, lineno)?;
        let mut task = Task::new("", "", "");
        for (key, value) in pairs {
            match key.as_str() {
                "id" => task.id = value,
                "instance" => task.instance = value,
                "process" => task.process = value,
                "predecessors" => {
                    task.predecessors = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "stage" => task.stage = Some(value),
                "timeout_sec" => {
                    task.timeout_sec = Some(value.parse().map_err(|_| ParseError::Syntax {
                        line: lineno,
                        message: format!("invalid timeout_sec '{value}'"),
                    })?);
                }
                "cancel_at_timeout" => task.cancel_at_timeout = parse_bool(&value, &key, lineno)?,
                "require_predecessor_success" => {
                    task.require_predecessor_success = parse_bool(&value, &key, lineno)?;
                }
                "safe_retry" => task.safe_retry = parse_bool(&value, &key, lineno)?,
                "succeed_on_minor_errors" => {
                    task.succeed_on_minor_errors = parse_bool(&value, &key, lineno)?;
                }
                _ => task.parameters.push((key, value)),
            }
        }
        require_key(&task.id, "id", lineno)?;
        require_key(&task.instance, "instance", lineno)?;
        require_key(&task.process, "process", lineno)?;
        items.push(classify(task));
    }

    Ok(items)
}

fn require_key(value: &str, key: &str, lineno: usize) -> Result<(), ParseError> {
    if value.is_empty() {
        return Err(ParseError::Syntax {
            line: lineno,
            message: format!("missing required key '{key}'"),
        });
    }
    Ok(())
}

fn parse_bool(value: &str, key: &str, lineno: usize) -> Result<bool, ParseError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(true),
        "0" | "false" | "no" | "n" => Ok(false),
        _ => Err(ParseError::Syntax {
            line: lineno,
            message: format!("invalid boolean '{value}' for '{key}'"),
        }),
    }
}

/// Translate wait barriers into implicit predecessors: every task after
/// a barrier depends on every task of the group immediately before it.
pub fn translate_barriers(items: Vec<ParsedItem>) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut closing: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for item in items {
        match item {
            ParsedItem::Wait => {
                // Consecutive barriers collapse; an empty group keeps the
                // previous closing set.
                if !current.is_empty() {
                    closing = std::mem::take(&mut current);
                }
            }
            ParsedItem::Task(mut task) | ParsedItem::Template(mut task) => {
                for pred in &closing {
                    if !task.predecessors.contains(pred) {
                        task.predecessors.push(pred.clone());
                    }
                }
                current.push(task.id.clone());
                tasks.push(task);
            }
        }
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_form_assigns_ordinal_ids() {
        let content = "\
# morning loads
instance=prod process=load pYear=2024

instance=prod process=calc
wait
instance=prod process=report
";
        let items = parse_barrier_form(content).unwrap();
        assert_eq!(items.len(), 4);
        match &items[0] {
            ParsedItem::Task(t) => {
                assert_eq!(t.id, "1");
                assert_eq!(t.parameters, vec![("pYear".to_string(), "2024".to_string())]);
            }
            other => panic!("expected task, got {other:?}"),
        }
        assert!(matches!(items[2], ParsedItem::Wait));
        match &items[3] {
            ParsedItem::Task(t) => assert_eq!(t.id, "3"),
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[test]
    fn test_barrier_form_missing_instance() {
        let err = parse_barrier_form("process=load").unwrap_err();
        assert!(err.to_string().contains("missing required key 'instance'"));
    }

    #[test]
    fn test_dependency_form_full_task() {
        let content = "id=t1 instance=prod process=load predecessors=a,b stage=load \
                       timeout_sec=30 cancel_at_timeout=true require_predecessor_success=1 \
                       safe_retry=yes succeed_on_minor_errors=false pYear=2024";
        let items = parse_dependency_form(content).unwrap();
        let ParsedItem::Task(t) = &items[0] else {
            panic!("expected task");
        };
        assert_eq!(t.id, "t1");
        assert_eq!(t.predecessors, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(t.stage.as_deref(), Some("load"));
        assert_eq!(t.timeout_sec, Some(30));
        assert!(t.cancel_at_timeout);
        assert!(t.require_predecessor_success);
        assert!(t.safe_retry);
        assert!(!t.succeed_on_minor_errors);
        assert_eq!(t.parameters, vec![("pYear".to_string(), "2024".to_string())]);
    }

    #[test]
    fn test_dependency_form_requires_id() {
        let err = parse_dependency_form("instance=prod process=load").unwrap_err();
        assert!(err.to_string().contains("missing required key 'id'"));
    }

    #[test]
    fn test_dependency_form_bad_bool() {
        let err = parse_dependency_form("id=a instance=p process=x safe_retry=maybe").unwrap_err();
        assert!(err.to_string().contains("invalid boolean"));
    }

    #[test]
    fn test_template_classified() {
        let items = parse_dependency_form("id=a instance=p process=x pR*=*{[R].Members}").unwrap();
        assert!(matches!(items[0], ParsedItem::Template(_)));
    }

    #[test]
    fn test_translate_barriers_links_groups() {
        let content = "\
instance=p process=a
instance=p process=b
wait
instance=p process=c
instance=p process=d
wait
instance=p process=e
";
        let tasks = translate_barriers(parse_barrier_form(content).unwrap());
        assert_eq!(tasks.len(), 5);
        assert!(tasks[0].predecessors.is_empty());
        assert!(tasks[1].predecessors.is_empty());
        assert_eq!(tasks[2].predecessors, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(tasks[3].predecessors, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(tasks[4].predecessors, vec!["3".to_string(), "4".to_string()]);
    }

    #[test]
    fn test_translate_consecutive_barriers_collapse() {
        let content = "\
instance=p process=a
wait
wait
instance=p process=b
";
        let tasks = translate_barriers(parse_barrier_form(content).unwrap());
        assert_eq!(tasks[1].predecessors, vec!["1".to_string()]);
    }

    #[test]
    fn test_leading_barrier_is_noop() {
        let content = "\
wait
instance=p process=a
";
        let tasks = translate_barriers(parse_barrier_form(content).unwrap());
        assert!(tasks[0].predecessors.is_empty());
    }
}
