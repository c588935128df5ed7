//! Canonical task identity used to correlate executions across runs.

use super::task::Task;

/// Deterministic signature for a task: instance and process, then
/// parameters with keys sorted. ASCII characters are lower-cased;
/// anything else passes through untouched so non-ASCII member names
/// stay distinguishable.
pub fn task_signature(task: &Task) -> String {
    let mut params: Vec<(&str, &str)> = task
        .parameters
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::new();
    out.push_str(&lower_ascii(&task.instance));
    out.push('|');
    out.push_str(&lower_ascii(&task.process));
    for (k, v) in params {
        out.push('|');
        out.push_str(&lower_ascii(k));
        out.push('=');
        out.push_str(&lower_ascii(v));
    }
    out
}

fn lower_ascii(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii() { c.to_ascii_lowercase() } else { c })
        .collect()
}
