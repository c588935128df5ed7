//! Structural and remote workflow validation.

use std::collections::BTreeSet;

use tracing::debug;

use crate::model::Dag;
use crate::remote::{ClientFactory, ProcessProbe};

/// Outcome of a validation pass. Errors block the run; warnings do not.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Enforce the graph invariants that survive DAG construction: the graph
/// must be acyclic, and flag combinations that cannot take effect are
/// worth a warning.
pub fn validate_structural(dag: &Dag) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Err(e) = dag.topo_order() {
        report.errors.push(e.to_string());
    }

    for task in dag.tasks() {
        if task.cancel_at_timeout && task.timeout_sec.is_none() {
            report.warnings.push(format!(
                "task '{}': cancel_at_timeout has no effect without timeout_sec",
                task.id
            ));
        }
    }

    report
}

/// Probe each distinct (instance, process) pair against the remote.
/// Unreachable instances degrade to warnings; a reachable instance that
/// does not know a process is an error.
pub async fn validate_remote(dag: &Dag, factory: &dyn ClientFactory, session_tag: &str) -> ValidationReport {
    let mut report = ValidationReport::default();

    let pairs: BTreeSet<(String, String)> = dag
        .tasks()
        .iter()
        .map(|t| (t.instance.clone(), t.process.clone()))
        .collect();

    let mut current_instance: Option<(String, std::sync::Arc<dyn crate::remote::RemoteClient>)> = None;
    for (instance, process) in pairs {
        let reusable = matches!(&current_instance, Some((name, _)) if *name == instance);
        let client = if reusable {
            current_instance.as_ref().map(|(_, client)| client.clone())
        } else {
            if let Some((_, old)) = current_instance.take() {
                if let Some(id) = old.session_id() {
                    let _ = old.end_session(id).await;
                }
            }
            match factory.connect(&instance, session_tag).await {
                Ok(client) => {
                    current_instance = Some((instance.clone(), client.clone()));
                    Some(client)
                }
                Err(e) => {
                    report
                        .warnings
                        .push(format!("instance '{instance}' unreachable: {e}"));
                    None
                }
            }
        };

        let Some(client) = client else { continue };
        debug!(%instance, %process, "Probing remote process");
        match client.probe_process(&process).await {
            Ok(ProcessProbe::Exists) => {}
            Ok(ProcessProbe::NotFound) => {
                report
                    .errors
                    .push(format!("process '{process}' does not exist on instance '{instance}'"));
            }
            Err(e) => {
                report
                    .warnings
                    .push(format!("probe of '{process}' on '{instance}' failed: {e}"));
            }
        }
    }

    if let Some((_, client)) = current_instance {
        if let Some(id) = client.session_id() {
            let _ = client.end_session(id).await;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::remote::mock::{MockBehavior, MockCluster, MockFactory};
    use std::time::Duration;

    #[test]
    fn test_structural_ok() {
        let dag = Dag::build(vec![
            Task::new("a", "p", "x"),
            Task::new("b", "p", "x").with_predecessors(["a"]),
        ])
        .unwrap();
        let report = validate_structural(&dag);
        assert!(report.is_ok());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_structural_cycle_is_error() {
        let dag = Dag::build(vec![
            Task::new("a", "p", "x").with_predecessors(["b"]),
            Task::new("b", "p", "x").with_predecessors(["a"]),
        ])
        .unwrap();
        let report = validate_structural(&dag);
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("cycle"));
    }

    #[test]
    fn test_structural_warns_on_inert_cancel_flag() {
        let mut task = Task::new("a", "p", "x");
        task.cancel_at_timeout = true;
        let dag = Dag::build(vec![task]).unwrap();
        let report = validate_structural(&dag);
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_probe_batches_per_pair() {
        let cluster = MockCluster::new();
        cluster.behave("prod", "load", MockBehavior::Succeed { delay: Duration::ZERO });
        let factory = MockFactory::new(cluster.clone());

        // Two tasks share one (instance, process) pair; one names a
        // process the instance does not know.
        let dag = Dag::build(vec![
            Task::new("a", "prod", "load"),
            Task::new("b", "prod", "load"),
            Task::new("c", "prod", "ghost"),
        ])
        .unwrap();

        let report = validate_remote(&dag, factory.as_ref(), "tag").await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("'ghost'"));
        // One connection probes both distinct processes
        assert_eq!(cluster.connects("prod"), 1);
    }
}
