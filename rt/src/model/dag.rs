//! Dependency graph over concrete tasks.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::task::Task;

/// Structural defects in a workflow graph.
#[derive(Debug, Error)]
pub enum DagError {
    #[error("duplicate task id '{0}'")]
    DuplicateId(String),

    #[error("task '{task}' names unknown predecessor '{predecessor}'")]
    MissingPredecessor { task: String, predecessor: String },

    #[error("task '{0}' lists itself as a predecessor")]
    SelfReference(String),

    #[error("task with empty id")]
    EmptyId,

    #[error("task '{0}' has a parameter with an empty name")]
    EmptyParameterKey(String),

    #[error("task '{0}' has a non-positive timeout")]
    InvalidTimeout(String),

    #[error("dependency cycle involving tasks: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// The validated DAG: vertices are tasks in declaration order, edges run
/// predecessor -> successor. Adjacency is resolved to indices once at
/// build time.
#[derive(Debug, Clone)]
pub struct Dag {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
    stage_order: Vec<String>,
}

impl Dag {
    /// Build a DAG, enforcing every structural invariant except
    /// acyclicity (checked by [`Dag::topo_order`], which the validator
    /// always runs before a graph is scheduled).
    pub fn build(tasks: Vec<Task>) -> Result<Self, DagError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if task.id.is_empty() {
                return Err(DagError::EmptyId);
            }
            if task.parameters.iter().any(|(k, _)| k.is_empty()) {
                return Err(DagError::EmptyParameterKey(task.id.clone()));
            }
            if task.timeout_sec == Some(0) {
                return Err(DagError::InvalidTimeout(task.id.clone()));
            }
            if index.insert(task.id.clone(), i).is_some() {
                return Err(DagError::DuplicateId(task.id.clone()));
            }
        }

        let mut predecessors = vec![Vec::new(); tasks.len()];
        let mut successors = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            let mut seen = HashSet::new();
            for pred in &task.predecessors {
                if pred == &task.id {
                    return Err(DagError::SelfReference(task.id.clone()));
                }
                let &p = index.get(pred).ok_or_else(|| DagError::MissingPredecessor {
                    task: task.id.clone(),
                    predecessor: pred.clone(),
                })?;
                // Duplicate mentions collapse to one edge
                if seen.insert(p) {
                    predecessors[i].push(p);
                    successors[p].push(i);
                }
            }
        }

        let mut stage_order = Vec::new();
        for task in &tasks {
            if let Some(stage) = &task.stage {
                if !stage_order.contains(stage) {
                    stage_order.push(stage.clone());
                }
            }
        }

        Ok(Self {
            tasks,
            index,
            predecessors,
            successors,
            stage_order,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, idx: usize) -> &Task {
        &self.tasks[idx]
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn predecessors(&self, idx: usize) -> &[usize] {
        &self.predecessors[idx]
    }

    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.successors[idx]
    }

    /// Stage labels in first-appearance order.
    pub fn stage_order(&self) -> &[String] {
        &self.stage_order
    }

    /// Distinct instances referenced by the graph, sorted.
    pub fn instances(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .tasks
            .iter()
            .map(|t| t.instance.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        out.sort();
        out
    }

    /// Kahn topological pass. Returns a deterministic order (declaration
    /// order among simultaneously-ready vertices) or the set of tasks
    /// stuck on a cycle.
    pub fn topo_order(&self) -> Result<Vec<usize>, DagError> {
        let mut pending: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.tasks.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &s in &self.successors[i] {
                pending[s] -= 1;
                if pending[s] == 0 {
                    queue.push_back(s);
                }
            }
        }

        if order.len() != self.tasks.len() {
            let stuck: Vec<String> = (0..self.tasks.len())
                .filter(|&i| pending[i] > 0)
                .map(|i| self.tasks[i].id.clone())
                .collect();
            return Err(DagError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Initial `pending_count` per task.
    pub fn pending_counts(&self) -> Vec<usize> {
        self.predecessors.iter().map(Vec::len).collect()
    }
}
