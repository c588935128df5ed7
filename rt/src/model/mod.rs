//! Workflow data model: tasks, the dependency graph, and task identity.

mod dag;
mod signature;
mod task;

pub use dag::{Dag, DagError};
pub use signature::task_signature;
pub use task::{ParsedItem, Task, TaskStatus};
