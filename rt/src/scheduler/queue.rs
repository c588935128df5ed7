//! Ready queue with pluggable ordering policy.

use serde::{Deserialize, Serialize};

/// How the ready queue orders tasks whose predecessors have finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Parser declaration order
    #[default]
    Fifo,
    /// Descending estimated duration; unknown estimates last
    LongestFirst,
    /// Ascending estimated duration; unknown estimates last
    ShortestFirst,
}

impl std::str::FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" | "none" => Ok(Self::Fifo),
            "longest_first" => Ok(Self::LongestFirst),
            "shortest_first" => Ok(Self::ShortestFirst),
            _ => Err(format!("unknown ordering policy '{s}'; use longest_first or shortest_first")),
        }
    }
}

/// One admissible task waiting for a worker slot.
#[derive(Debug, Clone)]
pub struct ReadyEntry {
    /// Index into the DAG
    pub task: usize,
    /// Declaration order, the final tiebreak
    pub seq: usize,
    /// Estimated duration in seconds, when history exists
    pub estimate: Option<f64>,
}

/// Sorted collection re-evaluated on every push, popped from the front.
/// Entries the stage gate rejects are skipped in place, so this is a
/// plain sorted vector rather than a heap.
#[derive(Debug)]
pub struct ReadyQueue {
    policy: OrderingPolicy,
    entries: Vec<ReadyEntry>,
}

impl ReadyQueue {
    pub fn new(policy: OrderingPolicy) -> Self {
        Self { policy, entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: ReadyEntry) {
        self.entries.push(entry);
        let policy = self.policy;
        self.entries.sort_by(|a, b| Self::compare(policy, a, b));
    }

    /// Remove and return the first entry `admit` accepts, scanning past
    /// entries currently blocked by a stage cap.
    pub fn pop_where<F: FnMut(&ReadyEntry) -> bool>(&mut self, mut admit: F) -> Option<ReadyEntry> {
        let idx = self.entries.iter().position(|e| admit(e))?;
        Some(self.entries.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadyEntry> {
        self.entries.iter()
    }

    fn compare(policy: OrderingPolicy, a: &ReadyEntry, b: &ReadyEntry) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let by_policy = match policy {
            OrderingPolicy::Fifo => Ordering::Equal,
            OrderingPolicy::LongestFirst => match (a.estimate, b.estimate) {
                (Some(ea), Some(eb)) => eb.partial_cmp(&ea).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            OrderingPolicy::ShortestFirst => match (a.estimate, b.estimate) {
                (Some(ea), Some(eb)) => ea.partial_cmp(&eb).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        };
        by_policy.then(a.seq.cmp(&b.seq))
    }
}
