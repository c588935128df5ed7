//! Offline contention analysis.
//!
//! Looks at a workflow's execution history, finds the parameter that
//! drives runtime contention, serializes the outlier-heavy groups into
//! chains (preserving parallelism along the other parameter dimensions)
//! and recommends a worker count. With no driver or fewer than two heavy
//! groups it falls back to a pure longest-first reordering.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use statstore::RunRecord;
use tracing::debug;

use crate::model::Task;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// IQR multiplier `k`: the heavy fence is `Q3 + k * IQR`
    pub sensitivity: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self { sensitivity: 10.0 }
    }
}

/// One contention-heavy driver-value group.
#[derive(Debug, Clone)]
pub struct HeavyGroup {
    pub value: String,
    pub mean_secs: f64,
    pub tasks: Vec<String>,
}

/// Result of one analysis pass.
#[derive(Debug)]
pub struct Analysis {
    /// Parameter key identified as the contention driver
    pub driver: Option<String>,
    pub heavy: Vec<HeavyGroup>,
    /// Parallel chains preserved across non-driver dimensions
    pub chains: usize,
    pub recommended_workers: Option<u32>,
    /// Fewest workers within 10% of the fastest observed wall-clock
    pub sweet_spot_workers: Option<u32>,
    /// The rewritten workflow: added edges, or longest-first reordering
    pub tasks: Vec<Task>,
    pub notes: Vec<String>,
}

/// Analyze one workflow. `estimates` is index-aligned with `tasks`
/// (per-signature EWMA, seconds); `run_history` feeds the sweet-spot
/// check.
pub fn analyze(
    tasks: &[Task],
    estimates: &[Option<f64>],
    run_history: &[RunRecord],
    current_workers: Option<u32>,
    config: &AnalyzerConfig,
) -> Analysis {
    let mut notes = Vec::new();

    let sweet_spot_workers = sweet_spot(run_history);
    if let (Some(sweet), Some(current)) = (sweet_spot_workers, current_workers) {
        match sweet.cmp(&current) {
            std::cmp::Ordering::Less => {
                notes.push(format!("history suggests {sweet} workers perform within 10% of {current}; scale down"));
            }
            std::cmp::Ordering::Greater => {
                notes.push(format!("history suggests scaling up from {current} to {sweet} workers"));
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    let Some((driver, groups)) = find_driver(tasks, estimates) else {
        notes.push("no contention driver found; reordering longest-first".to_string());
        return Analysis {
            driver: None,
            heavy: Vec::new(),
            chains: 0,
            recommended_workers: sweet_spot_workers,
            sweet_spot_workers,
            tasks: longest_first(tasks, estimates),
            notes,
        };
    };

    let heavy = heavy_groups(&groups, config.sensitivity);
    if heavy.len() < 2 {
        notes.push(format!(
            "driver '{driver}' has {} heavy group(s); reordering longest-first",
            heavy.len()
        ));
        return Analysis {
            driver: Some(driver),
            heavy,
            chains: 0,
            recommended_workers: sweet_spot_workers,
            sweet_spot_workers,
            tasks: longest_first(tasks, estimates),
            notes,
        };
    }

    debug!(%driver, heavy = heavy.len(), "Chaining heavy groups");
    let rewritten = chain_heavy(tasks, &driver, &heavy);

    let chains = fan_out(tasks, &driver, &heavy);
    let heavy_task_ids: BTreeSet<&str> = heavy
        .iter()
        .flat_map(|g| g.tasks.iter().map(String::as_str))
        .collect();
    let light_work: f64 = tasks
        .iter()
        .zip(estimates.iter())
        .filter(|(t, _)| !heavy_task_ids.contains(t.id.as_str()))
        .filter_map(|(_, e)| *e)
        .sum();
    let chain_duration: f64 = heavy.iter().map(|g| g.mean_secs).sum();
    let recommended = if chain_duration > 0.0 {
        chains as u32 + (light_work / chain_duration).ceil() as u32
    } else {
        chains as u32
    };
    notes.push(format!(
        "driver '{driver}': {} heavy groups serialized into {chains} chain(s); recommending {recommended} workers",
        heavy.len()
    ));

    Analysis {
        driver: Some(driver),
        heavy,
        chains,
        recommended_workers: Some(recommended),
        sweet_spot_workers,
        tasks: rewritten,
        notes,
    }
}

/// Pick the varying parameter whose per-value group means span the
/// widest range. Ties break lexicographically for determinism.
fn find_driver(tasks: &[Task], estimates: &[Option<f64>]) -> Option<(String, BTreeMap<String, GroupStats>)> {
    let mut keys: BTreeSet<&str> = BTreeSet::new();
    for task in tasks {
        for (k, _) in &task.parameters {
            keys.insert(k);
        }
    }

    let mut best: Option<(String, BTreeMap<String, GroupStats>, f64)> = None;
    for key in keys {
        let groups = group_by(tasks, estimates, key);
        if groups.len() < 2 {
            continue;
        }
        let means: Vec<f64> = groups.values().filter_map(|g| g.mean()).collect();
        if means.len() < 2 {
            continue;
        }
        let range = means.iter().cloned().fold(f64::MIN, f64::max)
            - means.iter().cloned().fold(f64::MAX, f64::min);
        let better = match &best {
            None => true,
            Some((_, _, best_range)) => range > *best_range,
        };
        if better {
            best = Some((key.to_string(), groups, range));
        }
    }

    best.map(|(key, groups, _)| (key, groups))
}

#[derive(Debug, Default, Clone)]
struct GroupStats {
    task_ids: Vec<String>,
    known: Vec<f64>,
}

impl GroupStats {
    fn mean(&self) -> Option<f64> {
        if self.known.is_empty() {
            None
        } else {
            Some(self.known.iter().sum::<f64>() / self.known.len() as f64)
        }
    }
}

fn group_by(tasks: &[Task], estimates: &[Option<f64>], key: &str) -> BTreeMap<String, GroupStats> {
    let mut groups: BTreeMap<String, GroupStats> = BTreeMap::new();
    for (task, estimate) in tasks.iter().zip(estimates.iter()) {
        let Some(value) = task.parameters.iter().find(|(k, _)| k == key).map(|(_, v)| v) else {
            continue;
        };
        let group = groups.entry(value.clone()).or_default();
        group.task_ids.push(task.id.clone());
        if let Some(e) = estimate {
            group.known.push(*e);
        }
    }
    groups
}

/// IQR outlier detection over group means: heavy when mean > Q3 + k*IQR.
fn heavy_groups(groups: &BTreeMap<String, GroupStats>, sensitivity: f64) -> Vec<HeavyGroup> {
    let mut means: Vec<f64> = groups.values().filter_map(GroupStats::mean).collect();
    if means.len() < 2 {
        return Vec::new();
    }
    means.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q1 = quantile(&means, 0.25);
    let q3 = quantile(&means, 0.75);
    let fence = q3 + sensitivity * (q3 - q1);

    let mut heavy: Vec<HeavyGroup> = groups
        .iter()
        .filter_map(|(value, stats)| {
            let mean = stats.mean()?;
            (mean > fence).then(|| HeavyGroup {
                value: value.clone(),
                mean_secs: mean,
                tasks: stats.task_ids.clone(),
            })
        })
        .collect();
    heavy.sort_by(|a, b| b.mean_secs.partial_cmp(&a.mean_secs).unwrap_or(std::cmp::Ordering::Equal));
    heavy
}

/// Linear-interpolation quantile over a sorted slice.
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = p * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Add predecessor edges serializing heavy groups, matching tasks across
/// groups on their non-driver parameters so fan-out survives.
fn chain_heavy(tasks: &[Task], driver: &str, heavy: &[HeavyGroup]) -> Vec<Task> {
    let mut rewritten: Vec<Task> = tasks.to_vec();
    let index: HashMap<&str, usize> = tasks.iter().enumerate().map(|(i, t)| (t.id.as_str(), i)).collect();

    // Lanes compare by key, not by file-authored parameter order
    let lane = |id: &str| -> Vec<(String, String)> {
        let task = &tasks[index[id]];
        let mut lane: Vec<(String, String)> = task
            .parameters
            .iter()
            .filter(|(k, _)| k != driver)
            .cloned()
            .collect();
        lane.sort_by(|a, b| a.0.cmp(&b.0));
        lane
    };

    for pair in heavy.windows(2) {
        let (upstream, downstream) = (&pair[0], &pair[1]);
        for down_id in &downstream.tasks {
            let down_lane = lane(down_id);
            let mut matched: Vec<&String> = upstream
                .tasks
                .iter()
                .filter(|up_id| lane(up_id) == down_lane)
                .collect();
            if matched.is_empty() {
                matched = upstream.tasks.iter().collect();
            }
            let down = &mut rewritten[index[down_id.as_str()]];
            for up_id in matched {
                if !down.predecessors.contains(up_id) {
                    down.predecessors.push(up_id.clone());
                }
            }
        }
    }

    rewritten
}

/// Fan-out along non-driver dimensions: the product of unique values of
/// every other varying parameter among heavy-group tasks.
fn fan_out(tasks: &[Task], driver: &str, heavy: &[HeavyGroup]) -> usize {
    let heavy_ids: BTreeSet<&str> = heavy.iter().flat_map(|g| g.tasks.iter().map(String::as_str)).collect();
    let mut uniques: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for task in tasks.iter().filter(|t| heavy_ids.contains(t.id.as_str())) {
        for (k, v) in &task.parameters {
            if k != driver {
                uniques.entry(k).or_default().insert(v);
            }
        }
    }
    uniques
        .values()
        .filter(|values| values.len() > 1)
        .map(BTreeSet::len)
        .product::<usize>()
        .max(1)
}

/// Pure longest-first reorder: known estimates descending, unknown after
/// known, declaration order as tiebreak.
fn longest_first(tasks: &[Task], estimates: &[Option<f64>]) -> Vec<Task> {
    let mut order: Vec<usize> = (0..tasks.len()).collect();
    order.sort_by(|&a, &b| match (estimates[a], estimates[b]) {
        (Some(ea), Some(eb)) => eb.partial_cmp(&ea).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.cmp(&b),
    });
    order.into_iter().map(|i| tasks[i].clone()).collect()
}

/// Fewest workers whose best observed wall-clock is within 10% of the
/// fastest across the history.
fn sweet_spot(history: &[RunRecord]) -> Option<u32> {
    let mut best_by_workers: BTreeMap<u32, f64> = BTreeMap::new();
    for run in history {
        let elapsed = run.elapsed_secs();
        if elapsed <= 0.0 {
            continue;
        }
        best_by_workers
            .entry(run.max_workers)
            .and_modify(|b| *b = b.min(elapsed))
            .or_insert(elapsed);
    }
    if best_by_workers.len() < 2 {
        return None;
    }
    let fastest = best_by_workers.values().cloned().fold(f64::MAX, f64::min);
    best_by_workers
        .iter()
        .find(|&(_, &elapsed)| elapsed <= fastest * 1.1)
        .map(|(&workers, _)| workers)
}
