//! EWMA runtime estimation from persisted history.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use statstore::{DurationSample, StatsStore};
use tracing::warn;

use crate::model::{Dag, Task, task_signature};
use crate::settings::EstimatorSettings;

/// Scheduling-weight estimator. Reads recent successful durations per
/// task signature and folds them into an exponentially weighted moving
/// average, optionally weighting samples by how close their hour of day
/// is to the current one.
pub struct Estimator {
    store: Arc<StatsStore>,
    settings: EstimatorSettings,
    cache: Mutex<HashMap<String, (f64, DateTime<Utc>)>>,
}

impl Estimator {
    pub fn new(store: Arc<StatsStore>, settings: EstimatorSettings) -> Self {
        Self {
            store,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Estimated duration in seconds, or `None` below `min_samples`.
    pub fn cost(&self, task: &Task) -> Option<f64> {
        let signature = task_signature(task);
        let now = Utc::now();

        if !self.settings.time_of_day {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(&(value, computed_at)) = cache.get(&signature) {
                let age = now.signed_duration_since(computed_at);
                if age.num_hours() < self.settings.cache_hours as i64 {
                    return Some(value);
                }
            }
        }

        let samples = match self.store.recent(&signature, self.settings.lookback_runs) {
            Ok(samples) => samples,
            Err(e) => {
                warn!(%signature, "History lookup failed: {e}");
                return None;
            }
        };
        if samples.len() < self.settings.min_samples {
            return None;
        }

        let value = self.fold(&samples, now);

        if !self.settings.time_of_day {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(signature, (value, now));
        }
        Some(value)
    }

    /// Estimates for every task of a DAG, index-aligned.
    pub fn costs(&self, dag: &Dag) -> Vec<Option<f64>> {
        dag.tasks().iter().map(|t| self.cost(t)).collect()
    }

    /// Fold samples oldest to newest. With time-of-day weighting each
    /// sample's smoothing factor is scaled by the cosine similarity of
    /// its hour of day to the current hour; otherwise weights are
    /// uniform.
    fn fold(&self, newest_first: &[DurationSample], now: DateTime<Utc>) -> f64 {
        let alpha = self.settings.alpha;
        let mut iter = newest_first.iter().rev();
        let first = iter.next().map(|s| s.duration_secs).unwrap_or(0.0);
        let mut value = first;
        for sample in iter {
            let weight = if self.settings.time_of_day {
                hour_similarity(hour_of_day(sample.started_at), hour_of_day_dt(now))
            } else {
                1.0
            };
            let a = (alpha * weight).clamp(0.0, 1.0);
            value = a * sample.duration_secs + (1.0 - a) * value;
        }
        value
    }
}

fn hour_of_day(unix_ms: i64) -> f64 {
    (unix_ms.rem_euclid(86_400_000)) as f64 / 3_600_000.0
}

fn hour_of_day_dt(dt: DateTime<Utc>) -> f64 {
    hour_of_day(dt.timestamp_millis())
}

/// Cosine similarity of two hours on the 24h circle, mapped to [0, 1].
fn hour_similarity(a: f64, b: f64) -> f64 {
    (1.0 + ((a - b) * TAU / 24.0).cos()) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use statstore::TaskRecord;

    fn seeded_store(sig_process: &str, durations_ms: &[i64]) -> Arc<StatsStore> {
        let store = Arc::new(StatsStore::open_in_memory().unwrap());
        let now = Utc::now().timestamp_millis();
        // Oldest sample first, spaced one minute apart so "recent"
        // ordering is well defined while hours of day stay aligned.
        for (i, &dur) in durations_ms.iter().enumerate() {
            let started = now - ((durations_ms.len() - i) as i64) * 60_000;
            store
                .append_task(&TaskRecord {
                    run_id: format!("r{i}"),
                    workflow: "wf".to_string(),
                    task_id: "t".to_string(),
                    signature: format!("prod|{sig_process}"),
                    instance: "prod".to_string(),
                    process: sig_process.to_string(),
                    parameters: "{}".to_string(),
                    status: "succeeded".to_string(),
                    started_at: Some(started),
                    finished_at: Some(started + dur),
                    attempts: 1,
                    error_kind: None,
                    error_message: None,
                })
                .unwrap();
        }
        store
    }

    fn settings() -> EstimatorSettings {
        EstimatorSettings {
            alpha: 0.5,
            min_samples: 2,
            lookback_runs: 10,
            cache_hours: 6,
            time_of_day: false,
        }
    }

    #[test]
    fn test_ewma_folds_oldest_to_newest() {
        let store = seeded_store("load", &[10_000, 20_000]);
        let estimator = Estimator::new(store, settings());
        let cost = estimator.cost(&Task::new("t", "prod", "load")).unwrap();
        // 10, then 0.5*20 + 0.5*10 = 15
        assert!((cost - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_below_min_samples_is_unavailable() {
        let store = seeded_store("load", &[10_000]);
        let estimator = Estimator::new(store, settings());
        assert!(estimator.cost(&Task::new("t", "prod", "load")).is_none());
    }

    #[test]
    fn test_unknown_signature_is_unavailable() {
        let store = seeded_store("load", &[10_000, 20_000]);
        let estimator = Estimator::new(store, settings());
        assert!(estimator.cost(&Task::new("t", "prod", "other")).is_none());
    }

    #[test]
    fn test_cache_holds_value_across_new_data() {
        let store = seeded_store("load", &[10_000, 20_000]);
        let estimator = Estimator::new(store.clone(), settings());
        let first = estimator.cost(&Task::new("t", "prod", "load")).unwrap();

        // New history arrives; the cached value is still served
        let now = Utc::now().timestamp_millis();
        store
            .append_task(&TaskRecord {
                run_id: "r9".to_string(),
                workflow: "wf".to_string(),
                task_id: "t".to_string(),
                signature: "prod|load".to_string(),
                instance: "prod".to_string(),
                process: "load".to_string(),
                parameters: "{}".to_string(),
                status: "succeeded".to_string(),
                started_at: Some(now),
                finished_at: Some(now + 99_000),
                attempts: 1,
                error_kind: None,
                error_message: None,
            })
            .unwrap();

        let second = estimator.cost(&Task::new("t", "prod", "load")).unwrap();
        assert!((first - second).abs() < 1e-9);
    }

    #[test]
    fn test_time_of_day_disables_cache() {
        let store = seeded_store("load", &[10_000, 20_000]);
        let mut s = settings();
        s.time_of_day = true;
        let estimator = Estimator::new(store.clone(), s);
        let first = estimator.cost(&Task::new("t", "prod", "load")).unwrap();

        let now = Utc::now().timestamp_millis();
        store
            .append_task(&TaskRecord {
                run_id: "r9".to_string(),
                workflow: "wf".to_string(),
                task_id: "t".to_string(),
                signature: "prod|load".to_string(),
                instance: "prod".to_string(),
                process: "load".to_string(),
                parameters: "{}".to_string(),
                status: "succeeded".to_string(),
                started_at: Some(now),
                finished_at: Some(now + 90_000),
                attempts: 1,
                error_kind: None,
                error_message: None,
            })
            .unwrap();

        let second = estimator.cost(&Task::new("t", "prod", "load")).unwrap();
        assert!(second > first, "fresh sample must influence an uncached estimate");
    }

    #[test]
    fn test_hour_similarity_extremes() {
        assert!((hour_similarity(9.0, 9.0) - 1.0).abs() < 1e-9);
        assert!(hour_similarity(9.0, 21.0) < 1e-9);
        // Wraps around midnight
        assert!(hour_similarity(23.5, 0.5) > 0.9);
    }

    #[test]
    fn test_samples_at_current_hour_match_plain_ewma() {
        let store = seeded_store("load", &[10_000, 20_000]);
        let mut s = settings();
        s.time_of_day = true;
        let weighted = Estimator::new(store.clone(), s).cost(&Task::new("t", "prod", "load")).unwrap();
        let plain = Estimator::new(store, settings()).cost(&Task::new("t", "prod", "load")).unwrap();
        // Samples were taken minutes ago, at (almost) the current hour
        assert!((weighted - plain).abs() < 0.5);
    }
}
