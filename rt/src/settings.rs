//! Run settings and their precedence chain.
//!
//! Highest wins: command-line flag, then the workflow file's `settings`
//! block, then the external settings file (`rushti.yml` in the working
//! directory, falling back to `~/.config/rushti/rushti.yml`), then the
//! built-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::remote::http::InstanceConfig;
use crate::scheduler::OrderingPolicy;

/// Partial settings from one source. `None` defers to the next source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettingsOverlay {
    pub max_workers: Option<u32>,
    pub retries: Option<u32>,
    pub optimize: Option<OrderingPolicy>,
    pub checkpoint: Option<bool>,
    pub checkpoint_interval_sec: Option<u64>,
    pub stage_workers: Option<BTreeMap<String, u32>>,
    pub exclusive: Option<bool>,
    pub exclusive_polling_interval_sec: Option<u64>,
    pub exclusive_timeout_sec: Option<u64>,
    pub retention_days: Option<u32>,
    pub estimator: Option<EstimatorOverlay>,
    pub result: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    /// Instance connection settings; only meaningful in the external file
    pub instances: Option<BTreeMap<String, InstanceConfig>>,
}

impl SettingsOverlay {
    /// Overlay `higher` on top of `self`, field by field.
    pub fn merged_with(mut self, higher: SettingsOverlay) -> SettingsOverlay {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if higher.$field.is_some() { self.$field = higher.$field; })*
            };
        }
        take!(
            max_workers,
            retries,
            optimize,
            checkpoint,
            checkpoint_interval_sec,
            stage_workers,
            exclusive,
            exclusive_polling_interval_sec,
            exclusive_timeout_sec,
            retention_days,
            result,
            data_dir,
            checkpoint_dir,
            archive_dir,
            instances
        );
        self.estimator = match (self.estimator, higher.estimator) {
            (Some(lower), Some(upper)) => Some(lower.merged_with(upper)),
            (lower, upper) => upper.or(lower),
        };
        self
    }
}

/// Estimator tuning knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EstimatorOverlay {
    pub alpha: Option<f64>,
    pub min_samples: Option<usize>,
    pub lookback_runs: Option<usize>,
    pub cache_hours: Option<u64>,
    pub time_of_day: Option<bool>,
}

impl EstimatorOverlay {
    fn merged_with(mut self, higher: EstimatorOverlay) -> EstimatorOverlay {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if higher.$field.is_some() { self.$field = higher.$field; })*
            };
        }
        take!(alpha, min_samples, lookback_runs, cache_hours, time_of_day);
        self
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_workers: u32,
    pub retries: u32,
    pub optimize: OrderingPolicy,
    pub checkpoint: bool,
    pub checkpoint_interval_sec: u64,
    pub stage_workers: BTreeMap<String, u32>,
    pub exclusive: bool,
    pub exclusive_polling_interval_sec: u64,
    pub exclusive_timeout_sec: u64,
    pub retention_days: u32,
    pub estimator: EstimatorSettings,
    pub result: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub instances: BTreeMap<String, InstanceConfig>,
}

#[derive(Debug, Clone)]
pub struct EstimatorSettings {
    pub alpha: f64,
    pub min_samples: usize,
    pub lookback_runs: usize,
    pub cache_hours: u64,
    pub time_of_day: bool,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            min_samples: 3,
            lookback_runs: 20,
            cache_hours: 6,
            time_of_day: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: 1,
            retries: 0,
            optimize: OrderingPolicy::Fifo,
            checkpoint: true,
            checkpoint_interval_sec: 60,
            stage_workers: BTreeMap::new(),
            exclusive: false,
            exclusive_polling_interval_sec: 5,
            exclusive_timeout_sec: 600,
            retention_days: 0,
            estimator: EstimatorSettings::default(),
            result: None,
            data_dir: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            archive_dir: PathBuf::from("archive"),
            instances: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Resolve the precedence chain. Overlays are ordered lowest first.
    pub fn resolve(file: Option<SettingsOverlay>, workflow: Option<SettingsOverlay>, cli: SettingsOverlay) -> Self {
        let merged = file
            .unwrap_or_default()
            .merged_with(workflow.unwrap_or_default())
            .merged_with(cli);
        let defaults = Self::default();
        let est_defaults = EstimatorSettings::default();
        let est = merged.estimator.unwrap_or_default();

        Self {
            max_workers: merged.max_workers.unwrap_or(defaults.max_workers).max(1),
            retries: merged.retries.unwrap_or(defaults.retries),
            optimize: merged.optimize.unwrap_or(defaults.optimize),
            checkpoint: merged.checkpoint.unwrap_or(defaults.checkpoint),
            checkpoint_interval_sec: merged
                .checkpoint_interval_sec
                .unwrap_or(defaults.checkpoint_interval_sec)
                .max(1),
            stage_workers: merged.stage_workers.unwrap_or_default(),
            exclusive: merged.exclusive.unwrap_or(defaults.exclusive),
            exclusive_polling_interval_sec: merged
                .exclusive_polling_interval_sec
                .unwrap_or(defaults.exclusive_polling_interval_sec)
                .max(1),
            exclusive_timeout_sec: merged.exclusive_timeout_sec.unwrap_or(defaults.exclusive_timeout_sec),
            retention_days: merged.retention_days.unwrap_or(defaults.retention_days),
            estimator: EstimatorSettings {
                alpha: est.alpha.unwrap_or(est_defaults.alpha).clamp(f64::EPSILON, 1.0),
                min_samples: est.min_samples.unwrap_or(est_defaults.min_samples).max(1),
                lookback_runs: est.lookback_runs.unwrap_or(est_defaults.lookback_runs).max(1),
                cache_hours: est.cache_hours.unwrap_or(est_defaults.cache_hours),
                time_of_day: est.time_of_day.unwrap_or(est_defaults.time_of_day),
            },
            result: merged.result,
            data_dir: merged.data_dir.unwrap_or(defaults.data_dir),
            checkpoint_dir: merged.checkpoint_dir.unwrap_or(defaults.checkpoint_dir),
            archive_dir: merged.archive_dir.unwrap_or(defaults.archive_dir),
            instances: merged.instances.unwrap_or_default(),
        }
    }

    /// Path of the stats database under `data_dir`.
    pub fn stats_db_path(&self) -> PathBuf {
        self.data_dir.join("rushti_stats.sqlite")
    }

    /// Load the external settings overlay, if a file exists.
    pub fn load_file(explicit: Option<&Path>) -> Result<Option<SettingsOverlay>> {
        if let Some(path) = explicit {
            let overlay = Self::read_overlay(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?;
            return Ok(Some(overlay));
        }

        let local = PathBuf::from("rushti.yml");
        if local.exists() {
            match Self::read_overlay(&local) {
                Ok(overlay) => return Ok(Some(overlay)),
                Err(e) => tracing::warn!("Failed to load settings from {}: {e}", local.display()),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("rushti").join("rushti.yml");
            if user.exists() {
                match Self::read_overlay(&user) {
                    Ok(overlay) => return Ok(Some(overlay)),
                    Err(e) => tracing::warn!("Failed to load settings from {}: {e}", user.display()),
                }
            }
        }

        Ok(None)
    }

    fn read_overlay(path: &Path) -> Result<SettingsOverlay> {
        let content = std::fs::read_to_string(path).context("Failed to read settings file")?;
        let overlay = serde_yaml::from_str(&content).context("Failed to parse settings file")?;
        tracing::info!("Loaded settings from: {}", path.display());
        Ok(overlay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(None, None, SettingsOverlay::default());
        assert_eq!(settings.max_workers, 1);
        assert_eq!(settings.retries, 0);
        assert_eq!(settings.optimize, OrderingPolicy::Fifo);
        assert!(settings.checkpoint);
        assert_eq!(settings.checkpoint_interval_sec, 60);
        assert!((settings.estimator.alpha - 0.3).abs() < 1e-9);
        assert_eq!(settings.stats_db_path(), PathBuf::from("data/rushti_stats.sqlite"));
    }

    #[test]
    fn test_precedence_cli_over_workflow_over_file() {
        let file = SettingsOverlay {
            max_workers: Some(2),
            retries: Some(1),
            retention_days: Some(30),
            ..Default::default()
        };
        let workflow = SettingsOverlay {
            max_workers: Some(4),
            optimize: Some(OrderingPolicy::LongestFirst),
            ..Default::default()
        };
        let cli = SettingsOverlay {
            max_workers: Some(8),
            ..Default::default()
        };

        let settings = Settings::resolve(Some(file), Some(workflow), cli);
        assert_eq!(settings.max_workers, 8);
        assert_eq!(settings.retries, 1);
        assert_eq!(settings.optimize, OrderingPolicy::LongestFirst);
        assert_eq!(settings.retention_days, 30);
    }

    #[test]
    fn test_estimator_overlay_merges_per_field() {
        let file = SettingsOverlay {
            estimator: Some(EstimatorOverlay {
                alpha: Some(0.5),
                min_samples: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let workflow = SettingsOverlay {
            estimator: Some(EstimatorOverlay {
                alpha: Some(0.7),
                ..Default::default()
            }),
            ..Default::default()
        };

        let settings = Settings::resolve(Some(file), Some(workflow), SettingsOverlay::default());
        assert!((settings.estimator.alpha - 0.7).abs() < 1e-9);
        assert_eq!(settings.estimator.min_samples, 5);
    }

    #[test]
    fn test_yaml_overlay_parses() {
        let yaml = r#"
max_workers: 6
optimize: longest_first
stage_workers:
  load: 2
  calc: 4
estimator:
  alpha: 0.4
  time_of_day: true
"#;
        let overlay: SettingsOverlay = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(overlay.max_workers, Some(6));
        assert_eq!(overlay.optimize, Some(OrderingPolicy::LongestFirst));
        assert_eq!(overlay.stage_workers.as_ref().unwrap()["calc"], 4);
        assert_eq!(overlay.estimator.as_ref().unwrap().time_of_day, Some(true));
    }

    #[test]
    fn test_zero_max_workers_clamped() {
        let cli = SettingsOverlay {
            max_workers: Some(0),
            ..Default::default()
        };
        let settings = Settings::resolve(None, None, cli);
        assert_eq!(settings.max_workers, 1);
    }
}
