use crate::core::errors::{FlowError, Result};
use crate::core::limits::PoolLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where a dependent step runs once its join releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// Continue on the task whose arrival released the join
    Inline,
    /// Submit the step to the execution facility as a new task
    Submit,
}

/// Configuration for the underwriting orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Maximum number of units of work executing at once
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Deadline for each remote lookup (None = no deadline)
    #[serde(default = "default_step_timeout_ms")]
    pub fetch_timeout_ms: Option<u64>,
    /// Deadline for each scoring step
    #[serde(default = "default_step_timeout_ms")]
    pub scoring_timeout_ms: Option<u64>,
    /// Deadline for the final decision step
    #[serde(default = "default_step_timeout_ms")]
    pub decision_timeout_ms: Option<u64>,
    /// How scoring steps run after their inputs arrive
    #[serde(default = "default_score_dispatch")]
    pub score_dispatch: Dispatch,
    /// How the decision step runs after both scores arrive
    #[serde(default = "default_decision_dispatch")]
    pub decision_dispatch: Dispatch,
}

fn default_max_workers() -> usize {
    4
}

fn default_step_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_score_dispatch() -> Dispatch {
    Dispatch::Inline
}

fn default_decision_dispatch() -> Dispatch {
    Dispatch::Submit
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            fetch_timeout_ms: default_step_timeout_ms(),
            scoring_timeout_ms: default_step_timeout_ms(),
            decision_timeout_ms: default_step_timeout_ms(),
            score_dispatch: default_score_dispatch(),
            decision_dispatch: default_decision_dispatch(),
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(FlowError::configuration(
                "max_workers must be greater than 0",
            ));
        }
        for (field, value) in [
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("scoring_timeout_ms", self.scoring_timeout_ms),
            ("decision_timeout_ms", self.decision_timeout_ms),
        ] {
            if value == Some(0) {
                return Err(FlowError::configuration(format!(
                    "{} must be greater than 0 when set",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Short deadlines and a small pool, for tests
    pub fn conservative() -> Self {
        Self {
            max_workers: 2,
            fetch_timeout_ms: Some(2_000),
            scoring_timeout_ms: Some(2_000),
            decision_timeout_ms: Some(2_000),
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: FlowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FlowConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, choosing the format from its extension
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FlowError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(FlowError::configuration(format!(
                "unsupported config extension: {:?}",
                other
            ))),
        }
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_workers: self.max_workers,
        }
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    pub fn scoring_timeout(&self) -> Option<Duration> {
        self.scoring_timeout_ms.map(Duration::from_millis)
    }

    pub fn decision_timeout(&self) -> Option<Duration> {
        self.decision_timeout_ms.map(Duration::from_millis)
    }
}
