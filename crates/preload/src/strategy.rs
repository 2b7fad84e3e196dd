//! Preload strategies
//!
//! A strategy names one repository and a selection rule: a regex over
//! artifact paths, a recency window, or both, optionally with its own
//! cron expression for when the preload window opens. Strategies are
//! validated on admission and capped per repository.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use depot_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// Preload artifacts whose path matches the regex
    Regex,
    /// Preload artifacts created within the recency window
    Recency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadStrategy {
    pub project_id: String,
    pub repo_name: String,
    pub strategy_type: StrategyType,
    /// Path filter, required for `Regex` strategies
    pub full_path_regex: Option<String>,
    /// Recency window in seconds, required for `Recency` strategies
    pub recent_seconds: Option<u64>,
    /// Cron expression overriding the installation-wide preload hours
    pub preload_cron: Option<String>,
}

impl PreloadStrategy {
    /// Check the strategy is well-formed before admitting it
    pub fn validate(&self) -> Result<()> {
        match self.strategy_type {
            StrategyType::Regex => {
                let pattern = self.full_path_regex.as_deref().ok_or_else(|| {
                    Error::config("regex strategy without a full_path_regex")
                })?;
                Regex::new(pattern)
                    .map_err(|e| Error::config(format!("invalid preload regex: {e}")))?;
            }
            StrategyType::Recency => {
                if self.recent_seconds.is_none() {
                    return Err(Error::config("recency strategy without recent_seconds"));
                }
            }
        }
        if let Some(expr) = &self.preload_cron {
            cron::Schedule::from_str(expr)
                .map_err(|e| Error::config(format!("invalid preload cron '{expr}': {e}")))?;
        }
        Ok(())
    }

    /// The compiled path filter, if one is configured
    pub fn path_filter(&self) -> Result<Option<Regex>> {
        self.full_path_regex
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| Error::config(format!("invalid preload regex: {e}")))
            })
            .transpose()
    }

    /// The per-strategy cron schedule, if one is configured
    pub fn schedule(&self) -> Result<Option<cron::Schedule>> {
        self.preload_cron
            .as_deref()
            .map(|expr| {
                cron::Schedule::from_str(expr)
                    .map_err(|e| Error::config(format!("invalid preload cron '{expr}': {e}")))
            })
            .transpose()
    }

    /// The candidate window this strategy queries over
    pub fn window(&self, fallback: Duration) -> Duration {
        self.recent_seconds
            .map(Duration::from_secs)
            .unwrap_or(fallback)
    }
}

/// The strategies of one repository, bounded by the installation cap
#[derive(Debug, Default)]
pub struct StrategySet {
    strategies: Vec<PreloadStrategy>,
}

impl StrategySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and admit a strategy; refused beyond `max_count`
    pub fn add(&mut self, strategy: PreloadStrategy, max_count: usize) -> Result<()> {
        strategy.validate()?;
        if self.strategies.len() >= max_count {
            return Err(Error::config(format!(
                "repository '{}/{}' already has {max_count} preload strategies",
                strategy.project_id, strategy.repo_name
            )));
        }
        self.strategies.push(strategy);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PreloadStrategy> {
        self.strategies.iter()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
