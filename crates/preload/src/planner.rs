//! Preload planning
//!
//! Turns a repository's strategies into a concrete list of blobs to
//! warm. Planning is read-only against the metadata service and runs
//! under a wall-clock budget; when the budget runs out the plan ships
//! with whatever strategies completed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::strategy::StrategySet;
use depot_config::PreloadProperties;
use depot_core::Result;
use depot_engine::NodeQuery;

/// One blob the executor should warm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadItem {
    pub sha256: String,
    pub full_path: String,
    pub size: u64,
    pub credentials_key: Option<String>,
}

#[derive(Debug, Default)]
pub struct PreloadPlan {
    pub items: Vec<PreloadItem>,
    /// Candidates refused by a safety cap
    pub skipped: u64,
}

pub struct PreloadPlanner {
    query: Arc<dyn NodeQuery>,
    properties: PreloadProperties,
}

impl PreloadPlanner {
    pub fn new(query: Arc<dyn NodeQuery>, properties: PreloadProperties) -> Self {
        Self { query, properties }
    }

    pub async fn plan(&self, strategies: &StrategySet) -> Result<PreloadPlan> {
        let deadline = Instant::now() + self.properties.plan_timeout;
        let mut plan = PreloadPlan::default();
        let mut seen: HashSet<String> = HashSet::new();
        let now = Utc::now();

        for strategy in strategies.iter() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    project = strategy.project_id,
                    repo = strategy.repo_name,
                    "plan budget exhausted, shipping a partial plan"
                );
                break;
            }

            let filter = strategy.path_filter()?;
            let window = strategy.window(self.properties.access_record_keep_duration);
            let candidates = self
                .query
                .recent_nodes(&strategy.project_id, &strategy.repo_name, window)
                .await?;

            for candidate in candidates {
                // A slow metadata query must not push the whole run
                // past its budget; re-check between candidates too.
                if Instant::now() >= deadline {
                    break;
                }
                if let Some(filter) = &filter {
                    if !filter.is_match(&candidate.full_path) {
                        continue;
                    }
                }
                // Artifacts past the age ceiling are treated as cold
                let age = (now - candidate.created_at)
                    .to_std()
                    .unwrap_or_default();
                if age > self.properties.max_artifact_exists_duration {
                    plan.skipped += 1;
                    continue;
                }
                // A hash shared by very many nodes is usually a
                // build-system constant, not something worth warming
                if candidate.node_count > self.properties.max_nodes {
                    plan.skipped += 1;
                    continue;
                }
                if !seen.insert(candidate.sha256.clone()) {
                    continue;
                }
                plan.items.push(PreloadItem {
                    sha256: candidate.sha256,
                    full_path: candidate.full_path,
                    size: candidate.size,
                    credentials_key: candidate.credentials_key,
                });
            }
        }

        tracing::debug!(items = plan.items.len(), skipped = plan.skipped, "preload plan built");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{PreloadStrategy, StrategyType};
    use chrono::Duration as ChronoDuration;
    use depot_engine::NodeCandidate;
    use std::time::Duration;

    struct FixedQuery {
        candidates: Vec<NodeCandidate>,
    }

    #[async_trait::async_trait]
    impl NodeQuery for FixedQuery {
        async fn recent_nodes(
            &self,
            _project_id: &str,
            _repo_name: &str,
            _window: Duration,
        ) -> Result<Vec<NodeCandidate>> {
            Ok(self.candidates.clone())
        }
    }

    fn candidate(path: &str, sha256: &str, age_secs: i64, node_count: u64) -> NodeCandidate {
        NodeCandidate {
            full_path: path.into(),
            sha256: sha256.into(),
            size: 1024,
            created_at: Utc::now() - ChronoDuration::seconds(age_secs),
            node_count,
            credentials_key: None,
        }
    }

    fn regex_set(pattern: &str) -> StrategySet {
        let mut set = StrategySet::new();
        set.add(
            PreloadStrategy {
                project_id: "proj".into(),
                repo_name: "repo".into(),
                strategy_type: StrategyType::Regex,
                full_path_regex: Some(pattern.into()),
                recent_seconds: None,
                preload_cron: None,
            },
            10,
        )
        .unwrap();
        set
    }

    #[tokio::test]
    async fn plans_matching_fresh_candidates() {
        let query = Arc::new(FixedQuery {
            candidates: vec![
                candidate("/release/app.tar.gz", "a".repeat(64).as_str(), 60, 1),
                candidate("/snapshots/dev.tar.gz", "b".repeat(64).as_str(), 60, 1),
            ],
        });
        let planner = PreloadPlanner::new(query, PreloadProperties::default());

        let plan = planner.plan(&regex_set(r"^/release/")).await.unwrap();

        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].full_path, "/release/app.tar.gz");
    }

    #[tokio::test]
    async fn old_artifacts_are_refused() {
        let props = PreloadProperties {
            max_artifact_exists_duration: Duration::from_secs(3600),
            ..Default::default()
        };
        let query = Arc::new(FixedQuery {
            candidates: vec![candidate("/release/old.jar", &"a".repeat(64), 7200, 1)],
        });
        let planner = PreloadPlanner::new(query, props);

        let plan = planner.plan(&regex_set(".*")).await.unwrap();

        assert!(plan.items.is_empty());
        assert_eq!(plan.skipped, 1);
    }

    #[tokio::test]
    async fn widely_shared_hashes_are_refused() {
        let props = PreloadProperties {
            max_nodes: 5,
            ..Default::default()
        };
        let query = Arc::new(FixedQuery {
            candidates: vec![candidate("/release/common.bin", &"a".repeat(64), 60, 500)],
        });
        let planner = PreloadPlanner::new(query, props);

        let plan = planner.plan(&regex_set(".*")).await.unwrap();

        assert!(plan.items.is_empty());
        assert_eq!(plan.skipped, 1);
    }

    #[tokio::test]
    async fn duplicate_hashes_are_planned_once() {
        let query = Arc::new(FixedQuery {
            candidates: vec![
                candidate("/release/a.jar", &"a".repeat(64), 60, 1),
                candidate("/release/copy-of-a.jar", &"a".repeat(64), 60, 1),
            ],
        });
        let planner = PreloadPlanner::new(query, PreloadProperties::default());

        let plan = planner.plan(&regex_set(".*")).await.unwrap();
        assert_eq!(plan.items.len(), 1);
    }

    #[tokio::test]
    async fn an_exhausted_budget_ships_a_partial_plan() {
        let props = PreloadProperties {
            plan_timeout: Duration::ZERO,
            ..Default::default()
        };
        let query = Arc::new(FixedQuery {
            candidates: vec![candidate("/release/a.jar", &"a".repeat(64), 60, 1)],
        });
        let planner = PreloadPlanner::new(query, props);

        let plan = planner.plan(&regex_set(".*")).await.unwrap();
        assert!(plan.items.is_empty());
    }
}
