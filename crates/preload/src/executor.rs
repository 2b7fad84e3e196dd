//! Preload execution
//!
//! Executes a plan by pulling each blob through the dispatcher, which
//! routes remote reads through the cache layer and thereby warms the
//! mirror. Runs inside a scheduled window (a per-strategy cron or the
//! installation's preload hours, jittered so a fleet does not start in
//! lockstep) with a bounded worker pool. Mock mode logs what would be
//! fetched without touching the backend.

use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::planner::PreloadPlan;
use depot_config::PreloadProperties;
use depot_engine::StorageDispatcher;

/// Outcome of one executed plan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PreloadStats {
    pub planned: u64,
    pub preloaded: u64,
    pub failed: u64,
    /// Items not fetched (mock mode, disabled engine, or budget exhaustion)
    pub skipped: u64,
}

pub struct PreloadExecutor {
    dispatcher: Arc<StorageDispatcher>,
    properties: PreloadProperties,
}

impl PreloadExecutor {
    pub fn new(dispatcher: Arc<StorageDispatcher>, properties: PreloadProperties) -> Self {
        Self {
            dispatcher,
            properties,
        }
    }

    /// How long to wait before the next preload window opens.
    ///
    /// A strategy cron wins when present; otherwise the nearest
    /// configured hour of day, pulled forward by a random jitter so
    /// many installations do not hit the backend at the same second.
    pub fn delay_until_window(
        &self,
        schedule: Option<&cron::Schedule>,
        now: DateTime<Utc>,
    ) -> Duration {
        if let Some(schedule) = schedule {
            return schedule
                .after(&now)
                .next()
                .and_then(|next| (next - now).to_std().ok())
                .unwrap_or_default();
        }

        let mut nearest: Option<Duration> = None;
        for &hour in &self.properties.preload_hour_of_day {
            if hour > 23 {
                tracing::warn!(hour, "ignoring out-of-range preload hour");
                continue;
            }
            let today = now
                .with_hour(u32::from(hour))
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            let next = if today > now {
                today
            } else {
                today + chrono::Duration::days(1)
            };
            let delta = (next - now).to_std().unwrap_or_default();
            nearest = Some(nearest.map_or(delta, |best| best.min(delta)));
        }

        let base = nearest.unwrap_or_default();
        let jitter = Duration::from_secs(fastrand::u64(0..=self.properties.max_random_seconds));
        base.saturating_sub(jitter)
    }

    /// Run a plan; one failing item never stops the rest.
    ///
    /// The wall-clock budget that bounded planning also bounds the run:
    /// once it is exceeded the remaining items are abandoned as skipped
    /// while everything already preloaded stays in the cache.
    pub async fn execute(&self, plan: PreloadPlan) -> PreloadStats {
        let mut stats = PreloadStats {
            planned: plan.items.len() as u64,
            ..Default::default()
        };

        if !self.properties.enabled {
            tracing::debug!(planned = stats.planned, "preload disabled, not fetching");
            stats.skipped = stats.planned;
            return stats;
        }

        if self.properties.mock {
            for item in &plan.items {
                tracing::info!(
                    sha256 = item.sha256,
                    path = item.full_path,
                    size = item.size,
                    "mock preload, not fetching"
                );
            }
            stats.skipped = stats.planned;
            return stats;
        }

        let deadline = tokio::time::Instant::now() + self.properties.plan_timeout;
        let semaphore = Arc::new(Semaphore::new(self.properties.preload_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut items = plan.items.into_iter();
        while let Some(item) = items.next() {
            if tokio::time::Instant::now() >= deadline {
                let abandoned = 1 + items.len() as u64;
                tracing::warn!(abandoned, "preload budget exhausted, abandoning remaining items");
                stats.skipped += abandoned;
                break;
            }
            let dispatcher = Arc::clone(&self.dispatcher);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closes");
                let result = dispatcher
                    .load(&item.sha256, item.credentials_key.as_deref())
                    .await;
                match result {
                    Ok(_reader) => {
                        // Reaching the reader means the cache layer
                        // already mirrored the blob
                        tracing::debug!(sha256 = item.sha256, "preloaded");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(sha256 = item.sha256, error = %e, "preload failed");
                        false
                    }
                }
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => match joined {
                    Ok(true) => stats.preloaded += 1,
                    Ok(false) => stats.failed += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, "preload task panicked");
                        stats.failed += 1;
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    let abandoned = tasks.len() as u64;
                    tracing::warn!(abandoned, "preload budget exhausted, abandoning in-flight items");
                    tasks.shutdown().await;
                    stats.skipped += abandoned;
                    break;
                }
            }
        }

        tracing::info!(
            planned = stats.planned,
            preloaded = stats.preloaded,
            failed = stats.failed,
            skipped = stats.skipped,
            "preload run finished"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PreloadItem;
    use chrono::TimeZone;
    use depot_config::resolver::StaticCredentialsSource;
    use depot_config::{BackendKind, CredentialsResolver, StorageCredentials};
    use depot_core::events::EventEmitter;
    use depot_core::{Error, Result};
    use depot_storage::{ArtifactFile, ArtifactReader, FileStorage, ShardedLocate};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRemote {
        objects: dashmap::DashMap<String, Vec<u8>>,
        loads: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl FileStorage for CountingRemote {
        async fn store(
            &self,
            path: &str,
            name: &str,
            artifact: &ArtifactFile,
            _credentials: &StorageCredentials,
        ) -> Result<bool> {
            let data = artifact.reader().await?.read_to_vec().await?;
            self.objects.insert(format!("{path}/{name}"), data);
            Ok(true)
        }

        async fn load(
            &self,
            path: &str,
            name: &str,
            _credentials: &StorageCredentials,
        ) -> Result<ArtifactReader> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let data = self
                .objects
                .get(&format!("{path}/{name}"))
                .map(|e| e.clone())
                .ok_or_else(|| Error::not_found(name))?;
            Ok(ArtifactReader::from_bytes(data.into()))
        }

        async fn delete(
            &self,
            path: &str,
            name: &str,
            _credentials: &StorageCredentials,
        ) -> Result<()> {
            self.objects.remove(&format!("{path}/{name}"));
            Ok(())
        }

        async fn exist(
            &self,
            path: &str,
            name: &str,
            _credentials: &StorageCredentials,
        ) -> Result<bool> {
            Ok(self.objects.contains_key(&format!("{path}/{name}")))
        }
    }

    fn fixture(mock: bool) -> (Arc<CountingRemote>, PreloadExecutor, tempfile::TempDir) {
        fixture_with(PreloadProperties {
            enabled: true,
            mock,
            ..Default::default()
        })
    }

    fn fixture_with(
        properties: PreloadProperties,
    ) -> (Arc<CountingRemote>, PreloadExecutor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut creds = StorageCredentials {
            key: "default".into(),
            backend: depot_config::BackendConfig::S3 {
                endpoint: "http://unused".into(),
                region: "r".into(),
                bucket: "b".into(),
                access_key_id: "ak".into(),
                secret_access_key: "sk".into(),
                part_size: 8 * 1024 * 1024,
            },
            cache: Default::default(),
            upload: Default::default(),
        };
        creds.cache.enabled = true;
        creds.cache.path = dir.path().join("mirror");
        creds.cache.expire = Duration::from_secs(3600);
        creds.upload.location = dir.path().join("upload");

        let resolver = Arc::new(CredentialsResolver::new(
            Arc::new(StaticCredentialsSource::new(vec![])),
            creds,
            16,
            Duration::from_secs(60),
        ));
        let remote = Arc::new(CountingRemote {
            objects: dashmap::DashMap::new(),
            loads: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(
            StorageDispatcher::new(
                resolver,
                ShardedLocate::default(),
                Arc::new(EventEmitter::default()),
                properties.clone(),
            )
            .with_driver(BackendKind::S3, remote.clone()),
        );
        (remote, PreloadExecutor::new(dispatcher, properties), dir)
    }

    fn item(sha256: &str) -> PreloadItem {
        PreloadItem {
            sha256: sha256.into(),
            full_path: "/release/app.tar.gz".into(),
            size: 1024,
            credentials_key: None,
        }
    }

    #[tokio::test]
    async fn executing_a_plan_warms_the_cache() {
        let (remote, executor, _dir) = fixture(false);
        let hash_a = "a".repeat(64);
        let hash_b = "b".repeat(64);
        remote
            .objects
            .insert(format!("aa/aa/{hash_a}"), b"blob a".to_vec());
        remote
            .objects
            .insert(format!("bb/bb/{hash_b}"), b"blob b".to_vec());

        let plan = PreloadPlan {
            items: vec![item(&hash_a), item(&hash_b)],
            skipped: 0,
        };
        let stats = executor.execute(plan).await;

        assert_eq!(stats.preloaded, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(remote.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_isolated_per_item() {
        let (remote, executor, _dir) = fixture(false);
        let present = "a".repeat(64);
        remote
            .objects
            .insert(format!("aa/aa/{present}"), b"blob a".to_vec());

        let plan = PreloadPlan {
            items: vec![item(&present), item(&"c".repeat(64))],
            skipped: 0,
        };
        let stats = executor.execute(plan).await;

        assert_eq!(stats.preloaded, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn mock_mode_fetches_nothing() {
        let (remote, executor, _dir) = fixture(true);

        let plan = PreloadPlan {
            items: vec![item(&"a".repeat(64))],
            skipped: 0,
        };
        let stats = executor.execute(plan).await;

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.preloaded, 0);
        assert_eq!(remote.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_disabled_engine_fetches_nothing() {
        let (remote, executor, _dir) = fixture_with(PreloadProperties::default());
        let hash = "a".repeat(64);
        remote
            .objects
            .insert(format!("aa/aa/{hash}"), b"blob a".to_vec());

        let plan = PreloadPlan {
            items: vec![item(&hash)],
            skipped: 0,
        };
        let stats = executor.execute(plan).await;

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.preloaded, 0);
        assert_eq!(remote.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn an_exhausted_budget_abandons_remaining_items() {
        let (remote, executor, _dir) = fixture_with(PreloadProperties {
            enabled: true,
            plan_timeout: Duration::ZERO,
            ..Default::default()
        });
        let hash = "a".repeat(64);
        remote
            .objects
            .insert(format!("aa/aa/{hash}"), b"blob a".to_vec());

        let plan = PreloadPlan {
            items: vec![item(&hash), item(&"b".repeat(64))],
            skipped: 0,
        };
        let stats = executor.execute(plan).await;

        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.preloaded, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(remote.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hour_of_day_delay_is_jittered_within_bounds() {
        let (_remote, executor, _dir) = fixture(false);
        // Defaults: preload at 02:00, jitter up to 600 seconds
        let midnight = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        for _ in 0..20 {
            let delay = executor.delay_until_window(None, midnight);
            assert!(delay <= Duration::from_secs(2 * 3600));
            assert!(delay >= Duration::from_secs(2 * 3600 - 600));
        }
    }

    #[test]
    fn a_cron_schedule_overrides_the_preload_hours() {
        let (_remote, executor, _dir) = fixture(false);
        let midnight = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let schedule = cron::Schedule::from_str("0 0 3 * * *").unwrap();

        let delay = executor.delay_until_window(Some(&schedule), midnight);
        assert_eq!(delay, Duration::from_secs(3 * 3600));
    }
}
