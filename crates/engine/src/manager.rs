//! Storage manager: the store-then-register saga
//!
//! An upload is only complete once the blob sits in the backend AND the
//! metadata service has a node for it. The blob is stored first; when
//! node creation then fails, a freshly written blob is compensated by a
//! best-effort delete. A dedup hit is never compensated, the blob
//! belongs to other nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::StorageDispatcher;
use crate::ledger::ReferenceLedger;
use depot_core::Result;
use depot_storage::{ArtifactFile, ArtifactReader};

/// Caller-supplied identity of the node being created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCreateRequest {
    pub project_id: String,
    pub repo_name: String,
    pub full_path: String,
    pub credentials_key: Option<String>,
}

/// A stored node as the metadata service records it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    pub id: String,
    pub project_id: String,
    pub repo_name: String,
    pub full_path: String,
    pub size: u64,
    pub sha256: String,
    pub md5: String,
    pub sha1: String,
    pub crc64: u64,
    pub credentials_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata service surface the saga talks to
#[async_trait::async_trait]
pub trait NodeService: Send + Sync {
    async fn create_node(&self, node: NodeDetail) -> Result<NodeDetail>;
    async fn delete_node(&self, id: &str) -> Result<()>;
}

/// A node candidate as seen by preload planning
#[derive(Debug, Clone)]
pub struct NodeCandidate {
    pub full_path: String,
    pub sha256: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// How many nodes share this hash across the installation
    pub node_count: u64,
    pub credentials_key: Option<String>,
}

/// Read-side metadata queries
#[async_trait::async_trait]
pub trait NodeQuery: Send + Sync {
    /// Nodes created within the recent window for one repository
    async fn recent_nodes(
        &self,
        project_id: &str,
        repo_name: &str,
        window: Duration,
    ) -> Result<Vec<NodeCandidate>>;
}

pub struct StorageManager {
    dispatcher: Arc<StorageDispatcher>,
    nodes: Arc<dyn NodeService>,
    ledger: Arc<dyn ReferenceLedger>,
}

impl StorageManager {
    pub fn new(
        dispatcher: Arc<StorageDispatcher>,
        nodes: Arc<dyn NodeService>,
        ledger: Arc<dyn ReferenceLedger>,
    ) -> Self {
        Self {
            dispatcher,
            nodes,
            ledger,
        }
    }

    pub fn dispatcher(&self) -> &Arc<StorageDispatcher> {
        &self.dispatcher
    }

    /// Store an artifact and register its node.
    ///
    /// Ordering matters: a blob without a node is invisible garbage an
    /// out-of-band job can reclaim, a node without a blob is a dangling
    /// reference served to users. So the blob goes first.
    pub async fn store_artifact_file(
        &self,
        artifact: &ArtifactFile,
        request: NodeCreateRequest,
    ) -> Result<NodeDetail> {
        let digests = artifact.digests().await?.clone();
        let credentials_key = request.credentials_key.as_deref();

        let newly_written = self
            .dispatcher
            .store(&digests.sha256, artifact, credentials_key)
            .await?;
        if !newly_written {
            tracing::debug!(sha256 = digests.sha256, "dedup hit, blob already stored");
        }

        let node = NodeDetail {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: request.project_id,
            repo_name: request.repo_name,
            full_path: request.full_path,
            size: artifact.size(),
            sha256: digests.sha256.clone(),
            md5: digests.md5,
            sha1: digests.sha1,
            crc64: digests.crc64,
            credentials_key: request.credentials_key.clone(),
            created_at: Utc::now(),
        };

        let created = match self.nodes.create_node(node).await {
            Ok(created) => created,
            Err(e) => {
                // Compensate only what this call wrote. A dedup hit
                // means other nodes own the blob.
                if newly_written {
                    if let Err(delete_err) = self
                        .dispatcher
                        .delete(&digests.sha256, credentials_key)
                        .await
                    {
                        tracing::warn!(
                            sha256 = digests.sha256,
                            error = %delete_err,
                            "saga compensation delete failed"
                        );
                    }
                }
                return Err(e);
            }
        };

        self.ledger
            .increment(&digests.sha256, credentials_key)
            .await?;
        Ok(created)
    }

    /// Delete a node and drop its blob reference.
    ///
    /// The blob itself stays even at zero references; reclamation runs
    /// out-of-band after a grace period, which keeps an interleaved
    /// re-upload of the same hash safe.
    pub async fn delete_node(&self, node: &NodeDetail) -> Result<u64> {
        self.nodes.delete_node(&node.id).await?;
        let remaining = self
            .ledger
            .decrement(&node.sha256, node.credentials_key.as_deref())
            .await?;
        tracing::debug!(sha256 = node.sha256, remaining, "node deleted");
        Ok(remaining)
    }

    /// Load the blob a node points at
    pub async fn load_artifact(&self, node: &NodeDetail) -> Result<ArtifactReader> {
        self.dispatcher
            .load(&node.sha256, node.credentials_key.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FileReferenceLedger;
    use depot_config::resolver::StaticCredentialsSource;
    use depot_config::{
        BackendKind, CredentialsResolver, PreloadProperties, StorageCredentials,
    };
    use depot_core::events::EventEmitter;
    use depot_core::Error;
    use depot_storage::{FilesystemStorage, ShardedLocate};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeNodeService {
        nodes: Mutex<Vec<NodeDetail>>,
        fail_create: AtomicBool,
    }

    impl FakeNodeService {
        fn new() -> Self {
            Self {
                nodes: Mutex::new(Vec::new()),
                fail_create: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl NodeService for FakeNodeService {
        async fn create_node(&self, node: NodeDetail) -> Result<NodeDetail> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(Error::metadata("node service unavailable"));
            }
            self.nodes.lock().push(node.clone());
            Ok(node)
        }

        async fn delete_node(&self, id: &str) -> Result<()> {
            self.nodes.lock().retain(|n| n.id != id);
            Ok(())
        }
    }

    struct Fixture {
        manager: StorageManager,
        nodes: Arc<FakeNodeService>,
        root: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let resolver = Arc::new(CredentialsResolver::new(
            Arc::new(StaticCredentialsSource::new(vec![])),
            StorageCredentials::filesystem("default", root.path()),
            16,
            Duration::from_secs(60),
        ));
        let dispatcher = Arc::new(
            StorageDispatcher::new(
                resolver,
                ShardedLocate::default(),
                Arc::new(EventEmitter::default()),
                PreloadProperties::default(),
            )
            .with_driver(BackendKind::Filesystem, Arc::new(FilesystemStorage::new())),
        );
        let nodes = Arc::new(FakeNodeService::new());
        let ledger = Arc::new(
            FileReferenceLedger::open(root.path().join("ledger.json"))
                .await
                .unwrap(),
        );
        Fixture {
            manager: StorageManager::new(dispatcher, nodes.clone(), ledger),
            nodes,
            root,
        }
    }

    fn request() -> NodeCreateRequest {
        NodeCreateRequest {
            project_id: "proj".into(),
            repo_name: "repo".into(),
            full_path: "/release/app.tar.gz".into(),
            credentials_key: None,
        }
    }

    #[tokio::test]
    async fn store_registers_node_and_reference() {
        let fx = fixture().await;
        let artifact = ArtifactFile::from_bytes(&b"hello world"[..], fx.root.path());

        let node = fx
            .manager
            .store_artifact_file(&artifact, request())
            .await
            .unwrap();

        assert_eq!(
            node.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(fx.nodes.nodes.lock().len(), 1);
        assert!(fx.manager.dispatcher().exist(&node.sha256, None).await.unwrap());

        let loaded = fx.manager.load_artifact(&node).await.unwrap();
        assert_eq!(loaded.read_to_vec().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn failed_registration_compensates_a_fresh_blob() {
        let fx = fixture().await;
        let artifact = ArtifactFile::from_bytes(&b"doomed upload"[..], fx.root.path());
        let sha256 = artifact.sha256().await.unwrap();
        fx.nodes.fail_create.store(true, Ordering::SeqCst);

        let err = fx
            .manager
            .store_artifact_file(&artifact, request())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("node service unavailable"));
        assert!(!fx.manager.dispatcher().exist(&sha256, None).await.unwrap());
    }

    #[tokio::test]
    async fn failed_registration_keeps_a_dedup_hit_blob() {
        let fx = fixture().await;
        let artifact = ArtifactFile::from_bytes(&b"shared content"[..], fx.root.path());
        let sha256 = artifact.sha256().await.unwrap();

        // First upload succeeds and owns the blob
        fx.manager
            .store_artifact_file(&artifact, request())
            .await
            .unwrap();

        // Second upload of the same content fails at registration
        fx.nodes.fail_create.store(true, Ordering::SeqCst);
        let again = ArtifactFile::from_bytes(&b"shared content"[..], fx.root.path());
        fx.manager
            .store_artifact_file(&again, request())
            .await
            .unwrap_err();

        // The blob survives, the first node still references it
        assert!(fx.manager.dispatcher().exist(&sha256, None).await.unwrap());
    }

    #[tokio::test]
    async fn delete_decrements_but_keeps_the_blob() {
        let fx = fixture().await;

        // Two nodes share one blob
        let first = fx
            .manager
            .store_artifact_file(
                &ArtifactFile::from_bytes(&b"shared"[..], fx.root.path()),
                request(),
            )
            .await
            .unwrap();
        let second = fx
            .manager
            .store_artifact_file(
                &ArtifactFile::from_bytes(&b"shared"[..], fx.root.path()),
                request(),
            )
            .await
            .unwrap();
        assert_eq!(first.sha256, second.sha256);

        assert_eq!(fx.manager.delete_node(&first).await.unwrap(), 1);
        assert_eq!(fx.manager.delete_node(&second).await.unwrap(), 0);

        // Zero references, but reclamation is out-of-band
        assert!(fx.manager.dispatcher().exist(&first.sha256, None).await.unwrap());
        assert!(fx.nodes.nodes.lock().is_empty());

        // A re-upload after full deletion is a plain store again
        let third = fx
            .manager
            .store_artifact_file(
                &ArtifactFile::from_bytes(&b"shared"[..], fx.root.path()),
                request(),
            )
            .await
            .unwrap();
        assert_eq!(third.sha256, first.sha256);
    }
}
