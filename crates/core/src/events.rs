//! Event system for cache lifecycle notifications
//!
//! The cache layer publishes events when it loads, serves, or evicts a
//! local mirror so accounting collaborators can observe traffic without
//! being on the read path. Subscriber failures are isolated per
//! subscriber and never propagate back to the publisher.

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::errors::Result;

/// Cache lifecycle events
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StorageEvent {
    /// A cache miss was filled from the remote backend
    CacheFileLoaded {
        credentials_key: String,
        path: String,
        filename: String,
        size: u64,
    },
    /// A cached file served a read and passed the bookkeeping rate limit
    CacheFileAccessed {
        credentials_key: String,
        path: String,
        filename: String,
        size: u64,
    },
    /// A cached file was removed by eviction
    CacheFileDeleted {
        credentials_key: String,
        path: String,
        filename: String,
        size: u64,
    },
}

impl StorageEvent {
    /// The filename (content hash) the event refers to
    pub fn filename(&self) -> &str {
        match self {
            StorageEvent::CacheFileLoaded { filename, .. }
            | StorageEvent::CacheFileAccessed { filename, .. }
            | StorageEvent::CacheFileDeleted { filename, .. } => filename,
        }
    }
}

/// Subscriber for storage events
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Subscriber name, used in logs when handling fails
    fn name(&self) -> &str;

    /// Whether this subscriber wants the event at all
    fn interested(&self, _event: &StorageEvent) -> bool {
        true
    }

    /// Handle one event. Errors are logged by the emitter, never re-raised.
    async fn handle(&self, event: &StorageEvent) -> Result<()>;
}

/// Event emitter for publishing storage events
///
/// Constructed once at startup and passed down through constructors;
/// there is no global emitter.
pub struct EventEmitter {
    sender: broadcast::Sender<StorageEvent>,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventEmitter {
    /// Create a new emitter with the given broadcast channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber
    pub async fn add_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) {
        let mut subscribers = self.subscribers.write().await;
        debug!(subscriber = subscriber.name(), "event subscriber added");
        subscribers.push(subscriber);
    }

    /// Subscribe to the raw broadcast stream
    pub fn stream(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to the channel and every interested subscriber.
    ///
    /// Publish failures are swallowed: a notification problem must never
    /// fail the storage operation that produced the event.
    pub async fn emit(&self, event: StorageEvent) {
        // A lagging or absent receiver is not an error
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("no broadcast receivers for storage event: {e}");
        }

        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            if !subscriber.interested(&event) {
                continue;
            }
            if let Err(e) = subscriber.handle(&event).await {
                warn!(
                    subscriber = subscriber.name(),
                    error = %e,
                    "event subscriber failed, continuing"
                );
            }
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
