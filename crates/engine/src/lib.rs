//! The depot storage engine
//!
//! Ties the lower layers together: the dispatcher routes hash-keyed
//! operations to the right backend driver (cache-wrapped for remote
//! backends), the reference ledger counts node references per blob, the
//! storage manager runs the store-then-register saga against the
//! metadata service, and the reconcile walker converges a local blob
//! tree onto its backend.

pub mod dispatcher;
pub mod ledger;
pub mod manager;
pub mod reconcile;

pub use dispatcher::StorageDispatcher;
pub use ledger::{FileReferenceLedger, ReferenceLedger};
pub use manager::{
    NodeCandidate, NodeCreateRequest, NodeDetail, NodeQuery, NodeService, StorageManager,
};
pub use reconcile::{ReconcileStats, ReconcileWalker};
