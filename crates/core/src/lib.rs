//! Core types for the depot storage engine.
//!
//! This crate carries the pieces every other depot crate depends on:
//! the error taxonomy and the in-process event system used for cache
//! lifecycle notifications.

pub mod errors;
pub mod events;

pub use errors::{Error, Result};
pub use events::{EventEmitter, EventSubscriber, StorageEvent};
