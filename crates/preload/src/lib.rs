//! Cache preloading
//!
//! Repositories declare strategies for which artifacts should be warm
//! in the local cache before anyone asks for them. The planner turns
//! strategies into a bounded plan against the metadata service, the
//! executor pulls the planned blobs through the cache layer inside a
//! scheduled window. Every stage carries a safety cap so a
//! misconfigured strategy cannot flood the backend.

pub mod executor;
pub mod planner;
pub mod strategy;

pub use executor::{PreloadExecutor, PreloadStats};
pub use planner::{PreloadItem, PreloadPlan, PreloadPlanner};
pub use strategy::{PreloadStrategy, StrategySet, StrategyType};
