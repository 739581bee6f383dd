//! Real-time analytics core for WikiSurge.
//!
//! Five independent broker consumers fan out over the live edit stream:
//! the hot-page tracker, spike detector, trending scorer, edit-war detector
//! and selective indexer. All mutable state lives in the storage substrate
//! behind [`store::Store`]; alerts land on capped streams tailed by the
//! [`alerts::hub::AlertHub`].

pub mod alerts;
pub mod consumer;
pub mod editwar;
pub mod error;
pub mod indexer;
pub mod keys;
pub mod metrics;
pub mod spike;
pub mod store;
pub mod tracker;
pub mod trending;

pub use error::{Result, SurgeError};
pub use metrics::Metrics;
