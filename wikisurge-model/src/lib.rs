//! Core data model definitions shared across WikiSurge crates.
#![allow(missing_docs)]

pub mod alert;
pub mod document;
pub mod edit;
pub mod stats;

// Intentionally curated re-exports for downstream consumers.
pub use alert::{Alert, AlertKind, AlertPayload, Severity};
pub use document::{IndexReason, IndexedDocument, document_id};
pub use edit::{Edit, EventType, language_from_wiki};
pub use stats::PageStats;
