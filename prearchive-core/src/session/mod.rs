//! Session-level engines: rebuilding the metadata document from disk and
//! merging an incoming session into an archived destination.

pub mod merge;
pub mod rebuild;

pub use merge::{ArchiveOptions, ArchiveOutcome, SessionMergeEngine};
pub use rebuild::{load_document, persist_document, rebuild_document};
