//! Prearchive ingestion state machine and catalog merge engine.
//!
//! Incoming imaging sessions sit in a quarantine area while their metadata
//! is rebuilt and validated. Lifecycle operations (rebuild, archive, move,
//! separate, delete) are dispatched through a uniform handler interface and
//! serialized per session by an optimistic compare-and-set on the session's
//! status row — the only mutex in the system. The catalog merge engine
//! reconciles overlapping file manifests without destroying data, deferring
//! destructive filesystem actions until the bulk directory merge has
//! physically succeeded.
#![allow(missing_docs)]

pub mod anonymize;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod ops;
pub mod routing;
pub mod session;
pub mod store;

pub use error::{ArchiveError, Result};
