//! Convenience re-exports for downstream crates.

pub use crate::catalog::{Catalog, CatalogEntry, EntryLocator};
pub use crate::document::{Modality, Resource, Scan, SessionDocument};
pub use crate::error::{ModelError, Result as ModelResult};
pub use crate::session::{AutoArchivePolicy, SessionKey, SessionRecord, SessionStatus};
