//! Catalog handling: the merge engine plus catalog-file I/O.

pub mod io;
pub mod merge;

pub use io::{
    append_history, formalize, history_catalog_path, load_catalog, persist_catalog,
    try_load_catalog,
};
pub use merge::{CatalogMerger, DeferredAction, FileSnapshot, MergeOptions, MergeResult};
