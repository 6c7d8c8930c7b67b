//! Snapshot exchange through shared folders: export, discovery and merge.

pub mod discovery;
pub mod export;
pub mod merge;

pub use discovery::{ArchivePair, discover, extract, mark_merged};
pub use export::{archive_path, archive_stem, needs_export, write_archive};
pub use merge::{MergeReport, merge_store};
