pub mod allocator;
pub mod config;
pub mod error;
pub mod model;
pub mod notify;
pub mod observability;
pub mod randomising;
pub mod registry;
pub mod repository;
pub mod store;
pub mod sync;

pub use error::{Result, TrialError};
pub use notify::{ChangeEvent, ChangeKind, ChangedRecord};
pub use randomising::AllocationOutcome;
pub use repository::{ExportOutcome, Repository, SyncReport};
