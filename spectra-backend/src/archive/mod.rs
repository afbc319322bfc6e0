//! Archive sync: incremental, checkpointed content capture per target

pub mod checksum;
pub mod sync;

pub use sync::{ArchiveSync, IntegrityReport, SyncReport};
