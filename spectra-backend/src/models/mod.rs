//! Domain models shared by the store, the pools and the engines

pub mod checkpoint;
pub mod credential;
pub mod egress;
pub mod message;
pub mod target;
pub mod task_run;

pub use checkpoint::Checkpoint;
pub use credential::{Credential, CredentialHealth, CredentialStatus};
pub use egress::{EgressRoute, RouteHealth, RouteStatus};
pub use message::{
    ArchiveRow, ArchivedMedia, ArchivedMessage, ArchivedUser, BatchOutcome, TargetArchiveStats,
};
pub use target::{priority_score, AccessRecord, Edge, Target, TargetKind, TargetStatus};
pub use task_run::TaskRunRecord;
