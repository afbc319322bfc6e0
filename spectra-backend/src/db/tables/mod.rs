//! Database table modules - extend Database with domain-specific methods
//!
//! Each module adds `impl Database` blocks for a specific table group.

mod access;       // access_records
mod checkpoints;  // checkpoints
mod credentials;  // credential_stats
mod messages;     // users, media, messages
mod relays;       // relays
mod targets;      // targets, edges, discovery_sources
mod tasks;        // task_runs

pub use targets::ReferenceSummary;
