//! Graph-directed discovery of groups and channels

pub mod discovery;
pub mod frontier;

pub use discovery::{DiscoveryEngine, Expansion};
pub use frontier::Frontier;
