//! Credential and egress pools
//!
//! Both pools own their health tables behind a single mutex: selection and
//! the state change it implies happen under one lock, so two workers can
//! never be handed the same credential or route.

pub mod credentials;
pub mod egress;

use std::time::Duration;

pub use credentials::{CredentialPool, RotationMode};
pub use egress::EgressPool;

/// Result of asking a pool for a resource
#[derive(Debug, Clone, PartialEq)]
pub enum Acquire<T> {
    Granted(T),
    /// Nothing usable right now. `retry_in` is the earliest cooldown expiry
    /// when known; `None` means everything usable is checked out.
    Blocked { retry_in: Option<Duration> },
    /// Every resource is disabled; waiting will not help
    Unavailable,
}

#[cfg(test)]
impl<T> Acquire<T> {
    pub fn granted(self) -> Option<T> {
        match self {
            Acquire::Granted(value) => Some(value),
            _ => None,
        }
    }
}

/// What happened while a resource was checked out
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    /// Nothing to say about the resource (e.g. the target was unreachable)
    Neutral,
    RateLimited(Duration),
    /// Counted toward the failure threshold
    Failure(String),
    /// Permanent: disabled until manually reset
    Revoked(String),
}
