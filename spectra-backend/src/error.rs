//! Error types for spectra-backend
//!
//! - `FetchFailure`: classification of a single failed remote call
//! - `CrawlError`: task-level failures seen by the scheduler
//! - `SchedulerError`: rejected run requests
//! - `ConfigError`: startup configuration problems

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Classified outcome of a failed remote call. The fetcher never retries;
/// the scheduler decides what to do with each class.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchFailure {
    /// Remote asked us to pause this credential
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Timeout, connection reset, gateway error
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Private, deleted or banned target
    #[error("target unreachable: {0}")]
    TargetUnreachable(String),

    /// Session revoked or credentials rejected
    #[error("authorization rejected: {0}")]
    AuthInvalid(String),

    #[error("unclassified remote failure: {0}")]
    Unknown(String),
}

impl FetchFailure {
    /// Whether a later attempt of the same call can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchFailure::RateLimited { .. }
                | FetchFailure::TransientNetwork(_)
                | FetchFailure::AuthInvalid(_)
                | FetchFailure::Unknown(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchFailure::RateLimited { .. } => "rate_limited",
            FetchFailure::TransientNetwork(_) => "transient_network",
            FetchFailure::TargetUnreachable(_) => "target_unreachable",
            FetchFailure::AuthInvalid(_) => "auth_invalid",
            FetchFailure::Unknown(_) => "unknown",
        }
    }
}

/// Failure of one scheduled task
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error(transparent)]
    Fetch(#[from] FetchFailure),

    /// Stored and fetched copies of an immutable item disagree
    #[error("integrity mismatch on {target}#{item_id}: stored {stored}, computed {computed}")]
    IntegrityMismatch {
        target: String,
        item_id: i64,
        stored: String,
        computed: String,
    },

    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("cancelled")]
    Cancelled,
}

pub type CrawlResult<T> = Result<T, CrawlError>;

/// Errors returned by the scheduler's entry points
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("unknown credential '{0}'")]
    UnknownCredential(String),

    #[error("no targets to process")]
    NothingToDo,

    #[error("no default destination configured")]
    NoDestination,

    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_is_not_retryable() {
        assert!(!FetchFailure::TargetUnreachable("gone".into()).is_retryable());
        assert!(FetchFailure::TransientNetwork("reset".into()).is_retryable());
        assert!(
            FetchFailure::RateLimited {
                retry_after: Duration::from_secs(3)
            }
            .is_retryable()
        );
    }

    #[test]
    fn fetch_failure_converts_into_crawl_error() {
        let err: CrawlError = FetchFailure::AuthInvalid("revoked".into()).into();
        assert!(matches!(err, CrawlError::Fetch(FetchFailure::AuthInvalid(_))));
        assert_eq!(err.to_string(), "authorization rejected: revoked");
    }
}
