//! Remote messaging service collaborator
//!
//! The core never speaks the service's wire protocol. It talks to a
//! `RemoteClient`, which exposes only the calls the crawler needs and
//! reports every failure as a classified `FetchFailure`.

pub mod fetcher;
pub mod http;
#[cfg(test)]
pub mod mock;
pub mod references;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchFailure;
use crate::models::{Credential, EgressRoute, TargetKind};

pub use fetcher::{Fetcher, TaskContext};

/// A resolved reference to a group or channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: TargetKind,
}

impl EntityRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: None,
            kind: TargetKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMedia {
    /// photo, document, video, ...
    pub kind: String,
    /// Remote file reference
    pub file_ref: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size: i64,
}

/// One content item of a target, ids ascending per target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: i64,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub edit_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub sender: Option<RemoteUser>,
    #[serde(default)]
    pub media: Option<RemoteMedia>,
    #[serde(default)]
    pub reply_to: Option<i64>,
}

/// An entity the credential can reach, with its routing handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessibleEntity {
    pub entity: EntityRef,
    #[serde(default)]
    pub access_handle: Option<String>,
}

/// Where a relayed item lands
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    Entity {
        key: String,
        #[serde(default)]
        topic_id: Option<i64>,
    },
    /// The relaying credential's own archive ("saved messages")
    Personal,
}

impl Destination {
    pub fn entity(key: impl Into<String>) -> Self {
        Destination::Entity {
            key: key.into(),
            topic_id: None,
        }
    }

    /// Key used for relay dedup and checkpoints. Personal archives are
    /// per credential.
    pub fn log_key(&self, credential_id: &str) -> String {
        match self {
            Destination::Entity { key, .. } => key.clone(),
            Destination::Personal => format!("personal:{}", credential_id),
        }
    }

    pub fn topic_id(&self) -> Option<i64> {
        match self {
            Destination::Entity { topic_id, .. } => *topic_id,
            Destination::Personal => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayRequest {
    pub origin: String,
    pub item_id: i64,
    pub destination: Destination,
    /// Replaces the item text when set (provenance header)
    pub text_override: Option<String>,
}

/// The credential + route pair a call runs under
#[derive(Debug, Clone, Copy)]
pub struct Session<'a> {
    pub credential: &'a Credential,
    pub route: &'a EgressRoute,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Items of `entity` with id > `after_id`, ascending, at most `limit`
    async fn list_entity_content(
        &self,
        session: Session<'_>,
        entity: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RemoteItem>, FetchFailure>;

    /// Current copies of specific items, for the edit pass
    async fn get_items(
        &self,
        session: Session<'_>,
        entity: &str,
        ids: &[i64],
    ) -> Result<Vec<RemoteItem>, FetchFailure>;

    /// Resolve candidate handles into entities; unknown handles are dropped
    async fn resolve_references(
        &self,
        session: Session<'_>,
        candidates: &[String],
    ) -> Result<Vec<EntityRef>, FetchFailure>;

    async fn relay(&self, session: Session<'_>, request: &RelayRequest) -> Result<(), FetchFailure>;

    async fn list_accessible_entities(
        &self,
        session: Session<'_>,
    ) -> Result<Vec<AccessibleEntity>, FetchFailure>;
}
