use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An identity usable against the remote service
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Session name, unique per credential
    pub id: String,
    pub api_id: i64,
    pub api_hash: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // api_hash stays out of logs
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("api_id", &self.api_id)
            .finish_non_exhaustive()
    }
}

/// Health of a credential as tracked by the credential pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialHealth {
    Healthy,
    CoolingDown,
    Disabled,
}

impl Default for CredentialHealth {
    fn default() -> Self {
        CredentialHealth::Healthy
    }
}

impl std::fmt::Display for CredentialHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CredentialHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialHealth::Healthy => "healthy",
            CredentialHealth::CoolingDown => "cooling_down",
            CredentialHealth::Disabled => "disabled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "healthy" => Some(CredentialHealth::Healthy),
            "cooling_down" | "cooldown" => Some(CredentialHealth::CoolingDown),
            "disabled" => Some(CredentialHealth::Disabled),
            _ => None,
        }
    }
}

/// Point-in-time view of one credential, persisted after every release
/// and served to the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub credential_id: String,
    pub health: CredentialHealth,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub in_use: bool,
    pub usage_count: i64,
    pub recent_usage: i64,
    pub success_count: i64,
    pub rate_limit_count: i64,
    pub consecutive_failures: i64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CredentialStatus {
    pub fn new(credential_id: impl Into<String>) -> Self {
        Self {
            credential_id: credential_id.into(),
            health: CredentialHealth::Healthy,
            cooldown_until: None,
            in_use: false,
            usage_count: 0,
            recent_usage: 0,
            success_count: 0,
            rate_limit_count: 0,
            consecutive_failures: 0,
            last_used: None,
            last_error: None,
        }
    }
}
