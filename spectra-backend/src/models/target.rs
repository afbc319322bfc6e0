use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a target node in the discovery graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Known, not yet expanded
    Discovered,
    /// Content sample fetched and references extracted
    Expanded,
    /// Private, deleted or otherwise out of reach; skipped until reset
    Unreachable,
}

impl Default for TargetStatus {
    fn default() -> Self {
        TargetStatus::Discovered
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Discovered => "discovered",
            TargetStatus::Expanded => "expanded",
            TargetStatus::Unreachable => "unreachable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(TargetStatus::Discovered),
            "expanded" => Some(TargetStatus::Expanded),
            "unreachable" => Some(TargetStatus::Unreachable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Group,
    Channel,
    Unknown,
}

impl Default for TargetKind {
    fn default() -> Self {
        TargetKind::Unknown
    }
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Group => "group",
            TargetKind::Channel => "channel",
            TargetKind::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "group" => TargetKind::Group,
            "channel" => TargetKind::Channel,
            _ => TargetKind::Unknown,
        }
    }
}

/// A discoverable group/channel node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier (resolved username or numeric id)
    pub key: String,
    pub title: Option<String>,
    pub kind: TargetKind,
    /// Shallowest depth at which the target was reached
    pub depth: u32,
    pub priority: f64,
    pub in_degree: i64,
    pub status: TargetStatus,
    pub discovered_at: DateTime<Utc>,
    pub last_referenced_at: Option<DateTime<Utc>>,
    pub expanded_at: Option<DateTime<Utc>>,
    /// Why the target was marked unreachable
    pub last_error: Option<String>,
}

/// Directed reference from one target to another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub destination: String,
    pub discovered_at: DateTime<Utc>,
}

/// A credential is known to reach a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    pub credential_id: String,
    pub target_key: String,
    pub title: Option<String>,
    /// Opaque routing handle returned by the remote service
    pub access_handle: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// Priority of a target: in-degree plus a freshness bonus that decays
/// with days since it was last referenced
pub fn priority_score(
    in_degree: i64,
    last_referenced_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let freshness = match last_referenced_at {
        Some(at) => {
            let days = (now - at).num_seconds().max(0) as f64 / 86_400.0;
            1.0 / (1.0 + days)
        }
        None => 0.0,
    };
    in_degree as f64 + freshness
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn priority_prefers_in_degree_then_freshness() {
        let now = Utc::now();
        let fresh = priority_score(2, Some(now), now);
        let stale = priority_score(2, Some(now - Duration::days(9)), now);
        let popular = priority_score(3, Some(now - Duration::days(30)), now);

        assert!((fresh - 3.0).abs() < 1e-9);
        assert!((stale - 2.1).abs() < 1e-9);
        assert!(popular > fresh);
        assert_eq!(priority_score(0, None, now), 0.0);
    }
}
