use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of the implicit route used when no proxies are configured
pub const DIRECT_ROUTE_ID: &str = "direct";

/// A network path used for remote calls
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressRoute {
    pub id: String,
    /// socks5, socks5h, http or https
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for EgressRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressRoute")
            .field("id", &self.id)
            .field("endpoint", &self.display_endpoint())
            .finish_non_exhaustive()
    }
}

impl EgressRoute {
    pub fn direct() -> Self {
        Self {
            id: DIRECT_ROUTE_ID.to_string(),
            scheme: String::new(),
            host: String::new(),
            port: 0,
            username: None,
            password: None,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.id == DIRECT_ROUTE_ID
    }

    /// Proxy URL without credentials, suitable for logs
    pub fn display_endpoint(&self) -> String {
        if self.is_direct() {
            return DIRECT_ROUTE_ID.to_string();
        }
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteHealth {
    Healthy,
    CoolingDown,
    Disabled,
}

/// Point-in-time view of one route for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub route_id: String,
    pub endpoint: String,
    pub health: RouteHealth,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub in_use: bool,
    pub bound_to: Vec<String>,
    pub usage_count: i64,
    pub consecutive_failures: i64,
}
