use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::forwarding::ForwardSettings;
use crate::models::{Credential, EgressRoute};
use crate::pool::RotationMode;
use crate::remote::Destination;
use crate::scheduler::{BackoffPolicy, SchedulerSettings};

/// Process settings from the environment
#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// RON crawl configuration
    pub crawl_config_path: PathBuf,
    /// Base URL of the remote messaging bridge
    pub remote_endpoint: String,
    /// Bearer token for the control API; open when unset
    pub control_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("PORT must be a valid number"),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "./.db/spectra.db".to_string()),
            crawl_config_path: env::var("SPECTRA_CONFIG")
                .unwrap_or_else(|_| "./config/spectra.ron".to_string())
                .into(),
            remote_endpoint: env::var("REMOTE_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8081".to_string()),
            control_token: env::var("CONTROL_TOKEN").ok().filter(|t| !t.trim().is_empty()),
        }
    }
}

/// One remote account
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub session_name: String,
    pub api_id: i64,
    pub api_hash: String,
    #[serde(default)]
    pub phone: Option<String>,
}

/// An explicitly listed proxy
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Proxy list. `ports` expands to one route per port on `host`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

const DEFAULT_PROXY_SCHEME: &str = "socks5";

fn default_max_depth() -> u32 {
    2
}

fn default_batch_size() -> usize {
    500
}

fn default_sample_limit() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    5
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_relay_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// Crawl configuration, read once at start
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlConfig {
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub default_destination: Option<String>,
    #[serde(default)]
    pub destination_topic_id: Option<i64>,
    /// Defaults to one worker per account
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_relay_interval_ms")]
    pub relay_interval_ms: u64,
    #[serde(default)]
    pub forward_to_personal_archives: bool,
    #[serde(default = "default_true")]
    pub prepend_origin_info: bool,
    #[serde(default)]
    pub rotation_mode: RotationMode,
}

impl CrawlConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;
        config.validate()?;

        log::info!(
            "[CONFIG] loaded {} accounts, {} egress routes from {:?}",
            config.accounts.len(),
            config.egress_routes().len(),
            path
        );
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self, String> {
        ron::from_str(content).map_err(|e| e.to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::Invalid("no accounts configured".to_string()));
        }
        let mut names = HashSet::new();
        for account in &self.accounts {
            if account.session_name.trim().is_empty() {
                return Err(ConfigError::Invalid("account with empty session_name".to_string()));
            }
            if !names.insert(account.session_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate session_name '{}'",
                    account.session_name
                )));
            }
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.batch_size == 0 || self.sample_limit == 0 {
            return Err(ConfigError::Invalid("batch_size and sample_limit must be positive".to_string()));
        }
        if !self.proxy.ports.is_empty() && self.proxy.host.is_none() {
            return Err(ConfigError::Invalid("proxy ports given without a proxy host".to_string()));
        }
        let mut route_ids = HashSet::new();
        for route in self.egress_routes() {
            if !route_ids.insert(route.id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate egress route '{}'", route.id)));
            }
        }
        Ok(())
    }

    pub fn credentials(&self) -> Vec<Credential> {
        self.accounts
            .iter()
            .map(|a| Credential {
                id: a.session_name.clone(),
                api_id: a.api_id,
                api_hash: a.api_hash.clone(),
                phone: a.phone.clone(),
            })
            .collect()
    }

    /// Routes from `proxy.ports` first, then the explicit list. Empty means
    /// direct egress.
    pub fn egress_routes(&self) -> Vec<EgressRoute> {
        let proxy = &self.proxy;
        let scheme = proxy.scheme.as_deref().unwrap_or(DEFAULT_PROXY_SCHEME);
        let mut routes = Vec::new();

        if let Some(host) = &proxy.host {
            for port in &proxy.ports {
                routes.push(EgressRoute {
                    id: format!("proxy-{}", port),
                    scheme: scheme.to_string(),
                    host: host.clone(),
                    port: *port,
                    username: proxy.user.clone(),
                    password: proxy.password.clone(),
                });
            }
        }

        for route in &proxy.routes {
            routes.push(EgressRoute {
                id: route
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", route.host, route.port)),
                scheme: route.scheme.clone().unwrap_or_else(|| scheme.to_string()),
                host: route.host.clone(),
                port: route.port,
                username: route.username.clone(),
                password: route.password.clone(),
            });
        }
        routes
    }

    pub fn destination(&self) -> Option<Destination> {
        self.default_destination.as_ref().map(|key| Destination::Entity {
            key: key.clone(),
            topic_id: self.destination_topic_id,
        })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            workers: self.workers.unwrap_or(self.accounts.len()).max(1),
            max_retries: self.max_retries.max(1),
            max_depth: self.max_depth,
            sample_limit: self.sample_limit,
            batch_size: self.batch_size,
            backoff: BackoffPolicy::default(),
            default_destination: self.destination(),
            personal_fanout: self.forward_to_personal_archives,
            forward: ForwardSettings {
                relay_interval: Duration::from_millis(self.relay_interval_ms),
                prepend_origin_info: self.prepend_origin_info,
                batch_size: self.batch_size,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"(
        accounts: [
            (session_name: "alpha", api_id: 1001, api_hash: "aaaa"),
            (session_name: "beta", api_id: 1002, api_hash: "bbbb", phone: Some("+15550100")),
        ],
        proxy: (
            host: Some("proxy.internal"),
            user: Some("crawler"),
            password: Some("hunter2"),
            ports: [10001, 10002],
            routes: [(host: "10.0.0.9", port: 1080, scheme: Some("http"))],
        ),
        default_destination: Some("archive_channel"),
        destination_topic_id: Some(42),
        max_depth: 3,
        forward_to_personal_archives: true,
    )"#;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectra.ron");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_accounts_routes_and_defaults() {
        let (_dir, path) = write_config(SAMPLE);
        let config = CrawlConfig::load(&path).unwrap();

        let credentials = config.credentials();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[1].phone.as_deref(), Some("+15550100"));

        let routes = config.egress_routes();
        let ids: Vec<&str> = routes.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["proxy-10001", "proxy-10002", "10.0.0.9:1080"]);
        assert_eq!(routes[0].scheme, "socks5");
        assert_eq!(routes[2].scheme, "http");

        let settings = config.scheduler_settings();
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.max_depth, 3);
        assert_eq!(settings.batch_size, 500);
        assert_eq!(settings.max_retries, 5);
        assert!(settings.personal_fanout);
        assert_eq!(config.rotation_mode, RotationMode::LeastUsed);
        assert_eq!(settings.forward.relay_interval, Duration::from_millis(1000));
        assert_eq!(
            settings.default_destination,
            Some(Destination::Entity {
                key: "archive_channel".into(),
                topic_id: Some(42)
            })
        );
    }

    #[test]
    fn no_proxies_means_direct_egress() {
        let (_dir, path) = write_config(r#"(accounts: [(session_name: "solo", api_id: 1, api_hash: "x")])"#);
        let config = CrawlConfig::load(&path).unwrap();
        assert!(config.egress_routes().is_empty());
        assert!(config.destination().is_none());
        assert_eq!(config.scheduler_settings().workers, 1);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = CrawlConfig::load(&dir.path().join("absent.ron")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn rejects_malformed_and_inconsistent_files() {
        let (_dir, path) = write_config("(accounts: [");
        assert!(matches!(CrawlConfig::load(&path), Err(ConfigError::Parse { .. })));

        let (_dir, path) = write_config(
            r#"(accounts: [
                (session_name: "dup", api_id: 1, api_hash: "x"),
                (session_name: "dup", api_id: 2, api_hash: "y"),
            ])"#,
        );
        assert!(matches!(CrawlConfig::load(&path), Err(ConfigError::Invalid(_))));

        let (_dir, path) = write_config("(accounts: [])");
        assert!(matches!(CrawlConfig::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rotation_mode_is_read_from_the_file() {
        let (_dir, path) = write_config(
            r#"(accounts: [(session_name: "solo", api_id: 1, api_hash: "x")], rotation_mode: sequential)"#,
        );
        assert_eq!(CrawlConfig::load(&path).unwrap().rotation_mode, RotationMode::Sequential);
    }

    #[test]
    fn duplicate_egress_routes_are_rejected() {
        let account = r#"accounts: [(session_name: "solo", api_id: 1, api_hash: "x")]"#;
        let (_dir, path) = write_config(&format!(
            r#"({}, proxy: (host: Some("p.internal"), ports: [9000, 9000]))"#,
            account
        ));
        assert!(matches!(CrawlConfig::load(&path), Err(ConfigError::Invalid(_))));

        let (_dir, path) = write_config(&format!(
            r#"({}, proxy: (routes: [(id: Some("r1"), host: "10.0.0.1", port: 1080), (id: Some("r1"), host: "10.0.0.2", port: 1080)]))"#,
            account
        ));
        assert!(matches!(CrawlConfig::load(&path), Err(ConfigError::Invalid(_))));

        // Same host and port under distinct ids is two routes
        let (_dir, path) = write_config(&format!(
            r#"({}, proxy: (routes: [(id: Some("r1"), host: "10.0.0.1", port: 1080), (id: Some("r2"), host: "10.0.0.1", port: 1080)]))"#,
            account
        ));
        assert_eq!(CrawlConfig::load(&path).unwrap().egress_routes().len(), 2);
    }
}
