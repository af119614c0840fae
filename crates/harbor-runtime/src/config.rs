use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use harbor_api::deadline::{DEFAULT_DEADLINE_SECS, MAX_DEADLINE_SECS};
use harbor_api::wire::{DEFAULT_RPC_ENDPOINT, DEFAULT_RPC_METHOD};
use harbor_api::{CallMetrics, DeadlinePolicy, ProxyOptions};
use harbor_core::HarborError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarborConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API server URL. Without one, calls go to the in-process loopback.
    pub endpoint: Option<String>,
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: f64,
    #[serde(default = "max_deadline_secs")]
    pub max_deadline_secs: f64,
    #[serde(default = "default_rpc_endpoint")]
    pub rpc_endpoint: String,
    #[serde(default = "default_rpc_method")]
    pub rpc_method: String,
}

fn default_deadline_secs() -> f64 {
    DEFAULT_DEADLINE_SECS
}
fn max_deadline_secs() -> f64 {
    MAX_DEADLINE_SECS
}
fn default_rpc_endpoint() -> String {
    DEFAULT_RPC_ENDPOINT.into()
}
fn default_rpc_method() -> String {
    DEFAULT_RPC_METHOD.into()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            default_deadline_secs: default_deadline_secs(),
            max_deadline_secs: max_deadline_secs(),
            rpc_endpoint: default_rpc_endpoint(),
            rpc_method: default_rpc_method(),
        }
    }
}

impl ApiConfig {
    pub fn deadline_policy(&self) -> DeadlinePolicy {
        DeadlinePolicy::new(self.default_deadline_secs, self.max_deadline_secs)
    }

    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            policy: self.deadline_policy(),
            rpc_endpoint: self.rpc_endpoint.clone(),
            rpc_method: self.rpc_method.clone(),
            metrics: CallMetrics::new(),
        }
    }
}

/// What `stop` reports when an instance could not be reset cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// Return `PartialFailure`.
    #[default]
    Strict,
    /// Log the failure and report success.
    Lenient,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub stop_policy: StopPolicy,
    /// How long a stopping instance waits for admitted requests to finish
    /// before its reset hook runs.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: f64,
}

fn default_drain_timeout_secs() -> f64 {
    5.0
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_policy: StopPolicy::default(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl LifecycleConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    /// Lifetime of a fresh session record.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    /// Period of the expired-session sweep on the shared pool.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: f64,
}

fn default_session_ttl() -> u64 {
    24 * 60 * 60
}
fn default_purge_interval() -> f64 {
    15.0 * 60.0
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            ttl_secs: default_session_ttl(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl SessionConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| data_dir().join("sessions"))
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs.min(MAX_SESSION_TTL_SECS) as i64)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs_f64(self.purge_interval_secs)
    }

    fn validate(&self) -> Result<(), HarborError> {
        if self.ttl_secs == 0 || self.ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(HarborError::Config(format!(
                "sessions.ttl_secs must be between 1 and {MAX_SESSION_TTL_SECS}"
            )));
        }
        positive_secs("sessions.purge_interval_secs", self.purge_interval_secs)
    }
}

/// Ten years.
const MAX_SESSION_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Upper bound on instances per backend.
pub const MAX_INSTANCES: u32 = 1024;

fn positive_secs(field: &str, secs: f64) -> Result<(), HarborError> {
    if secs.is_finite() && secs > 0.0 && secs <= MAX_SESSION_TTL_SECS as f64 {
        Ok(())
    } else {
        Err(HarborError::Config(format!(
            "{field} must be a positive number of seconds, got {secs}"
        )))
    }
}

/// A named group of identically configured instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default = "default_module")]
    pub module: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_instance_class")]
    pub instance_class: String,
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Instance `n` listens on `port + n`.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_module() -> String {
    "default".into()
}
fn default_version() -> String {
    "1".into()
}
fn default_instance_class() -> String {
    "B1".into()
}
fn default_instances() -> u32 {
    1
}

impl BackendConfig {
    /// Minimal config for `name` with defaults everywhere else.
    pub fn new(name: impl Into<String>, instances: u32) -> Self {
        Self {
            name: name.into(),
            module: default_module(),
            version: default_version(),
            instance_class: default_instance_class(),
            instances,
            port: 0,
            options: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), HarborError> {
        if self.name.is_empty() {
            return Err(HarborError::Config("backend name must not be empty".into()));
        }
        if self.instances == 0 || self.instances > MAX_INSTANCES {
            return Err(HarborError::Config(format!(
                "backend {}: instances must be between 1 and {MAX_INSTANCES}",
                self.name
            )));
        }
        let last_port = u64::from(self.port) + u64::from(self.instances) - 1;
        if self.port != 0 && last_port > u64::from(u16::MAX) {
            return Err(HarborError::Config(format!(
                "backend {}: ports {}..={last_port} exceed 65535",
                self.name, self.port
            )));
        }
        Ok(())
    }
}

/// The version and backend serving a module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    pub module: String,
    pub version: String,
    pub backend: String,
}

impl HarborConfig {
    pub fn from_file(path: &Path) -> Result<Self, HarborError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarborError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, HarborError> {
        let config: HarborConfig = toml::from_str(content)
            .map_err(|e| HarborError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarborError> {
        positive_secs(
            "lifecycle.drain_timeout_secs",
            self.lifecycle.drain_timeout_secs,
        )?;
        self.sessions.validate()?;
        let mut names = HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !names.insert(backend.name.as_str()) {
                return Err(HarborError::Config(format!(
                    "duplicate backend {}",
                    backend.name
                )));
            }
        }
        for route in &self.routes {
            if !names.contains(route.backend.as_str()) {
                return Err(HarborError::Config(format!(
                    "route for module {} names unknown backend {}",
                    route.module, route.backend
                )));
            }
        }
        Ok(())
    }
}

/// Default data location: ~/.harbor/
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".harbor")
}
