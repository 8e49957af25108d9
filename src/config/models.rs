// src/config/models.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub backends: Vec<String>,

    #[serde(default)]
    pub strategy: LoadBalancerAlgorithm,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.listen.port == 0 {
            bail!("listen.port must be non-zero");
        }
        if self.health_check.interval_secs == 0 {
            bail!("health_check.interval_secs must be at least 1");
        }
        if self.health_check.timeout_secs == 0 {
            bail!("health_check.timeout_secs must be at least 1");
        }
        if !self.health_check.path.starts_with('/') {
            bail!("health_check.path must start with '/'");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            bail!("retry.backoff_base_ms cannot exceed retry.backoff_max_ms");
        }
        if self.proxy.request_timeout_secs == 0 {
            bail!("proxy.request_timeout_secs must be at least 1");
        }
        if self.metrics.enabled && self.metrics.port == self.listen.port {
            bail!("metrics.port must differ from listen.port");
        }
        if self.backends.iter().any(|b| b.trim().is_empty()) {
            bail!("backend addresses cannot be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerAlgorithm {
    #[default]
    #[serde(alias = "least_connections")]
    LeastLoaded,
    RoundRobin,
}

impl LoadBalancerAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeastLoaded => "least_loaded",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl FromStr for LoadBalancerAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "least_loaded" | "least_connections" => Ok(Self::LeastLoaded),
            "round_robin" => Ok(Self::RoundRobin),
            other => bail!("unknown load balancing strategy: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_health_path")]
    pub path: String,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            path: default_health_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_health_interval() -> u64 {
    5
}

fn default_health_timeout() -> u64 {
    2
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    50
}

fn default_backoff_max() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
