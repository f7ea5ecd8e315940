use serde::Deserialize;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to.
    #[serde(default = "Config::default_bind_addr")]
    pub bind_addr: String,
    /// Path to the SQLite database file. Parent directories are created
    /// at startup if missing.
    #[serde(default = "Config::default_database_path")]
    pub database_path: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub stale: StaleConfig,
    #[serde(default)]
    pub eta: EtaConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub near: NearConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

/// Per-driver sample throttle. Bounds downstream write and fan-out rates
/// regardless of how fast a device samples GPS.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThrottleConfig {
    /// Minimum milliseconds between accepted samples per driver.
    #[serde(default = "ThrottleConfig::default_min_interval_ms")]
    pub min_interval_ms: i64,
    /// Minimum metres between accepted sample positions per driver.
    #[serde(default = "ThrottleConfig::default_min_distance_m")]
    pub min_distance_m: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StaleConfig {
    /// Maximum silence in seconds before an online bus is demoted.
    #[serde(default = "StaleConfig::default_window_secs")]
    pub window_secs: u64,
    /// How often the staleness sweep runs, in seconds.
    #[serde(default = "StaleConfig::default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EtaConfig {
    /// How often ETA estimates are recomputed, in seconds.
    #[serde(default = "EtaConfig::default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// EWMA weight for the current speed sample. Must be in (0, 1].
    #[serde(default = "EtaConfig::default_smoothing_alpha")]
    pub smoothing_alpha: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SocketConfig {
    /// Per-socket bounded outbound queue length.
    #[serde(default = "SocketConfig::default_outbound_queue")]
    pub outbound_queue: usize,
    /// Per-send timeout in seconds; a socket that cannot take a frame
    /// within this window is closed.
    #[serde(default = "SocketConfig::default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct NearConfig {
    /// Cap on the radius of /buses/near queries, in metres.
    #[serde(default = "NearConfig::default_radius_max_m")]
    pub radius_max_m: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WorkersConfig {
    /// Whether this instance runs the staleness and ETA workers. In a
    /// multi-instance deployment exactly one instance sets this.
    #[serde(default = "WorkersConfig::default_enabled")]
    pub enabled: bool,
}

impl Config {
    fn default_bind_addr() -> String {
        "0.0.0.0:3000".to_string()
    }
    fn default_database_path() -> String {
        "./database/buslive.db".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate configuration values and log warnings for potential issues.
    pub fn validate(&self) {
        if self.cors_permissive {
            warn!("CORS: permissive mode enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        }
        if self.eta.smoothing_alpha <= 0.0 || self.eta.smoothing_alpha > 1.0 {
            warn!(
                alpha = self.eta.smoothing_alpha,
                "eta.smoothing_alpha outside (0, 1], speed smoothing will misbehave"
            );
        }
        if self.stale.tick_interval_secs == 0 || self.eta.tick_interval_secs == 0 {
            warn!("worker tick interval of 0 seconds, worker loops will spin");
        }
        if self.throttle.min_interval_ms < 0 {
            warn!(
                min_interval_ms = self.throttle.min_interval_ms,
                "negative throttle interval, every sample will be accepted"
            );
        }
        if self.near.radius_max_m <= 0.0 {
            warn!(
                radius_max_m = self.near.radius_max_m,
                "near.radius_max_m is non-positive, all /buses/near queries will be rejected"
            );
        }
        if self.socket.outbound_queue == 0 {
            warn!("socket.outbound_queue of 0, every delivery will overflow");
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: Self::default_min_interval_ms(),
            min_distance_m: Self::default_min_distance_m(),
        }
    }
}

impl ThrottleConfig {
    fn default_min_interval_ms() -> i64 {
        2000
    }
    fn default_min_distance_m() -> f64 {
        20.0
    }
}

impl Default for StaleConfig {
    fn default() -> Self {
        Self {
            window_secs: Self::default_window_secs(),
            tick_interval_secs: Self::default_tick_interval_secs(),
        }
    }
}

impl StaleConfig {
    fn default_window_secs() -> u64 {
        60
    }
    fn default_tick_interval_secs() -> u64 {
        60
    }
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: Self::default_tick_interval_secs(),
            smoothing_alpha: Self::default_smoothing_alpha(),
        }
    }
}

impl EtaConfig {
    fn default_tick_interval_secs() -> u64 {
        10
    }
    fn default_smoothing_alpha() -> f64 {
        0.3
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            outbound_queue: Self::default_outbound_queue(),
            send_timeout_secs: Self::default_send_timeout_secs(),
        }
    }
}

impl SocketConfig {
    fn default_outbound_queue() -> usize {
        64
    }
    fn default_send_timeout_secs() -> u64 {
        5
    }
}

impl Default for NearConfig {
    fn default() -> Self {
        Self {
            radius_max_m: Self::default_radius_max_m(),
        }
    }
}

impl NearConfig {
    fn default_radius_max_m() -> f64 {
        50_000.0
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
        }
    }
}

impl WorkersConfig {
    fn default_enabled() -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.throttle.min_interval_ms, 2000);
        assert_eq!(config.throttle.min_distance_m, 20.0);
        assert_eq!(config.stale.window_secs, 60);
        assert_eq!(config.stale.tick_interval_secs, 60);
        assert_eq!(config.eta.tick_interval_secs, 10);
        assert_eq!(config.eta.smoothing_alpha, 0.3);
        assert_eq!(config.socket.outbound_queue, 64);
        assert_eq!(config.socket.send_timeout_secs, 5);
        assert_eq!(config.near.radius_max_m, 50_000.0);
        assert!(config.workers.enabled);
        assert!(!config.cors_permissive);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let yaml = r#"
            throttle:
              min_interval_ms: 500
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.throttle.min_interval_ms, 500);
        assert_eq!(config.throttle.min_distance_m, 20.0);
        assert_eq!(config.stale.window_secs, 60);
    }

    #[test]
    fn full_config_overrides() {
        let yaml = r#"
            bind_addr: "127.0.0.1:8080"
            database_path: "/tmp/test.db"
            cors_permissive: true
            throttle:
              min_interval_ms: 1000
              min_distance_m: 5.0
            stale:
              window_secs: 30
              tick_interval_secs: 15
            eta:
              tick_interval_secs: 5
              smoothing_alpha: 0.5
            socket:
              outbound_queue: 16
              send_timeout_secs: 2
            near:
              radius_max_m: 10000.0
            workers:
              enabled: false
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.database_path, "/tmp/test.db");
        assert!(config.cors_permissive);
        assert_eq!(config.throttle.min_interval_ms, 1000);
        assert_eq!(config.stale.window_secs, 30);
        assert_eq!(config.stale.tick_interval_secs, 15);
        assert_eq!(config.eta.tick_interval_secs, 5);
        assert_eq!(config.eta.smoothing_alpha, 0.5);
        assert_eq!(config.socket.outbound_queue, 16);
        assert_eq!(config.near.radius_max_m, 10000.0);
        assert!(!config.workers.enabled);
    }
}
