//! Configuration schema definitions

use crate::communion::Capabilities;
use crate::job::ExecutionSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Peer protocol settings
    pub communion: CommunionConfig,

    /// Transformation cache settings
    pub cache: CacheConfig,

    /// Local execution settings
    pub execution: ExecutionConfig,
}

impl Config {
    /// Check values that parse fine but make no sense
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                self.general.log_format
            ));
        }
        if !(self.communion.round_trip_timeout_secs > 0.0) {
            return Err("communion.round_trip_timeout_secs must be positive".to_string());
        }
        if !(self.cache.keep_alive_secs >= 0.0) {
            return Err("cache.keep_alive_secs must not be negative".to_string());
        }
        Ok(())
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            local_cores: self.execution.local_cores,
            force_local: self.execution.force_local,
            restart_cap: self.cache.restart_cap,
            round_trip_timeout: self.communion.round_trip_timeout(),
            termination_grace: Duration::from_millis(self.execution.termination_grace_ms),
        }
    }
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log output format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunionConfig {
    /// Instance ID announced to peers (random when absent)
    pub id: Option<String>,

    /// Address to listen on
    pub listen_host: String,

    /// Port to listen on; no listener when absent
    pub listen_port: Option<u16>,

    /// Peer addresses (host:port) to dial at startup
    pub peers: Vec<String>,

    /// Upper bound for one request/response exchange
    pub round_trip_timeout_secs: f64,

    /// Largest buffer served under the "small" policy
    pub small_buffer_limit: usize,

    /// What this instance requests from peers
    #[serde(default = "Capabilities::master")]
    pub master: Capabilities,

    /// What this instance serves to peers
    pub servant: Capabilities,
}

impl CommunionConfig {
    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.round_trip_timeout_secs)
    }

    /// `host:port` to bind, when listening is configured
    pub fn listen_addr(&self) -> Option<String> {
        self.listen_port
            .map(|port| format!("{}:{}", self.listen_host, port))
    }
}

impl Default for CommunionConfig {
    fn default() -> Self {
        Self {
            id: None,
            listen_host: "127.0.0.1".to_string(),
            listen_port: None,
            peers: Vec::new(),
            round_trip_timeout_secs: 5.0,
            small_buffer_limit: 10_000,
            master: Capabilities::master(),
            servant: Capabilities::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an unreferenced transformation stays registered
    pub keep_alive_secs: f64,

    /// Restarts a remote peer may request before the job fails
    pub restart_cap: u32,

    /// Directory that persists buffers across runs
    pub buffer_dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs_f64(self.keep_alive_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 20.0,
            restart_cap: 100,
            buffer_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Concurrent local workers; 0 disables local execution
    pub local_cores: usize,

    /// Skip the peer survey and always run locally
    pub force_local: bool,

    /// Worker command line; empty runs `<current executable> worker`
    pub worker_command: Vec<String>,

    /// Time between SIGTERM and SIGKILL on hard cancel
    pub termination_grace_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            local_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            force_local: false,
            worker_command: Vec::new(),
            termination_grace_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communion::Capability;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[communion]"));
        assert!(toml.contains("[communion.servant]"));
        assert!(toml.contains("[execution]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.general.log_format, "text");
        assert_eq!(config.communion.master, Capabilities::master());
        assert_eq!(config.communion.servant, Capabilities::default());
        assert!(config.communion.listen_addr().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [communion]
            listen_port = 5533
            peers = ["10.0.0.2:5533"]

            [communion.servant]
            buffer = "small"
            transformation_job = true

            [execution]
            local_cores = 0
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.communion.listen_addr().as_deref(),
            Some("127.0.0.1:5533")
        );
        assert_eq!(config.communion.peers, vec!["10.0.0.2:5533"]);
        assert_eq!(config.communion.servant.buffer, Capability::Small);
        assert_eq!(config.communion.servant.transformation_job, Capability::On);
        assert_eq!(config.communion.servant.buffer_length, Capability::On);
        assert_eq!(config.execution.local_cores, 0);
        assert_eq!(config.cache.keep_alive(), Duration::from_secs(20));
    }

    #[test]
    fn invalid_capability_is_rejected() {
        let toml = r#"
            [communion.master]
            buffer = "large"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn validation_catches_nonsense() {
        let mut config = Config::default();
        config.general.log_format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.communion.round_trip_timeout_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn execution_settings_follow_config() {
        let mut config = Config::default();
        config.execution.local_cores = 3;
        config.cache.restart_cap = 7;
        config.communion.round_trip_timeout_secs = 1.5;
        let settings = config.execution_settings();
        assert_eq!(settings.local_cores, 3);
        assert_eq!(settings.restart_cap, 7);
        assert_eq!(settings.round_trip_timeout, Duration::from_millis(1500));
    }
}
