//! Configuration for the tiergate server.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::admission::{InvalidTierPolicy, ReservationMode};

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub transcript: TranscriptConfig,
    #[serde(default)]
    pub fail_fast: FailFastConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Tiered admission policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Number of priority tiers, which is also the total capacity.
    #[serde(default = "default_tiers")]
    pub tiers: usize,
    /// Length of one backoff tick in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub reservation: ReservationMode,
    #[serde(default)]
    pub invalid_tier: InvalidTierPolicy,
    /// Re-check admission as soon as a lease is released instead of waiting
    /// for the end of the tick.
    #[serde(default)]
    pub wake_on_release: bool,
}

impl AdmissionConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            tick_ms: default_tick_ms(),
            reservation: ReservationMode::default(),
            invalid_tier: InvalidTierPolicy::default(),
            wake_on_release: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionConfig {
    /// Upper bound on a single generation. Unbounded when unset.
    #[serde(default)]
    pub generation_timeout_secs: Option<u64>,
}

impl SessionConfig {
    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub ollama: OllamaEngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaEngineConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

impl Default for OllamaEngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model: default_ollama_model(),
        }
    }
}

/// Transcript persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FailFastConfig {
    /// Shut down after this many engine failures in a row. Disabled when unset.
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    17860
}
fn default_tiers() -> usize {
    4
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3.2".to_string()
}
fn default_database_url() -> String {
    "sqlite:./data/transcripts.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (TIERGATE__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("admission.tiers", default_tiers() as i64)?
            .set_default("admission.tick_ms", default_tick_ms() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("TIERGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.tiers == 0 {
            return Err(ConfigError::Message(
                "admission.tiers must be at least 1".to_string(),
            ));
        }
        if self.admission.tick_ms == 0 {
            return Err(ConfigError::Message(
                "admission.tick_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            admission: AdmissionConfig::default(),
            session: SessionConfig::default(),
            engine: EngineConfig::default(),
            transcript: TranscriptConfig::default(),
            fail_fast: FailFastConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_admission_config() {
        let admission = AdmissionConfig::default();
        assert_eq!(admission.tiers, 4);
        assert_eq!(admission.tick(), Duration::from_secs(1));
        assert_eq!(admission.reservation, ReservationMode::Atomic);
        assert_eq!(admission.invalid_tier, InvalidTierPolicy::Reject);
        assert!(!admission.wake_on_release);
    }

    #[test]
    fn test_default_session_config_is_unbounded() {
        assert!(SessionConfig::default().generation_timeout().is_none());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: Config = ConfigLoader::builder()
            .add_source(config::File::from_str(
                r#"
                [admission]
                tiers = 6
                reservation = "check_then_acquire"
                invalid_tier = "clamp"

                [fail_fast]
                max_consecutive_failures = 3
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.admission.tiers, 6);
        assert_eq!(config.admission.tick_ms, 1000);
        assert_eq!(config.admission.reservation, ReservationMode::CheckThenAcquire);
        assert_eq!(config.admission.invalid_tier, InvalidTierPolicy::Clamp);
        assert_eq!(config.fail_fast.max_consecutive_failures, Some(3));
        assert_eq!(config.server.port, 17860);
        assert!(!config.transcript.enabled);
    }

    #[test]
    fn test_validate_rejects_zero_tiers() {
        let mut config = Config::default();
        config.admission.tiers = 0;
        assert!(config.validate().is_err());
    }
}
