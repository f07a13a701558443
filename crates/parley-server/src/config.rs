//! Server configuration loading from file and environment variables.

use parley_voice::{BatchPolicy, GenerationConfig, SttConfig, SynthesisConfig, VoiceError};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Speech-to-text backend.
    #[serde(default)]
    pub stt: SttConfig,

    /// Text-generation backend.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Speech-synthesis backend.
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Per-session pipeline tuning.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "parley_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Pipeline thresholds. These are empirically tuned defaults, not
/// invariants; adjust per workload.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Minimum seconds between accepted utterances.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,

    /// Minimum accumulated characters before a word-boundary flush.
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,

    /// Time-based flush fallback, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Acknowledge every Nth inbound audio frame (0 disables acks).
    #[serde(default = "default_audio_ack_every")]
    pub audio_ack_every: u64,

    /// Release a session's synthesis connection after this many idle
    /// seconds.
    #[serde(default = "default_synthesis_idle_secs")]
    pub synthesis_idle_secs: u64,

    /// Discard a disconnected session after this many idle seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Sweep interval for the background task.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs)
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            min_chars: self.min_chars,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cooldown_secs() -> f64 {
    2.0
}

fn default_min_chars() -> usize {
    60
}

fn default_flush_interval_ms() -> u64 {
    250
}

fn default_audio_ack_every() -> u64 {
    10
}

fn default_synthesis_idle_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            min_chars: default_min_chars(),
            flush_interval_ms: default_flush_interval_ms(),
            audio_ack_every: default_audio_ack_every(),
            synthesis_idle_secs: default_synthesis_idle_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A backend is missing its endpoint or credentials. Fatal at process
    /// start, never per-request.
    #[error(transparent)]
    Invalid(#[from] VoiceError),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_HOST` / `PARLEY_PORT` override `server.*`
/// - `PARLEY_LOG_LEVEL` / `PARLEY_LOG_JSON` override `logging.*`
/// - `PARLEY_STT_ENDPOINT` / `PARLEY_STT_API_KEY` override `stt.*`
/// - `PARLEY_GENERATION_ENDPOINT` / `PARLEY_GENERATION_API_KEY` override
///   `generation.*`
/// - `PARLEY_SYNTHESIS_ENDPOINT` / `PARLEY_SYNTHESIS_API_KEY` /
///   `PARLEY_VOICE_ID` override `synthesis.*`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("PARLEY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("PARLEY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(level) = std::env::var("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(endpoint) = std::env::var("PARLEY_STT_ENDPOINT") {
        config.stt.endpoint = endpoint;
    }
    if let Ok(key) = std::env::var("PARLEY_STT_API_KEY") {
        config.stt.api_key = key;
    }
    if let Ok(endpoint) = std::env::var("PARLEY_GENERATION_ENDPOINT") {
        config.generation.endpoint = endpoint;
    }
    if let Ok(key) = std::env::var("PARLEY_GENERATION_API_KEY") {
        config.generation.api_key = key;
    }
    if let Ok(endpoint) = std::env::var("PARLEY_SYNTHESIS_ENDPOINT") {
        config.synthesis.endpoint = endpoint;
    }
    if let Ok(key) = std::env::var("PARLEY_SYNTHESIS_API_KEY") {
        config.synthesis.api_key = key;
    }
    if let Ok(voice_id) = std::env::var("PARLEY_VOICE_ID") {
        config.synthesis.voice.voice_id = voice_id;
    }

    Ok(config)
}

impl Config {
    /// Checks that every backend has an endpoint and credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stt.validate()?;
        self.generation.validate()?;
        self.synthesis.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.session.cooldown_secs, 2.0);
        assert_eq!(config.session.min_chars, 60);
        assert_eq!(config.session.flush_interval_ms, 250);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some("definitely-not-here.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn file_values_are_applied() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[stt]
endpoint = "wss://stt.example.com/v3/stream"
api_key = "stt-key"
sample_rate = 8000

[session]
cooldown_secs = 1.5
min_chars = 40
"#
        )
        .unwrap();

        let config = load_config(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.stt.sample_rate, 8000);
        assert_eq!(config.session.cooldown(), Duration::from_millis(1500));
        assert_eq!(config.session.batch_policy().min_chars, 40);
        // Untouched sections keep their defaults.
        assert_eq!(config.session.flush_interval_ms, 250);
    }

    #[test]
    fn validate_rejects_missing_credentials() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stt.endpoint = "wss://stt.example.com".into();
        config.stt.api_key = "a".into();
        config.generation.endpoint = "https://generate.example.com".into();
        config.generation.api_key = "b".into();
        config.synthesis.endpoint = "wss://speech.example.com".into();
        config.synthesis.api_key = "c".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not toml [[").unwrap();
        let err = load_config(Some(file.path().to_str().unwrap())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
