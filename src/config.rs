//! Gateway configuration: defaults, the JSON file under ~/.scribe, and environment overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::Result;
use crate::error::Error;

/// Runtime settings for the gateway and the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Stream Chat application key (public)
    #[serde(default)]
    pub stream_api_key: String,

    /// Stream Chat application secret (signs server and user tokens)
    #[serde(default)]
    pub stream_api_secret: String,

    /// Stream Chat REST base URL
    #[serde(default = "default_stream_api_url")]
    pub stream_api_url: String,

    /// Stream Chat WebSocket base URL
    #[serde(default = "default_stream_ws_url")]
    pub stream_ws_url: String,

    /// Gemini API key
    #[serde(default)]
    pub gemini_api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Clerk backend secret key (user profile lookups)
    #[serde(default)]
    pub clerk_secret_key: String,

    /// Clerk PEM public key for verifying session tokens
    #[serde(default)]
    pub clerk_jwt_key: String,

    /// Clerk backend API base URL
    #[serde(default = "default_clerk_api_url")]
    pub clerk_api_url: String,

    /// Seconds between idleness sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Minutes of inactivity after which an agent is disposed
    #[serde(default = "default_idle_threshold_mins")]
    pub idle_threshold_mins: u64,

    /// Channel type used when a request omits one
    #[serde(default = "default_channel_type")]
    pub default_channel_type: String,

    /// Display name of the agent's chat user
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
}

fn default_port() -> u16 {
    3000
}

fn default_stream_api_url() -> String {
    "https://chat.stream-io-api.com".to_string()
}

fn default_stream_ws_url() -> String {
    "wss://chat.stream-io-api.com".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_clerk_api_url() -> String {
    "https://api.clerk.com/v1".to_string()
}

/// Upper bound on the idle threshold (100 years), well inside what
/// `chrono::Duration` can represent.
pub const MAX_IDLE_THRESHOLD_MINS: u64 = 100 * 365 * 24 * 60;

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_idle_threshold_mins() -> u64 {
    480
}

fn default_channel_type() -> String {
    "messaging".to_string()
}

fn default_agent_name() -> String {
    "AI Writing Assistant".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            stream_api_key: String::new(),
            stream_api_secret: String::new(),
            stream_api_url: default_stream_api_url(),
            stream_ws_url: default_stream_ws_url(),
            gemini_api_key: String::new(),
            model: default_model(),
            clerk_secret_key: String::new(),
            clerk_jwt_key: String::new(),
            clerk_api_url: default_clerk_api_url(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_threshold_mins: default_idle_threshold_mins(),
            default_channel_type: default_channel_type(),
            agent_name: default_agent_name(),
        }
    }
}

impl Config {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Clamped to [`MAX_IDLE_THRESHOLD_MINS`] so an unvalidated config
    /// cannot overflow the conversion.
    pub fn idle_threshold(&self) -> chrono::Duration {
        let mins = self.idle_threshold_mins.min(MAX_IDLE_THRESHOLD_MINS);
        chrono::Duration::minutes(mins as i64)
    }

    /// Check invariants that hold regardless of which command runs.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep_interval_secs must be positive".to_string()));
        }
        if self.idle_threshold_mins > MAX_IDLE_THRESHOLD_MINS {
            return Err(Error::Config(format!(
                "idle threshold ({} min) must not exceed {} min",
                self.idle_threshold_mins, MAX_IDLE_THRESHOLD_MINS
            )));
        }
        let threshold_secs = self.idle_threshold_mins.checked_mul(60).unwrap_or(u64::MAX);
        if threshold_secs <= self.sweep_interval_secs {
            return Err(Error::Config(format!(
                "idle threshold ({} min) must exceed the sweep interval ({} s)",
                self.idle_threshold_mins, self.sweep_interval_secs
            )));
        }
        Ok(())
    }

    /// The gateway cannot run without chat credentials.
    pub fn validate_gateway(&self) -> Result<()> {
        self.validate()?;
        if self.stream_api_key.is_empty() || self.stream_api_secret.is_empty() {
            return Err(Error::Config(
                "Stream API key and secret are required (STREAM_API_KEY, STREAM_API_SECRET)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Overlay values from environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = var(key).filter(|v| !v.is_empty()) {
                *target = value;
            }
        };

        set(&mut self.stream_api_key, "STREAM_API_KEY");
        set(&mut self.stream_api_secret, "STREAM_API_SECRET");
        set(&mut self.stream_api_url, "STREAM_API_URL");
        set(&mut self.stream_ws_url, "STREAM_WS_URL");
        set(&mut self.gemini_api_key, "GEMINI_API_KEY");
        set(&mut self.model, "SCRIBE_MODEL");
        set(&mut self.clerk_secret_key, "CLERK_SECRET_KEY");
        set(&mut self.clerk_jwt_key, "CLERK_JWT_KEY");

        if let Some(port) = var("PORT") {
            self.port = parse_var("PORT", &port)?;
        }
        if let Some(mins) = var("SCRIBE_IDLE_THRESHOLD_MINS") {
            self.idle_threshold_mins = parse_var("SCRIBE_IDLE_THRESHOLD_MINS", &mins)?;
        }
        if let Some(secs) = var("SCRIBE_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse_var("SCRIBE_SWEEP_INTERVAL_SECS", &secs)?;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} has an invalid value: {value:?}")))
}

/// `~/.scribe`, or `./.scribe` when there is no home directory
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".scribe")
}

/// Location of `config.json`
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration: defaults, then the config file if present, then `.env` and the environment.
pub fn load() -> Result<Config> {
    let _ = dotenvy::dotenv();
    let mut config = load_from(&config_path())?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a JSON file, falling back to defaults when it does not exist
pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

/// Write configuration as pretty JSON, creating the directory if needed
pub fn save_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Interactive setup wizard
pub fn onboard() -> Result<()> {
    use crate::ui;
    use inquire::{Confirm, Password, Text};

    ui::print_header("Setup Wizard");
    println!("  I'll collect the credentials the gateway needs.\n");

    let path = config_path();
    let mut config = load_from(&path)?;

    let prompt_err = |e: inquire::InquireError| Error::Config(format!("Prompt failed: {}", e));

    let current_key = config.stream_api_key.clone();
    config.stream_api_key = Text::new("Stream API key:")
        .with_default(&current_key)
        .prompt()
        .map_err(prompt_err)?;
    config.stream_api_secret = Password::new("Stream API secret:")
        .without_confirmation()
        .prompt()
        .map_err(prompt_err)?;
    config.gemini_api_key = Password::new("Gemini API key:")
        .without_confirmation()
        .prompt()
        .map_err(prompt_err)?;

    let use_clerk = Confirm::new("Configure Clerk sign-in for the /token endpoint?")
        .with_default(true)
        .prompt()
        .map_err(prompt_err)?;
    if use_clerk {
        config.clerk_secret_key = Password::new("Clerk secret key:")
            .without_confirmation()
            .prompt()
            .map_err(prompt_err)?;
        let pem_path = Text::new("Path to the Clerk JWT public key (PEM):")
            .prompt()
            .map_err(prompt_err)?;
        config.clerk_jwt_key = std::fs::read_to_string(pem_path.trim())?;
    }

    ui::print_thinking("Saving configuration");
    save_to(&config, &path)?;
    ui::print_success(&format!("Configuration written to {:?}", path));
    ui::print_step("Run 'scribe gateway' to start the control API.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model, "gemini-2.0-flash");
        assert_eq!(config.idle_threshold_mins, 480);
        assert_eq!(config.sweep_interval_secs, 5);
        assert_eq!(config.default_channel_type, "messaging");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.stream_api_key = "key".to_string();
        config.port = 4100;
        save_to(&config, &path).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.stream_api_key, "key");
        assert_eq!(loaded.port, 4100);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded.port, 3000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"gemini_api_key": "g"}"#).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.gemini_api_key, "g");
        assert_eq!(loaded.agent_name, "AI Writing Assistant");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STREAM_API_KEY", "sk"),
            ("STREAM_API_SECRET", "ss"),
            ("PORT", "8080"),
            ("SCRIBE_IDLE_THRESHOLD_MINS", "10"),
            ("GEMINI_API_KEY", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.gemini_api_key = "from-file".to_string();
        config
            .apply_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.stream_api_key, "sk");
        assert_eq!(config.port, 8080);
        assert_eq!(config.idle_threshold_mins, 10);
        // empty values do not clobber
        assert_eq!(config.gemini_api_key, "from-file");
        assert!(config.validate_gateway().is_ok());
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let err = config
            .apply_vars(|k| (k == "PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_gateway_requires_stream_credentials() {
        let config = Config::default();
        assert!(config.validate_gateway().unwrap_err().is_config());
    }

    #[test]
    fn test_idle_threshold_must_exceed_sweep_interval() {
        let mut config = Config::default();
        config.idle_threshold_mins = 1;
        config.sweep_interval_secs = 60;
        assert!(config.validate().is_err());

        config.sweep_interval_secs = 59;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_idle_threshold_is_rejected_without_overflow() {
        let mut config = Config::default();
        config.idle_threshold_mins = u64::MAX;
        assert!(config.validate().unwrap_err().is_config());

        config.idle_threshold_mins = u64::MAX / 60 + 1;
        assert!(config.validate().unwrap_err().is_config());

        config.idle_threshold_mins = MAX_IDLE_THRESHOLD_MINS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_idle_threshold_conversion_is_clamped() {
        let mut config = Config::default();
        config.idle_threshold_mins = u64::MAX;
        assert_eq!(
            config.idle_threshold(),
            chrono::Duration::minutes(MAX_IDLE_THRESHOLD_MINS as i64)
        );

        let vars = HashMap::from([("SCRIBE_IDLE_THRESHOLD_MINS", "18446744073709551615")]);
        let mut config = Config::default();
        config.apply_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert!(config.validate().is_err());
        let settings = crate::registry::RegistrySettings::from_config(&config);
        assert_eq!(settings.idle_threshold, config.idle_threshold());
    }
}
