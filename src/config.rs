use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "rustdialer.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub storage_path: String,
    pub provision: ProvisionConfig,
    pub dialer: DialerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProvisionConfig {
    pub token_url: String,
    pub phone_numbers_url: String,
    pub api_key: String,
    pub platform: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DialerConfig {
    /// Pacing gap enforced before each call, in seconds.
    pub delay_seconds: u64,
    /// Ceiling on how long a single call may occupy the sequence, in seconds.
    pub call_duration_budget_seconds: u64,
    /// Coalescing window for snapshot writes, in milliseconds.
    pub save_debounce_ms: u64,
}

impl Config {
    pub fn load(path: &str) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: None,
            log_file: None,
            storage_path: "dialer_state".to_string(),
            provision: ProvisionConfig::default(),
            dialer: DialerConfig::default(),
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            token_url: "".to_string(),
            phone_numbers_url: "".to_string(),
            api_key: "".to_string(),
            platform: "android".to_string(),
        }
    }
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            delay_seconds: 1,
            call_duration_budget_seconds: 300,
            save_debounce_ms: 300,
        }
    }
}
