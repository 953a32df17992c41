use crate::processing::ServiceConfig;
use config::{Config, ConfigError, Environment, File};
use serde_derive::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct WalleConfig {
    pub github: GithubConfig,
    #[serde(default)]
    pub bot: BotConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GithubConfig {
    pub owner: String,
    pub repo: String,
    pub username: String,
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BotConfig {
    #[serde(default = "default_integration_label")]
    pub integration_label: String,

    #[serde(default)]
    pub top_priority_labels: Vec<String>,

    #[serde(default)]
    pub requires_all_status_checks: bool,

    #[serde(default = "default_status_checks_timeout")]
    pub status_checks_timeout_seconds: u64,

    #[serde(default = "default_idle_cleanup_delay")]
    pub idle_merge_service_cleanup_delay_seconds: u64,

    #[serde(default)]
    pub bot_user: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            integration_label: default_integration_label(),
            top_priority_labels: Vec::new(),
            requires_all_status_checks: false,
            status_checks_timeout_seconds: default_status_checks_timeout(),
            idle_merge_service_cleanup_delay_seconds: default_idle_cleanup_delay(),
            bot_user: None,
        }
    }
}

fn default_integration_label() -> String {
    "merge".into()
}

fn default_status_checks_timeout() -> u64 {
    3600
}

fn default_idle_cleanup_delay() -> u64 {
    300
}

impl From<BotConfig> for ServiceConfig {
    fn from(config: BotConfig) -> Self {
        Self {
            integration_label: config.integration_label,
            top_priority_labels: config.top_priority_labels,
            requires_all_status_checks: config.requires_all_status_checks,
            status_checks_timeout: Duration::from_secs(config.status_checks_timeout_seconds),
            idle_merge_service_cleanup_delay: Duration::from_secs(
                config.idle_merge_service_cleanup_delay_seconds,
            ),
            bot_user: config.bot_user,
        }
    }
}

impl WalleConfig {
    pub fn new(config_file_path: &str) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        let config_file_path = shellexpand::tilde(config_file_path);
        config.merge(File::with_name(&config_file_path).required(false))?;
        config.merge(Environment::with_prefix("walle").separator("_"))?;
        config.try_into()
    }
}
