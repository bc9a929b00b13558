use crate::error::{Error, Result};

use serde_derive::Deserialize;
use std::path::PathBuf;

pub const ENV_PREFIX: &str = "CHURCH_EVENTS";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub port: u16,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    pub db_path: PathBuf,
    #[serde(default = "default_push_gateway_url")]
    pub push_gateway_url: String,
    #[serde(default)]
    pub push_access_token: Option<String>,
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_push_gateway_url() -> String {
    "https://exp.host/--/api/v2/push/send".to_owned()
}

fn default_push_batch_size() -> usize {
    100
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

impl Config {
    /// Reads `settings_name` (any extension the config crate understands),
    /// then lets `CHURCH_EVENTS_*` environment variables override it.
    pub fn load(settings_name: &str, required: bool) -> Result<Config> {
        let mut settings = config::Config::default();
        settings
            .merge(config::File::with_name(settings_name).required(required))
            .map_err(Error::Config)?;
        settings
            .merge(config::Environment::with_prefix(ENV_PREFIX))
            .map_err(Error::Config)?;
        settings.try_into::<Config>().map_err(Error::Config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}
