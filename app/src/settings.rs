use config::{Config, ConfigError, Environment, File};
use infrastructure::{HttpClientConfig, MonitoringConfig};
use serde::Deserialize;

use crate::adapter::geothunk::SensorSettings;
use crate::core::poll::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub sensors: Vec<SensorSettings>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("config.toml").required(false))
            .add_source(Environment::with_prefix("GEOTHUNK").separator("__"));

        builder.build()?.try_deserialize()
    }
}
