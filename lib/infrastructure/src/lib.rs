mod bus;
mod http;
mod monitoring;

pub use bus::{EventBus, EventEmitter, EventListener};
pub use http::client::HttpClientConfig;
pub use monitoring::{EnvFilterConfig, MonitoringConfig, OtlpConfig};

pub mod meter {
    pub use super::monitoring::meter::{increment, set};
}
