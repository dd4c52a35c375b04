//! GeoThunk air-quality sensors, polled over their `/stats` JSON endpoint.

mod binding;
mod channel;
mod client;
mod reading;

pub use binding::{ChannelUpdate, Command, SensorBinding};
pub use channel::{Channel, ChannelValue, resolve};
pub use client::GeoThunkSource;
pub use reading::RawReading;

use infrastructure::{EventEmitter, HttpClientConfig};
use serde::Deserialize;

use crate::core::poll::{RetryPolicy, SourceConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct SensorSettings {
    pub id: String,
    pub url: String,
    pub refresh_seconds: Option<u64>,
    /// Channels to publish, every known channel if empty.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl SensorSettings {
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig::new(self.url.clone(), self.refresh_seconds)
    }

    pub fn new_binding(
        &self,
        http_client: &HttpClientConfig,
        retry_policy: RetryPolicy,
        updates: EventEmitter<ChannelUpdate>,
    ) -> anyhow::Result<SensorBinding<GeoThunkSource>> {
        let binding = SensorBinding::new(self.id.clone(), GeoThunkSource::new(http_client)?, retry_policy, updates);

        if self.channels.is_empty() {
            Channel::ALL.iter().for_each(|channel| binding.link(channel.to_string()));
        } else {
            self.channels.iter().for_each(|channel| binding.link(channel.clone()));
        }

        Ok(binding)
    }
}
