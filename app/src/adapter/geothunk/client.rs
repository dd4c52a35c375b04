use infrastructure::HttpClientConfig;
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;

use crate::core::poll::{DataSource, PollError, SourceConfig};

use super::RawReading;

const STATS_PATH: &str = "stats";

#[derive(Debug, Clone)]
pub struct GeoThunkSource {
    client: ClientWithMiddleware,
}

impl GeoThunkSource {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.new_tracing_client()?,
        })
    }
}

impl DataSource for GeoThunkSource {
    type Reading = RawReading;

    #[tracing::instrument(skip_all, fields(url = %config.url))]
    async fn fetch(&self, config: &SourceConfig) -> Result<RawReading, PollError> {
        let url = Url::parse(&config.request_url(STATS_PATH))
            .map_err(|e| PollError::transport(format!("Invalid sensor url {}: {}", config.url, e)))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(PollError::transport)?
            .error_for_status()
            .map_err(PollError::transport)?;

        let body = response.text().await.map_err(PollError::transport)?;
        tracing::trace!("Sensor responded with {}", body);

        serde_json::from_str::<RawReading>(&body).map_err(PollError::decode)
    }
}
