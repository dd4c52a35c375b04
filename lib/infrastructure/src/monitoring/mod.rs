pub mod meter;

use anyhow::Context as _;
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{ExporterBuildError, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

//Console logging is always on. Traces and metrics leave the process only with an `otlp` section.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonitoringConfig {
    pub service_name: String,
    pub logs: EnvFilterConfig,
    #[serde(default)]
    pub traces: Option<EnvFilterConfig>,
    #[serde(default)]
    pub otlp: Option<OtlpConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EnvFilterConfig {
    pub default_level: String,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct OtlpConfig {
    pub url: String,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    15
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "geothunk-poller".to_string(),
            logs: EnvFilterConfig {
                default_level: "info".to_string(),
                filters: vec![],
            },
            traces: None,
            otlp: None,
        }
    }
}

impl TryInto<EnvFilter> for EnvFilterConfig {
    type Error = tracing_subscriber::filter::ParseError;

    fn try_into(self) -> Result<EnvFilter, Self::Error> {
        EnvFilter::builder()
            .with_default_directive(self.default_level.parse()?)
            .parse(self.filters.join(","))
    }
}

impl MonitoringConfig {
    pub fn init(&self) -> anyhow::Result<()> {
        let Some(otlp_config) = &self.otlp else {
            let fmt_layer = tracing_subscriber::fmt::layer().with_filter(self.fmt_filter()?);
            tracing_subscriber::registry().with(fmt_layer).try_init()?;
            return Ok(());
        };

        let resource = Resource::builder()
            .with_attribute(KeyValue::new("service.name", self.service_name.clone()))
            .build();

        let tracer_provider = init_traces(resource.clone(), &otlp_config.url)?;
        let tracer = tracer_provider.tracer(self.service_name.clone());
        opentelemetry::global::set_tracer_provider(tracer_provider);

        let tracing_filter: EnvFilter = self
            .traces
            .clone()
            .unwrap_or_else(|| self.logs.clone())
            .try_into()
            .context("Invalid trace filter")?;
        let tracing_layer = OpenTelemetryLayer::new(tracer).with_filter(tracing_filter);

        let meter_provider = init_metrics(resource, otlp_config)?;
        opentelemetry::global::set_meter_provider(meter_provider);

        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(self.fmt_filter()?);
        tracing_subscriber::registry()
            .with(tracing_layer)
            .with(fmt_layer)
            .try_init()?;

        tracing::info!("Exporting traces and metrics to {}", otlp_config.url);
        Ok(())
    }

    fn fmt_filter(&self) -> anyhow::Result<EnvFilter> {
        self.logs.clone().try_into().context("Invalid log filter")
    }
}

fn init_traces(resource: Resource, url: &str) -> Result<SdkTracerProvider, ExporterBuildError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(url)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build())
}

fn init_metrics(resource: Resource, config: &OtlpConfig) -> Result<SdkMeterProvider, ExporterBuildError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.url.clone())
        .build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(std::time::Duration::from_secs(config.metrics_interval_secs))
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}
