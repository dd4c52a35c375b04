use anyhow::Context as _;
use infrastructure::{EventBus, EventListener};
use settings::Settings;

use crate::adapter::geothunk::{ChannelUpdate, GeoThunkSource, RawReading, SensorBinding};
use crate::core::poll::EngineState;

mod adapter;
mod core;
mod settings;

#[tokio::main(flavor = "multi_thread")]
pub async fn main() -> anyhow::Result<()> {
    let settings = Settings::new().context("Error reading configuration")?;
    settings.monitoring.init().context("Error initializing monitoring")?;

    if settings.sensors.is_empty() {
        tracing::warn!("No sensors configured, nothing to poll");
    }

    let channel_bus = EventBus::<ChannelUpdate>::new(64);
    let channel_updates = channel_bus.subscribe();

    let mut bindings = Vec::with_capacity(settings.sensors.len());
    for sensor in &settings.sensors {
        let binding = sensor
            .new_binding(&settings.http_client, settings.retry, channel_bus.emitter())
            .with_context(|| format!("Error creating binding for sensor {}", sensor.id))?;

        tokio::spawn(log_health_transitions(binding.sensor_id().to_string(), binding.subscribe_status()));

        if let Err(e) = binding.initialize(sensor.source_config()).await {
            tracing::error!("Sensor {} not started: {}", sensor.id, e);
        }

        bindings.push(binding);
    }

    tracing::info!("Polling {} sensors", bindings.len());

    tokio::select!(
        _ = log_channel_updates(channel_updates) => {},
        result = tokio::signal::ctrl_c() => result.context("Error waiting for shutdown signal")?,
    );

    tracing::info!("Shutting down");
    dispose_all(&bindings).await;

    Ok(())
}

async fn dispose_all(bindings: &[SensorBinding<GeoThunkSource>]) {
    for binding in bindings {
        binding.dispose().await;
    }
}

async fn log_channel_updates(mut updates: EventListener<ChannelUpdate>) {
    while let Some(update) = updates.recv().await {
        tracing::info!("{}/{} = {}", update.sensor, update.channel, update.value);
    }
}

async fn log_health_transitions(sensor_id: String, mut state: tokio::sync::watch::Receiver<EngineState<RawReading>>) {
    let mut last = state.borrow_and_update().health.clone();

    while state.changed().await.is_ok() {
        let health = state.borrow_and_update().health.clone();
        if health != last {
            tracing::info!("Sensor {} is {}", sensor_id, health);
            last = health;
        }
    }
}
