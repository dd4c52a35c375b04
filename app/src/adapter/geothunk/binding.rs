use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use infrastructure::EventEmitter;
use tokio::sync::watch;

use crate::core::poll::{DataSource, EngineState, Health, PollError, Poller, RetryPolicy, SourceConfig};

use super::{ChannelValue, RawReading, resolve};

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub sensor: String,
    pub channel: String,
    pub value: ChannelValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Refresh,
    Write(ChannelValue),
}

type LinkedChannels = Arc<RwLock<BTreeSet<String>>>;

/// Connects one sensor's poller to the channels linked to it.
pub struct SensorBinding<S: DataSource<Reading = RawReading>> {
    sensor_id: String,
    poller: Poller<S>,
    linked: LinkedChannels,
    updates: EventEmitter<ChannelUpdate>,
}

impl<S: DataSource<Reading = RawReading>> SensorBinding<S> {
    pub fn new(
        sensor_id: impl Into<String>,
        source: S,
        retry_policy: RetryPolicy,
        updates: EventEmitter<ChannelUpdate>,
    ) -> Self {
        let sensor_id = sensor_id.into();

        Self {
            poller: Poller::new(sensor_id.clone(), source, retry_policy),
            sensor_id,
            linked: Arc::default(),
            updates,
        }
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn link(&self, channel_id: impl Into<String>) {
        let channel_id = channel_id.into();
        tracing::debug!("Linking channel {} of sensor {}", channel_id, self.sensor_id);
        self.linked.write().unwrap_or_else(PoisonError::into_inner).insert(channel_id);
    }

    pub fn unlink(&self, channel_id: &str) {
        tracing::debug!("Unlinking channel {} of sensor {}", channel_id, self.sensor_id);
        self.linked.write().unwrap_or_else(PoisonError::into_inner).remove(channel_id);
    }

    pub async fn initialize(&self, config: SourceConfig) -> Result<(), PollError> {
        let sensor_id = self.sensor_id.clone();
        let linked = self.linked.clone();
        let updates = self.updates.clone();

        self.poller
            .start(config, move |reading: &RawReading| {
                let channels = linked.read().unwrap_or_else(PoisonError::into_inner);
                for channel in channels.iter() {
                    updates.send(ChannelUpdate {
                        sensor: sensor_id.clone(),
                        channel: channel.clone(),
                        value: resolve(channel, Some(reading)),
                    });
                }
            })
            .await
    }

    pub fn is_linked(&self, channel_id: &str) -> bool {
        self.linked.read().unwrap_or_else(PoisonError::into_inner).contains(channel_id)
    }

    /// Returns the value re-emitted for `Refresh` of a linked channel, `None` for ignored commands.
    pub fn handle_command(&self, channel_id: &str, command: Command) -> Option<ChannelValue> {
        match command {
            Command::Refresh if !self.is_linked(channel_id) => {
                tracing::debug!("Ignoring refresh of unlinked channel {} of sensor {}", channel_id, self.sensor_id);
                None
            }
            Command::Refresh => {
                let state = self.poller.state();
                let value = resolve(channel_id, state.reading.as_deref());

                self.updates.send(ChannelUpdate {
                    sensor: self.sensor_id.clone(),
                    channel: channel_id.to_string(),
                    value,
                });
                Some(value)
            }
            other => {
                tracing::debug!(
                    "Ignoring command {:?} for read-only channel {} of sensor {}",
                    other,
                    channel_id,
                    self.sensor_id
                );
                None
            }
        }
    }

    pub async fn dispose(&self) {
        self.poller.stop().await;
    }

    pub fn status(&self) -> Health {
        self.poller.state().health
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineState<RawReading>> {
        self.poller.subscribe()
    }
}
