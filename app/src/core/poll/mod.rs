//! Periodic polling of an external source into typed channel values.
//!
//! A [`Poller`] drives one [`DataSource`] on a fixed-delay timer. Every cycle fetches a reading,
//! checks it against the reading's own plausibility rule and either publishes it or reports the
//! source as offline. Readings that fail the plausibility check are re-fetched with a bounded
//! exponential backoff inside the same cycle.

mod config;
mod poller;

pub use config::{DEFAULT_REFRESH_SECONDS, RetryPolicy, SourceConfig};
pub use poller::Poller;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use derive_more::derive::{Display, Error};

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum PollError {
    #[display("{reason}")]
    Config { reason: String },

    #[display("{reason}")]
    Transport { reason: String },

    #[display("Configuration is incorrect: {reason}")]
    Decode { reason: String },

    #[display("Sensor reported humidity of {humidity}, is a wire loose?")]
    SentinelReading { humidity: i16 },
}

impl PollError {
    pub fn transport(reason: impl std::fmt::Display) -> Self {
        PollError::Transport {
            reason: reason.to_string(),
        }
    }

    pub fn decode(reason: impl std::fmt::Display) -> Self {
        PollError::Decode {
            reason: reason.to_string(),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, PollError::SentinelReading { .. })
    }

    fn offline_reason(&self) -> OfflineReason {
        match self {
            PollError::Config { .. } => OfflineReason::ConfigurationError,
            PollError::Transport { .. } | PollError::Decode { .. } => OfflineReason::CommunicationError,
            PollError::SentinelReading { .. } => OfflineReason::SensorMalfunction,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PollError::Config { .. } => "config",
            PollError::Transport { .. } => "transport",
            PollError::Decode { .. } => "decode",
            PollError::SentinelReading { .. } => "sentinel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OfflineReason {
    #[display("CONFIGURATION_ERROR")]
    ConfigurationError,
    #[display("COMMUNICATION_ERROR")]
    CommunicationError,
    #[display("SENSOR_MALFUNCTION")]
    SensorMalfunction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Unknown,
    Online { detail: Option<String> },
    Offline { reason: OfflineReason, detail: String },
}

impl Health {
    fn offline(error: &PollError) -> Self {
        Health::Offline {
            reason: error.offline_reason(),
            detail: error.to_string(),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Health::Online { .. })
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Unknown => write!(f, "UNKNOWN"),
            Health::Online { detail: None } => write!(f, "ONLINE"),
            Health::Online { detail: Some(detail) } => write!(f, "ONLINE ({})", detail),
            Health::Offline { reason, detail } => write!(f, "OFFLINE/{} ({})", reason, detail),
        }
    }
}

/// A decoded payload that knows whether it is plausible.
pub trait SensorReading: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// `Err(PollError::SentinelReading)` for payloads that decoded fine but must not be published.
    fn check(&self) -> Result<(), PollError>;

    /// Human readable summary shown next to the online status.
    fn status_detail(&self) -> String;
}

pub trait DataSource: Send + Sync + 'static {
    type Reading: SensorReading;

    fn fetch(&self, config: &SourceConfig) -> impl Future<Output = Result<Self::Reading, PollError>> + Send;
}

/// Immutable snapshot of a poller. Replaced as a whole on every transition.
#[derive(Debug, Clone)]
pub struct EngineState<R> {
    pub reading: Option<Arc<R>>,
    pub health: Health,
    pub retries: u32,
    pub last_success: Option<DateTime<Utc>>,
    run: u64,
}

impl<R> EngineState<R> {
    fn new_run(run: u64, health: Health) -> Self {
        Self {
            reading: None,
            health,
            retries: 0,
            last_success: None,
            run,
        }
    }
}

impl<R> Default for EngineState<R> {
    fn default() -> Self {
        Self::new_run(0, Health::Unknown)
    }
}
