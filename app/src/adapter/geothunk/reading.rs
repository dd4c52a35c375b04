use serde::Deserialize;

use crate::core::poll::{PollError, SensorReading};

/// Payload of `GET <sensor>/stats`. Absent fields decode as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawReading {
    pub pm1: u32,
    #[serde(rename = "pm2")]
    pub pm2_5: u32,
    pub pm10: u32,
    /// Whole degrees celsius.
    #[serde(rename = "t")]
    pub temperature: i16,
    #[serde(rename = "h")]
    pub humidity: i16,
    /// Minutes since the sensor took the reading.
    #[serde(rename = "u")]
    pub last_update: i16,
    #[serde(rename = "a")]
    pub status: i16,
    #[serde(rename = "l")]
    pub latitude: f32,
    #[serde(rename = "n")]
    pub longitude: f32,
}

impl SensorReading for RawReading {
    //a humidity of 0 or below is what the sensor reports when its probe is disconnected
    fn check(&self) -> Result<(), PollError> {
        if self.humidity > 0 {
            Ok(())
        } else {
            Err(PollError::SentinelReading {
                humidity: self.humidity,
            })
        }
    }

    fn status_detail(&self) -> String {
        format!(
            "LastUpdate: {}; Humidity: {}; Temperature: {}; PM25: {}",
            self.last_update, self.humidity, self.temperature, self.pm2_5
        )
    }
}
