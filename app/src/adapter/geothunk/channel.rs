use derive_more::derive::Display;

use crate::core::unit::{DegreeCelsius, Percent};

use super::RawReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Channel {
    #[display("pm1")]
    Pm1,
    #[display("pm25")]
    Pm25,
    #[display("pm10")]
    Pm10,
    #[display("humidity")]
    Humidity,
    #[display("temperature")]
    Temperature,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Pm1,
        Channel::Pm25,
        Channel::Pm10,
        Channel::Humidity,
        Channel::Temperature,
    ];

    /// Everything after `#` addresses a sub-channel of the linking side and is ignored here.
    pub fn parse(channel_id: &str) -> Option<Channel> {
        let id = channel_id.split_once('#').map_or(channel_id, |(id, _)| id);

        match id {
            "pm1" => Some(Channel::Pm1),
            "pm25" => Some(Channel::Pm25),
            "pm10" => Some(Channel::Pm10),
            "humidity" => Some(Channel::Humidity),
            "temperature" => Some(Channel::Temperature),
            _ => None,
        }
    }

    pub fn value_of(&self, reading: &RawReading) -> ChannelValue {
        match self {
            Channel::Pm1 => ChannelValue::Count(reading.pm1),
            Channel::Pm25 => ChannelValue::Count(reading.pm2_5),
            Channel::Pm10 => ChannelValue::Count(reading.pm10),
            Channel::Humidity => ChannelValue::Percentage(reading.humidity.into()),
            Channel::Temperature => ChannelValue::Temperature(reading.temperature.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Display)]
pub enum ChannelValue {
    Count(u32),
    Temperature(DegreeCelsius),
    Percentage(Percent),
    #[display("UNDEF")]
    Undefined,
}

/// Value of `channel_id` for `reading`. Unknown channels and a missing reading yield `Undefined`.
pub fn resolve(channel_id: &str, reading: Option<&RawReading>) -> ChannelValue {
    match (Channel::parse(channel_id), reading) {
        (Some(channel), Some(reading)) => channel.value_of(reading),
        _ => ChannelValue::Undefined,
    }
}
