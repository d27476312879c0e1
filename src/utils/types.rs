//! Module for type aliases that help to better identify field types

pub type SensorId = u16;
pub type DayOfYear = u16;
pub type TimeTicks = u32;
pub type ChannelId = String;
pub type Subject = String;
