//! Player state engine: pulls from one selected channel at a time, maintains
//! a bounded scrub timeline, applies command/tag side effects deterministically
//! on forward traversal, and surfaces metrics.

pub mod map;

use crate::archiver::classify;
use crate::broker::PullConsumer;
use crate::codec::{Payload, TspiRecord};
use crate::commands::{Command, CommandPayload};
use crate::database::entities::messages::MessageKind;
use crate::schema::validate_telemetry;
use crate::tags::{TagPayload, TagStatus};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use map::MapSmoother;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
    #[error("schema violation, message dropped from timeline: {0}")]
    SchemaViolation(String),
}

#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Telemetry(TspiRecord),
    Command(Command),
    Tag(TagPayload),
}

impl TimelineEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Telemetry(record) => record.recv_iso,
            Self::Command(command) => command.ts,
            Self::Tag(tag) => tag.ts,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Metrics {
    pub frames: u64,
    pub rate: f64,
    pub clock: DateTime<Utc>,
    pub lag: usize,
    pub source: String,
    pub position: usize,
    pub timeline: usize,
}

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Metrics(Metrics),
    DisplayUnitsChanged(String),
    MarkerColorChanged(String),
    CommandEvent(Command),
    TagEvent(TagPayload),
    StateChanged,
    GroupReplayChanged,
    ErrorOccurred(String),
}

pub struct PlayerConfig {
    pub scrub_history_size: usize,
    pub rate_min: f64,
    pub rate_max: f64,
    pub default_rate: f64,
    pub default_units: String,
    pub default_marker_color: String,
    pub smooth_center: f64,
    pub smooth_zoom: f64,
}

/// Resolves the aliases `"live"`/`"historical"` onto their canonical channel
/// ids before a map lookup.
fn canonical_channel_id(channel_id: &str) -> &str {
    match channel_id {
        "live" => "livestream",
        "historical" => "replay.default",
        other => other,
    }
}

pub struct PlayerEngine {
    channels: HashMap<String, Box<dyn PullConsumer>>,
    active_channel: String,
    timeline: VecDeque<TimelineEntry>,
    position: usize,
    scrub_history_size: usize,
    display_units: String,
    marker_color: String,
    session_metadata: Option<(String, String)>,
    tags: HashMap<String, TagPayload>,
    rate: f64,
    rate_min: f64,
    rate_max: f64,
    frames: u64,
    map: MapSmoother,
    events: Vec<PlayerEvent>,
}

impl PlayerEngine {
    pub fn new(
        channels: HashMap<String, Box<dyn PullConsumer>>,
        initial_channel: &str,
        config: &PlayerConfig,
    ) -> Result<Self, PlayerError> {
        let resolved = canonical_channel_id(initial_channel).to_string();
        if !channels.contains_key(&resolved) {
            return Err(PlayerError::UnknownChannel(resolved));
        }
        Ok(Self {
            channels,
            active_channel: resolved,
            timeline: VecDeque::new(),
            position: 0,
            scrub_history_size: config.scrub_history_size,
            display_units: config.default_units.clone(),
            marker_color: config.default_marker_color.clone(),
            session_metadata: None,
            tags: HashMap::new(),
            rate: config.default_rate.clamp(config.rate_min, config.rate_max),
            rate_min: config.rate_min,
            rate_max: config.rate_max,
            frames: 0,
            map: MapSmoother::new(config.smooth_center, config.smooth_zoom),
            events: Vec::new(),
        })
    }

    pub fn display_units(&self) -> &str {
        &self.display_units
    }

    pub fn marker_color(&self) -> &str {
        &self.marker_color
    }

    pub fn tags(&self) -> &HashMap<String, TagPayload> {
        &self.tags
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn timeline_len(&self) -> usize {
        self.timeline.len()
    }

    pub fn active_channel(&self) -> &str {
        &self.active_channel
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate.clamp(self.rate_min, self.rate_max);
    }

    /// Switches the active channel, discarding the timeline and resetting
    /// position-based state, but preserving command/tag latest state.
    pub fn switch_channel(&mut self, channel_id: &str) -> Result<(), PlayerError> {
        let resolved = canonical_channel_id(channel_id).to_string();
        if !self.channels.contains_key(&resolved) {
            return Err(PlayerError::UnknownChannel(resolved));
        }
        self.active_channel = resolved;
        self.timeline.clear();
        self.position = 0;
        self.events.push(PlayerEvent::StateChanged);
        Ok(())
    }

    /// Pulls up to `batch` messages from the active channel's consumer,
    /// decodes and (for telemetry only) schema-validates them, and appends
    /// surviving entries to the timeline, evicting the oldest entries past
    /// `scrub_history_size`.
    pub fn fetch_more(&mut self, batch: usize) {
        let Some(consumer) = self.channels.get(&self.active_channel) else {
            return;
        };
        let messages = consumer.pull(batch);

        for message in messages {
            let Some(kind) = classify(&message.subject) else { continue };
            let entry = match kind {
                MessageKind::Telemetry => match serde_cbor::from_slice::<TspiRecord>(&message.payload) {
                    Ok(record) => {
                        let value = serde_json::to_value(&record).expect("TspiRecord always serialises");
                        if let Err(err) = validate_telemetry(&value) {
                            self.events.push(PlayerEvent::ErrorOccurred(err.to_string()));
                            continue;
                        }
                        TimelineEntry::Telemetry(record)
                    }
                    Err(err) => {
                        self.events.push(PlayerEvent::ErrorOccurred(err.to_string()));
                        continue;
                    }
                },
                MessageKind::Command => match serde_cbor::from_slice::<Command>(&message.payload) {
                    Ok(command) => TimelineEntry::Command(command),
                    Err(err) => {
                        self.events.push(PlayerEvent::ErrorOccurred(err.to_string()));
                        continue;
                    }
                },
                MessageKind::Tag => match serde_cbor::from_slice::<TagPayload>(&message.payload) {
                    Ok(tag) => TimelineEntry::Tag(tag),
                    Err(err) => {
                        self.events.push(PlayerEvent::ErrorOccurred(err.to_string()));
                        continue;
                    }
                },
            };

            self.timeline.push_back(entry);
            if self.timeline.len() > self.scrub_history_size {
                self.timeline.pop_front();
                self.position = self.position.saturating_sub(1);
            }
        }
    }

    /// Advances the cursor by one, materialising the entry it was pointing
    /// at. A no-op once the cursor has caught up with the timeline.
    pub fn step_once(&mut self) {
        if self.position >= self.timeline.len() {
            return;
        }
        self.materialize(self.position);
        self.position += 1;
    }

    /// Finds the first timeline entry at or after `target`, then scrubs to it.
    pub fn seek(&mut self, target: DateTime<Utc>) {
        let index = self
            .timeline
            .iter()
            .position(|entry| entry.timestamp() >= target)
            .unwrap_or(self.timeline.len());
        self.scrub_to_index(index);
    }

    /// Moves the cursor to `target`, clamped to `[0, len]`. Forward jumps
    /// replay every intervening entry's side effects (so display state and
    /// tag state reflect a continuous playthrough); backward jumps only move
    /// the cursor — latest-value state is never rewound.
    pub fn scrub_to_index(&mut self, target: usize) {
        let target = target.min(self.timeline.len());
        if target > self.position {
            for index in self.position..target {
                self.materialize(index);
            }
        }
        self.position = target;
    }

    fn materialize(&mut self, index: usize) {
        let entry = self.timeline[index].clone();
        match entry {
            TimelineEntry::Telemetry(record) => {
                if let Payload::Geocentric { position, .. } = record.payload {
                    self.map.update(position.x, position.y, self.map.zoom());
                }
                self.frames += 1;
            }
            TimelineEntry::Command(command) => {
                match &command.payload {
                    CommandPayload::DisplayUnits { units } => {
                        self.display_units = units.clone();
                        self.events.push(PlayerEvent::DisplayUnitsChanged(units.clone()));
                    }
                    CommandPayload::DisplayMarkerColor { marker_color } => {
                        self.marker_color = marker_color.clone();
                        self.events.push(PlayerEvent::MarkerColorChanged(marker_color.clone()));
                    }
                    CommandPayload::DisplaySessionMetadata { name, id } => {
                        self.session_metadata = Some((name.clone(), id.clone()));
                    }
                }
                self.events.push(PlayerEvent::CommandEvent(command));
            }
            TimelineEntry::Tag(tag) => {
                let id = tag.id.to_string();
                if tag.status == TagStatus::Deleted {
                    self.tags.remove(&id);
                } else {
                    self.tags.insert(id, tag.clone());
                }
                self.events.push(PlayerEvent::TagEvent(tag));
            }
        }
    }

    /// Builds a metrics snapshot. `lag` is the active consumer's reported
    /// pending count.
    pub fn metrics(&self) -> Metrics {
        let lag = self.channels.get(&self.active_channel).map(|c| c.pending()).unwrap_or(0);
        Metrics {
            frames: self.frames,
            rate: self.rate,
            clock: Utc::now(),
            lag,
            source: self.active_channel.clone(),
            position: self.position,
            timeline: self.timeline.len(),
        }
    }

    /// Drains accumulated events since the last call.
    pub fn take_events(&mut self) -> Vec<PlayerEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryJetStream;
    use crate::broker::DeliverPolicy;
    use crate::commands::CommandSender;
    use crate::tags::TagSender;
    use bytes::{BufMut, BytesMut};
    use std::sync::Arc;

    fn test_config() -> PlayerConfig {
        PlayerConfig {
            scrub_history_size: 600,
            rate_min: 0.01,
            rate_max: 4.0,
            default_rate: 1.0,
            default_units: "metric".to_string(),
            default_marker_color: "#00ff00".to_string(),
            smooth_center: 0.85,
            smooth_zoom: 0.85,
        }
    }

    fn geocentric_datagram() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(0xC1);
        buf.put_u8(4);
        buf.put_u16(501);
        buf.put_u16(1);
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_u16(0);
        for _ in 0..3 {
            buf.put_i32(0);
        }
        for _ in 0..6 {
            buf.put_i16(0);
        }
        buf.to_vec()
    }

    #[test]
    fn s5_forward_jump_replays_commands_and_tags() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("TSPI", vec!["tspi.>".to_string(), "tags.>".to_string()]).unwrap();

        let producer = crate::producer::Producer::new(js.clone(), "tspi", None);
        producer.ingest(&geocentric_datagram(), None).unwrap();

        let command_sender = CommandSender::new(js.clone(), "operator-1");
        command_sender.send_units("imperial").unwrap();

        let tag_sender = TagSender::new(js.clone(), "operator-1");
        tag_sender.create_tag("target acquired", None, None).unwrap();

        producer.ingest(&geocentric_datagram(), None).unwrap();

        let consumer = js.create_pull_consumer("TSPI", "tspi.>", DeliverPolicy::DeliverNew);
        let mut channels: HashMap<String, Box<dyn PullConsumer>> = HashMap::new();
        channels.insert("livestream".to_string(), Box::new(consumer));

        let config = test_config();
        let mut engine = PlayerEngine::new(channels, "live", &config).unwrap();
        engine.fetch_more(10);
        assert_eq!(engine.timeline_len(), 4);

        engine.scrub_to_index(3);
        assert_eq!(engine.position(), 3);
        assert_eq!(engine.display_units(), "imperial");
        assert_eq!(engine.tags().len(), 1);

        let events = engine.take_events();
        let command_events = events.iter().filter(|e| matches!(e, PlayerEvent::CommandEvent(_))).count();
        let tag_events = events.iter().filter(|e| matches!(e, PlayerEvent::TagEvent(_))).count();
        assert_eq!(command_events, 1);
        assert_eq!(tag_events, 1);
    }

    #[test]
    fn backward_jump_does_not_rewind_latest_state() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("TSPI", vec!["tspi.>".to_string()]).unwrap();

        let producer = crate::producer::Producer::new(js.clone(), "tspi", None);
        producer.ingest(&geocentric_datagram(), None).unwrap();

        let command_sender = CommandSender::new(js.clone(), "operator-1");
        command_sender.send_units("imperial").unwrap();

        let consumer = js.create_pull_consumer("TSPI", "tspi.>", DeliverPolicy::DeliverNew);
        let mut channels: HashMap<String, Box<dyn PullConsumer>> = HashMap::new();
        channels.insert("livestream".to_string(), Box::new(consumer));

        let config = test_config();
        let mut engine = PlayerEngine::new(channels, "live", &config).unwrap();
        engine.fetch_more(10);
        engine.scrub_to_index(2);
        assert_eq!(engine.display_units(), "imperial");

        engine.scrub_to_index(0);
        assert_eq!(engine.position(), 0);
        assert_eq!(engine.display_units(), "imperial", "latest-value state must not rewind");
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let channels: HashMap<String, Box<dyn PullConsumer>> = HashMap::new();
        let config = test_config();
        assert!(PlayerEngine::new(channels, "live", &config).is_err());
    }

    #[test]
    fn bounded_timeline_evicts_oldest_and_clamps_position() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("TSPI", vec!["tspi.>".to_string()]).unwrap();
        let producer = crate::producer::Producer::new(js.clone(), "tspi", None);

        // Each datagram must carry a distinct dedup id to avoid being
        // suppressed by the broker, so vary sensor_id per iteration.
        for sensor_id in 0..5u16 {
            let mut buf = BytesMut::new();
            buf.put_u8(0xC1);
            buf.put_u8(4);
            buf.put_u16(sensor_id);
            buf.put_u16(1);
            buf.put_u32(1);
            buf.put_u8(0);
            buf.put_u16(0);
            for _ in 0..3 {
                buf.put_i32(0);
            }
            for _ in 0..6 {
                buf.put_i16(0);
            }
            producer.ingest(&buf, None).unwrap();
        }

        let consumer = js.create_pull_consumer("TSPI", "tspi.>", DeliverPolicy::DeliverNew);
        let mut channels: HashMap<String, Box<dyn PullConsumer>> = HashMap::new();
        channels.insert("livestream".to_string(), Box::new(consumer));

        let mut config = test_config();
        config.scrub_history_size = 3;
        let mut engine = PlayerEngine::new(channels, "live", &config).unwrap();
        engine.fetch_more(10);
        assert_eq!(engine.timeline_len(), 3);

        engine.scrub_to_index(3);
        engine.fetch_more(10);
        // eviction keeps position clamped within bounds, never negative.
        assert!(engine.position() <= engine.timeline_len());
    }
}
