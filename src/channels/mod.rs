//! Channel directory and control plane: the livestream singleton, operator
//! group replays keyed by timestamp/label, and per-client private replays.

use crate::broker::{BrokerError, Headers, Publisher, DEDUP_HEADER};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const TSPI_STREAM: &str = "TSPI";
pub const TSPI_REPLAY_STREAM: &str = "TSPI_REPLAY";
pub const LIVESTREAM_SUBJECT: &str = "tspi.channel.livestream";
pub const REPLAY_SUBJECT_PREFIX: &str = "tspi.channel.replay";
pub const CLIENT_SUBJECT_PREFIX: &str = "tspi.channel.client";
pub const OPS_CONTROL_SUBJECT: &str = "tspi.ops.ctrl";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Livestream,
    GroupReplay,
    PrivateReplay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub channel_id: String,
    pub subject: String,
    pub display_name: String,
    pub kind: ChannelKind,
    pub stream: String,
    pub identifier: Option<String>,
}

impl ChannelDescriptor {
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("ChannelDescriptor always serialises")
    }
}

/// The singleton, immortal livestream descriptor.
pub fn live_channel() -> ChannelDescriptor {
    ChannelDescriptor {
        channel_id: "livestream".to_string(),
        subject: LIVESTREAM_SUBJECT.to_string(),
        display_name: "Livestream".to_string(),
        kind: ChannelKind::Livestream,
        stream: TSPI_STREAM.to_string(),
        identifier: None,
    }
}

fn slugify_identifier(value: &str) -> Result<String, ChannelError> {
    let mut slug_parts = Vec::new();
    let mut current = String::new();
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            slug_parts.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        slug_parts.push(current);
    }
    if slug_parts.is_empty() {
        return Err(ChannelError::Validation(
            "identifier has no usable alphanumeric content".to_string(),
        ));
    }
    Ok(slug_parts.join("-"))
}

/// Builds a group replay channel descriptor. `identifier` may be an ISO-8601
/// timestamp, a numeric epoch-seconds string, or a free-form label.
pub fn group_replay_channel(
    identifier: &str,
    stream: &str,
    display_name: Option<&str>,
) -> Result<ChannelDescriptor, ChannelError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(ChannelError::Validation("identifier must not be empty".to_string()));
    }

    let as_instant: Option<DateTime<Utc>> = trimmed
        .parse::<i64>()
        .ok()
        .map(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .flatten()
        .or_else(|| DateTime::parse_from_rfc3339(trimmed).ok().map(|dt| dt.with_timezone(&Utc)));

    let (canonical_identifier, suffix, default_display) = match as_instant {
        Some(instant) => {
            let canonical = instant.format("%Y-%m-%dT%H:%M:%SZ").to_string();
            let suffix = instant.format("%Y%m%dT%H%M%SZ").to_string();
            let default_display = format!("replay {canonical}");
            (canonical, suffix, default_display)
        }
        None => {
            let slug = slugify_identifier(trimmed)?;
            (trimmed.to_string(), slug, trimmed.to_string())
        }
    };

    Ok(ChannelDescriptor {
        channel_id: format!("replay.{suffix}"),
        subject: format!("{REPLAY_SUBJECT_PREFIX}.{suffix}"),
        display_name: display_name.map(str::to_string).unwrap_or(default_display),
        kind: ChannelKind::GroupReplay,
        stream: stream.to_string(),
        identifier: Some(canonical_identifier),
    })
}

/// Builds a private replay channel descriptor scoped to one client/session.
pub fn private_channel(client_id: &str, session_id: &str, stream: &str) -> Result<ChannelDescriptor, ChannelError> {
    let client_id = client_id.trim();
    let session_id = session_id.trim();
    if client_id.is_empty() || session_id.is_empty() {
        return Err(ChannelError::Validation(
            "client_id and session_id must both be non-empty".to_string(),
        ));
    }

    Ok(ChannelDescriptor {
        channel_id: format!("client.{client_id}.{session_id}"),
        subject: format!("{CLIENT_SUBJECT_PREFIX}.{client_id}.{session_id}"),
        display_name: format!("{client_id} / {session_id}"),
        kind: ChannelKind::PrivateReplay,
        stream: stream.to_string(),
        identifier: None,
    })
}

/// Directory sort order: livestream first, then group replays, then private
/// replays (when included).
fn sort_rank(kind: ChannelKind) -> u8 {
    match kind {
        ChannelKind::Livestream => 0,
        ChannelKind::GroupReplay => 1,
        ChannelKind::PrivateReplay => 2,
    }
}

#[derive(Default)]
pub struct ChannelDirectory {
    channels: Vec<ChannelDescriptor>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self {
            channels: vec![live_channel()],
        }
    }

    pub fn upsert(&mut self, descriptor: ChannelDescriptor) {
        if let Some(existing) = self.channels.iter_mut().find(|c| c.channel_id == descriptor.channel_id) {
            *existing = descriptor;
        } else {
            self.channels.push(descriptor);
        }
    }

    pub fn get(&self, channel_id: &str) -> Option<&ChannelDescriptor> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }

    /// Removing the livestream is a no-op; removing an unknown channel is
    /// also a no-op.
    pub fn remove(&mut self, channel_id: &str) {
        if channel_id == "livestream" {
            return;
        }
        self.channels.retain(|c| c.channel_id != channel_id);
    }

    pub fn list_channels(&self, include_private: bool) -> Vec<&ChannelDescriptor> {
        let mut channels: Vec<&ChannelDescriptor> = self
            .channels
            .iter()
            .filter(|c| include_private || c.kind != ChannelKind::PrivateReplay)
            .collect();
        channels.sort_by(|a, b| {
            sort_rank(a.kind)
                .cmp(&sort_rank(b.kind))
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        channels
    }

    pub fn to_dicts(&self, include_private: bool) -> Vec<serde_json::Value> {
        self.list_channels(include_private).into_iter().map(ChannelDescriptor::to_dict).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Per-channel-kind pull-consumer configuration, as a wire-ready projection.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerConfig {
    pub deliver_policy: String,
    pub replay_policy: Option<&'static str>,
    pub ack_policy: &'static str,
    pub flow_control: bool,
    pub idle_heartbeat: bool,
    pub description: Option<String>,
    pub inactive_threshold: Option<u32>,
}

pub fn live_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        deliver_policy: "deliver_new".to_string(),
        replay_policy: None,
        ack_policy: "none",
        flow_control: true,
        idle_heartbeat: true,
        description: None,
        inactive_threshold: None,
    }
}

pub fn replay_consumer_config(channel: &ChannelDescriptor) -> ConsumerConfig {
    let identifier_implies_start = channel
        .identifier
        .as_deref()
        .map(|id| DateTime::parse_from_rfc3339(id).is_ok() || DateTime::parse_from_str(id, "%Y-%m-%dT%H:%M:%SZ").is_ok())
        .unwrap_or(false);

    match channel.kind {
        ChannelKind::GroupReplay => ConsumerConfig {
            deliver_policy: if identifier_implies_start {
                "by_start_time".to_string()
            } else {
                "deliver_new".to_string()
            },
            replay_policy: Some("original"),
            ack_policy: "none",
            flow_control: true,
            idle_heartbeat: true,
            description: Some(format!("group replay {}", channel.channel_id)),
            inactive_threshold: None,
        },
        ChannelKind::PrivateReplay => ConsumerConfig {
            deliver_policy: "deliver_new".to_string(),
            replay_policy: Some("original"),
            ack_policy: "none",
            flow_control: false,
            idle_heartbeat: false,
            description: None,
            inactive_threshold: Some(120),
        },
        ChannelKind::Livestream => live_consumer_config(),
    }
}

pub fn replay_advertisement_subjects() -> Vec<String> {
    vec![
        format!("{REPLAY_SUBJECT_PREFIX}.>"),
        format!("{CLIENT_SUBJECT_PREFIX}.>"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    GroupReplayStart {
        channel_id: String,
        display_name: String,
        stream: String,
        identifier: Option<String>,
    },
    GroupReplayStop {
        channel_id: String,
    },
}

/// Owns the channel directory and emits start/stop control-broadcast
/// messages for operator-initiated group replays.
pub struct ChannelManager<P: Publisher> {
    publisher: Arc<P>,
    directory: parking_lot::Mutex<ChannelDirectory>,
    most_recent_group_replay: parking_lot::Mutex<Option<String>>,
}

impl<P: Publisher> ChannelManager<P> {
    pub fn new(publisher: Arc<P>) -> Self {
        Self {
            publisher,
            directory: parking_lot::Mutex::new(ChannelDirectory::new()),
            most_recent_group_replay: parking_lot::Mutex::new(None),
        }
    }

    pub fn directory(&self) -> parking_lot::MutexGuard<'_, ChannelDirectory> {
        self.directory.lock()
    }

    pub fn start_group_replay(
        &self,
        identifier: &str,
        stream: &str,
        display_name: Option<&str>,
    ) -> Result<ChannelDescriptor, ChannelError> {
        let descriptor = group_replay_channel(identifier, stream, display_name)?;
        self.directory.lock().upsert(descriptor.clone());
        *self.most_recent_group_replay.lock() = Some(descriptor.channel_id.clone());

        let _ = self.publish_control(ControlMessage::GroupReplayStart {
            channel_id: descriptor.channel_id.clone(),
            display_name: descriptor.display_name.clone(),
            stream: descriptor.stream.clone(),
            identifier: descriptor.identifier.clone(),
        });

        Ok(descriptor)
    }

    /// Stops `channel_id`, or the most-recently-started group replay if
    /// `None`. Stopping an unknown channel, an absent channel, or a channel
    /// that isn't a group replay (e.g. a private replay sharing the id
    /// namespace) is a no-op.
    pub fn stop_group_replay(&self, channel_id: Option<&str>) {
        let target = channel_id
            .map(str::to_string)
            .or_else(|| self.most_recent_group_replay.lock().clone());

        let Some(target) = target else { return };

        let is_group_replay = self
            .directory
            .lock()
            .get(&target)
            .is_some_and(|channel| channel.kind == ChannelKind::GroupReplay);
        if !is_group_replay {
            return;
        }

        self.directory.lock().remove(&target);

        let mut most_recent = self.most_recent_group_replay.lock();
        if most_recent.as_deref() == Some(target.as_str()) {
            *most_recent = None;
        }
        drop(most_recent);

        let _ = self.publish_control(ControlMessage::GroupReplayStop { channel_id: target });
    }

    pub fn register_private_channel(&self, client_id: &str, session_id: &str, stream: &str) -> Result<ChannelDescriptor, ChannelError> {
        let descriptor = private_channel(client_id, session_id, stream)?;
        self.directory.lock().upsert(descriptor.clone());
        Ok(descriptor)
    }

    pub fn remove_private_channel(&self, channel_id: &str) {
        self.directory.lock().remove(channel_id);
    }

    fn publish_control(&self, message: ControlMessage) -> Result<bool, BrokerError> {
        let (channel_id, action) = match &message {
            ControlMessage::GroupReplayStart { channel_id, .. } => (channel_id.clone(), "start"),
            ControlMessage::GroupReplayStop { channel_id } => (channel_id.clone(), "stop"),
        };
        let dedup_id = format!("{channel_id}:{action}:{}", Uuid::new_v4());
        let mut headers = Headers::new();
        headers.insert(DEDUP_HEADER.to_string(), dedup_id);
        headers.insert("X-Command-Sender".to_string(), "channel-manager".to_string());

        let body = serde_cbor::to_vec(&message).expect("ControlMessage always serialises");
        self.publisher
            .publish(OPS_CONTROL_SUBJECT, bytes::Bytes::from(body), headers, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryJetStream;

    #[test]
    fn s4_group_replay_lifecycle() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("OPS", vec![OPS_CONTROL_SUBJECT.to_string()]).unwrap();
        let manager = ChannelManager::new(js);

        let descriptor = manager.start_group_replay("2025-09-28T11:00:00Z", TSPI_REPLAY_STREAM, None).unwrap();
        assert_eq!(descriptor.channel_id, "replay.20250928T110000Z");
        assert_eq!(descriptor.subject, "tspi.channel.replay.20250928T110000Z");
        assert_eq!(manager.directory().len(), 2);

        manager.stop_group_replay(None);
        assert_eq!(manager.directory().len(), 1);
    }

    #[test]
    fn stop_group_replay_will_not_tear_down_a_private_channel() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("OPS", vec![OPS_CONTROL_SUBJECT.to_string()]).unwrap();
        let manager = ChannelManager::new(js);

        let private = manager.register_private_channel("client-1", "session-1", TSPI_REPLAY_STREAM).unwrap();
        assert_eq!(manager.directory().len(), 2);

        manager.stop_group_replay(Some(&private.channel_id));
        assert_eq!(manager.directory().len(), 2, "a private channel must survive a group-replay stop");
    }

    #[test]
    fn label_identifier_slugs_stably() {
        let a = group_replay_channel("Morning Drill!!", "TSPI_REPLAY", None).unwrap();
        let b = group_replay_channel("Morning Drill!!", "TSPI_REPLAY", None).unwrap();
        assert_eq!(a.channel_id, b.channel_id);
        assert_eq!(a.channel_id, "replay.morning-drill");
    }

    #[test]
    fn private_channel_requires_both_parts() {
        assert!(private_channel("", "session", "TSPI").is_err());
        assert!(private_channel("client", "", "TSPI").is_err());
        assert!(private_channel("client", "session", "TSPI").is_ok());
    }

    #[test]
    fn directory_orders_livestream_first() {
        let mut directory = ChannelDirectory::new();
        directory.upsert(group_replay_channel("label", "TSPI_REPLAY", None).unwrap());
        directory.upsert(private_channel("c1", "s1", "TSPI_REPLAY").unwrap());

        let listed = directory.list_channels(true);
        assert_eq!(listed[0].kind, ChannelKind::Livestream);
        assert_eq!(listed[1].kind, ChannelKind::GroupReplay);
        assert_eq!(listed[2].kind, ChannelKind::PrivateReplay);

        let listed_public = directory.list_channels(false);
        assert_eq!(listed_public.len(), 2);
    }
}
