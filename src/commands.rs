//! Operator commands: per-field senders with validation, plus the
//! `tspi.ops.ctrl` sender used by the channel control plane.

use crate::broker::{BrokerError, Headers, Publisher, DEDUP_HEADER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const COMMAND_SUBJECT_PREFIX: &str = "tspi.cmd.display";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("units must be 'metric' or 'imperial', got {0:?}")]
    InvalidUnits(String),
    #[error("marker_color must not be empty")]
    EmptyMarkerColor,
    #[error("session name and id must both be non-empty")]
    EmptySessionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "snake_case")]
pub enum CommandPayload {
    #[serde(rename = "display.units")]
    DisplayUnits { units: String },
    #[serde(rename = "display.marker_color")]
    DisplayMarkerColor { marker_color: String },
    #[serde(rename = "display.session_metadata")]
    DisplaySessionMetadata { name: String, id: String },
}

impl CommandPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DisplayUnits { .. } => "display.units",
            Self::DisplayMarkerColor { .. } => "display.marker_color",
            Self::DisplaySessionMetadata { .. } => "display.session_metadata",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub cmd_id: Uuid,
    pub name: String,
    pub ts: DateTime<Utc>,
    pub sender: String,
    pub payload: CommandPayload,
}

pub struct CommandSender<P: Publisher> {
    publisher: Arc<P>,
    sender_id: String,
}

impl<P: Publisher> CommandSender<P> {
    pub fn new(publisher: Arc<P>, sender_id: impl Into<String>) -> Self {
        Self {
            publisher,
            sender_id: sender_id.into(),
        }
    }

    pub fn send_units(&self, units: &str) -> Result<bool, CommandSendError> {
        let normalised = units.to_ascii_lowercase();
        if normalised != "metric" && normalised != "imperial" {
            return Err(ValidationError::InvalidUnits(units.to_string()).into());
        }
        self.send(CommandPayload::DisplayUnits { units: normalised })
    }

    pub fn send_marker_color(&self, marker_color: &str) -> Result<bool, CommandSendError> {
        let trimmed = marker_color.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyMarkerColor.into());
        }
        self.send(CommandPayload::DisplayMarkerColor {
            marker_color: trimmed.to_string(),
        })
    }

    pub fn send_session_metadata(&self, name: &str, id: &str) -> Result<bool, CommandSendError> {
        let name = name.trim();
        let id = id.trim();
        if name.is_empty() || id.is_empty() {
            return Err(ValidationError::EmptySessionMetadata.into());
        }
        self.send(CommandPayload::DisplaySessionMetadata {
            name: name.to_string(),
            id: id.to_string(),
        })
    }

    fn send(&self, payload: CommandPayload) -> Result<bool, CommandSendError> {
        let cmd_id = Uuid::new_v4();
        let command = Command {
            cmd_id,
            name: payload.name().to_string(),
            ts: Utc::now(),
            sender: self.sender_id.clone(),
            payload,
        };

        let subject = format!("{COMMAND_SUBJECT_PREFIX}.{}", command.name.trim_start_matches("display."));
        let mut headers = Headers::new();
        headers.insert(DEDUP_HEADER.to_string(), cmd_id.to_string());

        let body = serde_cbor::to_vec(&command).expect("Command always serialises");
        Ok(self.publisher.publish(&subject, bytes::Bytes::from(body), headers, command.ts)?)
    }
}

#[derive(Debug, Error)]
pub enum CommandSendError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryJetStream;

    #[test]
    fn units_case_insensitive_and_validated() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("CMD", vec![format!("{COMMAND_SUBJECT_PREFIX}.>")]).unwrap();
        let sender = CommandSender::new(js, "operator-1");

        assert!(sender.send_units("METRIC").unwrap());
        assert!(sender.send_units("Imperial").unwrap());
        assert!(sender.send_units("furlongs").is_err());
    }

    #[test]
    fn marker_color_rejects_blank() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("CMD", vec![format!("{COMMAND_SUBJECT_PREFIX}.>")]).unwrap();
        let sender = CommandSender::new(js, "operator-1");
        assert!(sender.send_marker_color("   ").is_err());
        assert!(sender.send_marker_color("#ff0000").is_ok());
    }

    #[test]
    fn session_metadata_requires_both_fields() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("CMD", vec![format!("{COMMAND_SUBJECT_PREFIX}.>")]).unwrap();
        let sender = CommandSender::new(js, "operator-1");
        assert!(sender.send_session_metadata("", "abc").is_err());
        assert!(sender.send_session_metadata("Exercise", "abc").is_ok());
    }
}
