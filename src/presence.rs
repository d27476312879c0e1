//! Client presence tracking: per-client heartbeat state observed on the
//! `tspi.ops.status` subject, plus the read-model projections a status
//! surface renders.

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    FollowingLivestream,
    FollowingGroupReplay,
    FollowingPrivateReplay,
    LiveOverride,
}

impl ClientState {
    /// A human label for each state, used by any status surface.
    pub fn state_display(&self) -> &'static str {
        match self {
            Self::FollowingLivestream => "Live",
            Self::FollowingGroupReplay => "Group replay",
            Self::FollowingPrivateReplay => "Private replay",
            Self::LiveOverride => "Live (override)",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPresence {
    pub client_id: String,
    pub channel_id: String,
    pub state: ClientState,
    pub connection_ts: DateTime<Utc>,
    pub last_seen_ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_flag: Option<bool>,
}

impl ClientPresence {
    /// The channel id, or a friendlier literal for the livestream singleton.
    pub fn channel_display(&self) -> &str {
        if self.channel_id == "livestream" {
            "Livestream"
        } else {
            &self.channel_id
        }
    }

    pub fn state_display(&self) -> &'static str {
        self.state.state_display()
    }
}

/// One status heartbeat as observed on the wire, before being folded into a
/// [`ClientPresence`] record.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusHeartbeat {
    pub client_id: String,
    pub state: ClientState,
    pub channel_id: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub ping_ms: Option<u32>,
    #[serde(default, rename = "override")]
    pub override_flag: Option<bool>,
}

/// Shared mutable presence table, safe to hold across await points as long
/// as all status messages for one client are processed serially by the same
/// task (the assumption this tracker relies on).
#[derive(Default)]
pub struct PresenceTracker {
    clients: Mutex<HashMap<String, ClientPresence>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one heartbeat into the tracker. `connection_ts` is set once,
    /// from the first heartbeat ever seen for the client; `last_seen_ts` is
    /// bumped forward but never allowed to move backward.
    pub fn observe(&self, heartbeat: StatusHeartbeat) {
        let mut clients = self.clients.lock();
        match clients.get_mut(&heartbeat.client_id) {
            Some(existing) => {
                existing.channel_id = heartbeat.channel_id;
                existing.state = heartbeat.state;
                existing.operator = heartbeat.operator;
                existing.source_ip = heartbeat.source_ip;
                existing.ping_ms = heartbeat.ping_ms;
                existing.override_flag = heartbeat.override_flag;
                if heartbeat.ts > existing.last_seen_ts {
                    existing.last_seen_ts = heartbeat.ts;
                }
            }
            None => {
                clients.insert(
                    heartbeat.client_id.clone(),
                    ClientPresence {
                        client_id: heartbeat.client_id,
                        channel_id: heartbeat.channel_id,
                        state: heartbeat.state,
                        connection_ts: heartbeat.ts,
                        last_seen_ts: heartbeat.ts,
                        operator: heartbeat.operator,
                        source_ip: heartbeat.source_ip,
                        ping_ms: heartbeat.ping_ms,
                        override_flag: heartbeat.override_flag,
                    },
                );
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ClientPresence> {
        self.clients.lock().get(client_id).cloned()
    }

    pub fn list(&self) -> Vec<ClientPresence> {
        self.clients.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(client_id: &str, ts: DateTime<Utc>) -> StatusHeartbeat {
        StatusHeartbeat {
            client_id: client_id.to_string(),
            state: ClientState::FollowingLivestream,
            channel_id: "livestream".to_string(),
            ts,
            operator: None,
            source_ip: None,
            ping_ms: None,
            override_flag: None,
        }
    }

    #[test]
    fn s8_presence_monotonicity() {
        let tracker = PresenceTracker::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);

        tracker.observe(heartbeat("client-1", t0));
        tracker.observe(heartbeat("client-1", t1));

        let presence = tracker.get("client-1").unwrap();
        assert_eq!(presence.connection_ts, t0);
        assert_eq!(presence.last_seen_ts, t1);
    }

    #[test]
    fn out_of_order_heartbeat_never_moves_last_seen_backward() {
        let tracker = PresenceTracker::new();
        let t0 = Utc::now();
        let earlier = t0 - chrono::Duration::seconds(5);

        tracker.observe(heartbeat("client-1", t0));
        tracker.observe(heartbeat("client-1", earlier));

        let presence = tracker.get("client-1").unwrap();
        assert_eq!(presence.last_seen_ts, t0);
        assert_eq!(presence.connection_ts, t0);
    }

    #[test]
    fn channel_display_prettifies_livestream() {
        let tracker = PresenceTracker::new();
        tracker.observe(heartbeat("client-1", Utc::now()));
        let presence = tracker.get("client-1").unwrap();
        assert_eq!(presence.channel_display(), "Livestream");
        assert_eq!(presence.state_display(), "Live");
    }
}
