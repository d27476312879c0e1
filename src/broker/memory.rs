//! In-memory pub/sub simulator implementing the [`Publisher`]/[`PullConsumer`]
//! capability interfaces, with no network dependency. This is the broker
//! backend exercised by every test in this crate and by any headless run with
//! no broker configured.

use super::subject::{matches, normalise_subjects};
use super::{BrokerError, BrokerMessage, DeliverPolicy, Headers, PullConsumer, Publisher, DEDUP_HEADER};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct StreamData {
    subjects: Vec<String>,
    messages: Vec<BrokerMessage>,
    dedup_ids: HashSet<String>,
}

impl StreamData {
    fn new(subjects: Vec<String>) -> Self {
        Self {
            subjects,
            messages: Vec::new(),
            dedup_ids: HashSet::new(),
        }
    }

    fn claims(&self, subject: &str) -> bool {
        self.subjects.iter().any(|filter| matches(filter, subject))
    }
}

/// A single in-memory broker node: a registry of named streams, each with
/// its own subject set, message log and dedup window.
#[derive(Debug)]
pub struct InMemoryJetStream {
    streams: Mutex<HashMap<String, Arc<Mutex<StreamData>>>>,
}

impl Default for InMemoryJetStream {
    fn default() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }
}

impl InMemoryJetStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the stream if absent. If present, requires that the
    /// normalised subject set already matches; otherwise `StreamConflict`.
    pub fn ensure_stream(&self, name: &str, subjects: Vec<String>) -> Result<(), BrokerError> {
        let normalised = normalise_subjects(&subjects);
        let mut streams = self.streams.lock();
        if let Some(existing) = streams.get(name) {
            let existing_subjects = existing.lock().subjects.clone();
            let existing_normalised = normalise_subjects(&existing_subjects);
            if existing_normalised != normalised {
                return Err(BrokerError::StreamConflict);
            }
            return Ok(());
        }
        streams.insert(name.to_string(), Arc::new(Mutex::new(StreamData::new(normalised))));
        Ok(())
    }

    /// Creates a pull consumer positioned per `deliver_policy` against the
    /// named stream's backlog, filtered by `subject_filter`.
    pub fn create_pull_consumer(
        &self,
        stream: &str,
        subject_filter: &str,
        deliver_policy: DeliverPolicy,
    ) -> InMemoryConsumer {
        let handle = self
            .streams
            .lock()
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamData::new(Vec::new()))))
            .clone();

        let start_cursor = match deliver_policy {
            DeliverPolicy::DeliverNew => handle.lock().messages.len(),
            DeliverPolicy::ByStartTime(start) => {
                let data = handle.lock();
                data.messages
                    .iter()
                    .position(|m| m.published_ts >= start)
                    .unwrap_or(data.messages.len())
            }
        };

        InMemoryConsumer {
            stream: handle,
            subject_filter: subject_filter.to_string(),
            cursor: AtomicUsize::new(start_cursor),
        }
    }
}

impl Publisher for InMemoryJetStream {
    fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Headers,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        let streams = self.streams.lock();
        let target = streams
            .values()
            .find(|stream| stream.lock().claims(subject))
            .cloned();
        drop(streams);

        let target = match target {
            Some(target) => target,
            None => return Err(BrokerError::PublishFailed(format!("no stream claims subject {subject}"))),
        };

        let mut data = target.lock();
        if let Some(dedup_id) = headers.get(DEDUP_HEADER) {
            if data.dedup_ids.contains(dedup_id) {
                return Ok(false);
            }
            data.dedup_ids.insert(dedup_id.clone());
        }

        data.messages.push(BrokerMessage {
            subject: subject.to_string(),
            payload,
            headers,
            published_ts: timestamp,
        });
        Ok(true)
    }
}

/// A pull-style cursor over one stream's backlog, filtered by subject.
#[derive(Debug)]
pub struct InMemoryConsumer {
    stream: Arc<Mutex<StreamData>>,
    subject_filter: String,
    cursor: AtomicUsize,
}

impl PullConsumer for InMemoryConsumer {
    fn pull(&self, batch: usize) -> Vec<BrokerMessage> {
        let data = self.stream.lock();
        let start = self.cursor.load(Ordering::SeqCst);
        let mut delivered = Vec::new();
        let mut index = start;
        while index < data.messages.len() && delivered.len() < batch {
            let message = &data.messages[index];
            if matches(&self.subject_filter, &message.subject) {
                delivered.push(message.clone());
            }
            index += 1;
        }
        self.cursor.store(index, Ordering::SeqCst);
        delivered
    }

    fn pending(&self) -> usize {
        let data = self.stream.lock();
        let start = self.cursor.load(Ordering::SeqCst);
        data.messages[start.min(data.messages.len())..]
            .iter()
            .filter(|message| matches(&self.subject_filter, &message.subject))
            .count()
    }
}

/// Simulates a clustered broker deployment for exercising reconnection and
/// failover logic in tests. All nodes share the same dedup/subject state by
/// delegating to a single [`InMemoryJetStream`]; only the notion of "which
/// node is currently leader" is modelled.
#[derive(Debug)]
pub struct InMemoryJetStreamCluster {
    pub inner: Arc<InMemoryJetStream>,
    node_count: usize,
    leader: Mutex<usize>,
    alive: Mutex<Vec<bool>>,
}

impl InMemoryJetStreamCluster {
    pub fn new(node_count: usize) -> Self {
        assert!(node_count > 0, "a cluster needs at least one node");
        Self {
            inner: Arc::new(InMemoryJetStream::new()),
            node_count,
            leader: Mutex::new(0),
            alive: Mutex::new(vec![true; node_count]),
        }
    }

    pub fn leader(&self) -> usize {
        *self.leader.lock()
    }

    /// Kills the current leader and deterministically fails over to the
    /// next alive node, wrapping around the cluster.
    pub fn kill_leader(&self) -> Option<usize> {
        let mut alive = self.alive.lock();
        let mut leader = self.leader.lock();
        alive[*leader] = false;

        for offset in 1..=self.node_count {
            let candidate = (*leader + offset) % self.node_count;
            if alive[candidate] {
                *leader = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Restores every node to candidacy without changing the current leader.
    pub fn revive_all(&self) {
        let mut alive = self.alive.lock();
        alive.iter_mut().for_each(|node| *node = true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap as HMap;

    fn headers_with_dedup(id: &str) -> Headers {
        let mut headers = HMap::new();
        headers.insert(DEDUP_HEADER.to_string(), id.to_string());
        headers
    }

    #[test]
    fn publish_idempotency() {
        let js = InMemoryJetStream::new();
        js.ensure_stream("TSPI", vec!["tspi.>".to_string()]).unwrap();

        let first = js
            .publish("tspi.geocentric.501", Bytes::from_static(b"a"), headers_with_dedup("x"), Utc::now())
            .unwrap();
        let second = js
            .publish("tspi.geocentric.501", Bytes::from_static(b"b"), headers_with_dedup("x"), Utc::now())
            .unwrap();

        assert!(first);
        assert!(!second);

        let consumer = js.create_pull_consumer("TSPI", "tspi.>", DeliverPolicy::DeliverNew);
        // consumer created after both publishes: nothing new to deliver
        assert_eq!(consumer.pull(10).len(), 0);
    }

    #[test]
    fn wildcard_pull_consumer() {
        let js = InMemoryJetStream::new();
        js.ensure_stream("TSPI", vec!["tspi.>".to_string()]).unwrap();
        let consumer = js.create_pull_consumer("TSPI", "tspi.geocentric.*", DeliverPolicy::DeliverNew);

        js.publish(
            "tspi.geocentric.501",
            Bytes::from_static(b"a"),
            headers_with_dedup("1"),
            Utc::now(),
        )
        .unwrap();
        js.publish(
            "tspi.spherical.2048",
            Bytes::from_static(b"b"),
            headers_with_dedup("2"),
            Utc::now(),
        )
        .unwrap();

        let delivered = consumer.pull(10);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].subject, "tspi.geocentric.501");
        assert_eq!(consumer.pending(), 0);
    }

    #[test]
    fn cluster_failover_is_deterministic() {
        let cluster = InMemoryJetStreamCluster::new(3);
        assert_eq!(cluster.leader(), 0);
        assert_eq!(cluster.kill_leader(), Some(1));
        assert_eq!(cluster.kill_leader(), Some(2));
        // only node 2 left alive
        assert_eq!(cluster.kill_leader(), None);
        cluster.revive_all();
        assert_eq!(cluster.kill_leader(), Some(0));
    }
}
