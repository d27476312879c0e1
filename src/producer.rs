//! Stateless bridge from a raw datagram to a broker publish.
//!
//! Both [`Producer::ingest`] and [`Producer::ingest_async`] share
//! [`Producer::prepare`]; they differ only in whether the publish call
//! blocks the caller's thread or is awaited.

use crate::broker::{BrokerError, Headers, Publisher, DEDUP_HEADER};
use crate::codec::{decode_tspi_datagram, ParseError, TspiRecord};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use std::sync::Arc;

/// Outcome of preparing a datagram for publish.
pub struct PreparedMessage {
    pub record: TspiRecord,
    pub subject: String,
    pub headers: Headers,
    pub body: Bytes,
}

pub struct Producer<P: Publisher> {
    publisher: Arc<P>,
    stream_prefix: String,
    allowed_sensors: Option<HashSet<u16>>,
}

impl<P: Publisher> Producer<P> {
    pub fn new(publisher: Arc<P>, stream_prefix: impl Into<String>, allowed_sensors: Option<HashSet<u16>>) -> Self {
        Self {
            publisher,
            stream_prefix: stream_prefix.into(),
            allowed_sensors,
        }
    }

    /// Parses `datagram`, applies the sensor allow-list, and builds the
    /// subject/headers/CBOR body a publish needs. Returns `Ok(None)` (not an
    /// error) when the sensor is filtered out.
    fn prepare(&self, datagram: &[u8], recv_time: DateTime<Utc>) -> Result<Option<PreparedMessage>, ParseError> {
        let record = decode_tspi_datagram(datagram, recv_time)?;

        if let Some(allowed) = &self.allowed_sensors {
            if !allowed.contains(&record.sensor_id) {
                return Ok(None);
            }
        }

        let subject = record.subject(&self.stream_prefix);
        let mut headers = Headers::new();
        headers.insert(DEDUP_HEADER.to_string(), record.dedup_id());

        let body = serde_cbor::to_vec(&record).expect("TspiRecord always serialises to CBOR");

        Ok(Some(PreparedMessage {
            record,
            subject,
            headers,
            body: Bytes::from(body),
        }))
    }

    /// Synchronous ingest: parses, filters, and publishes in one blocking call.
    pub fn ingest(&self, datagram: &[u8], recv_time: Option<DateTime<Utc>>) -> Result<bool, IngestError> {
        let recv_time = recv_time.unwrap_or_else(Utc::now);
        match self.prepare(datagram, recv_time)? {
            Some(prepared) => Ok(self
                .publisher
                .publish(&prepared.subject, prepared.body, prepared.headers, recv_time)?),
            None => Ok(false),
        }
    }

    /// Asynchronous ingest, sharing [`Producer::prepare`] with [`Producer::ingest`]
    /// and differing only in that the publish call is awaited rather than
    /// executed inline. This crate's in-memory publisher has no suspension
    /// point of its own, so the `.await` here is the single bridge point a
    /// networked publisher would suspend at.
    pub async fn ingest_async(&self, datagram: &[u8], recv_time: Option<DateTime<Utc>>) -> Result<bool, IngestError> {
        let recv_time = recv_time.unwrap_or_else(Utc::now);
        match self.prepare(datagram, recv_time)? {
            Some(prepared) => {
                let publisher = self.publisher.clone();
                let subject = prepared.subject;
                let body = prepared.body;
                let headers = prepared.headers;
                let result = tokio::task::spawn_blocking(move || publisher.publish(&subject, body, headers, recv_time))
                    .await
                    .expect("publish task panicked")?;
                Ok(result)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryJetStream;
    use crate::broker::DeliverPolicy;

    fn geocentric_datagram() -> Vec<u8> {
        use bytes::{BufMut, BytesMut};
        let mut buf = BytesMut::new();
        buf.put_u8(0xC1);
        buf.put_u8(4);
        buf.put_u16(501);
        buf.put_u16(123);
        buf.put_u32(15340);
        buf.put_u8(0xFF);
        buf.put_u16(0x0001);
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.to_vec()
    }

    #[test]
    fn allow_list_filters_without_erroring() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("TSPI", vec!["tspi.>".to_string()]).unwrap();
        let mut allowed = HashSet::new();
        allowed.insert(999u16);
        let producer = Producer::new(js.clone(), "tspi", Some(allowed));

        let published = producer.ingest(&geocentric_datagram(), None).unwrap();
        assert!(!published);

        let consumer = js.create_pull_consumer("TSPI", "tspi.>", DeliverPolicy::DeliverNew);
        assert_eq!(consumer.pending(), 0);
    }

    #[test]
    fn ingest_publishes_with_dedup_header() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("TSPI", vec!["tspi.>".to_string()]).unwrap();
        let producer = Producer::new(js.clone(), "tspi", None);
        let consumer = js.create_pull_consumer("TSPI", "tspi.>", DeliverPolicy::DeliverNew);

        let published = producer.ingest(&geocentric_datagram(), None).unwrap();
        assert!(published);

        let delivered = consumer.pull(10);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].headers.get(DEDUP_HEADER).unwrap(), "501:123:15340");
    }
}
