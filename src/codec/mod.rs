//! Binary TSPI datagram codec.
//!
//! Frames are exactly 37 bytes, big-endian: a 9 byte header followed by a 28
//! byte payload whose interpretation depends on the header's type byte.

use crate::utils::types::{DayOfYear, SensorId, TimeTicks};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Total length of a TSPI datagram on the wire.
pub const DATAGRAM_LENGTH: usize = 37;
/// Length of the fixed header.
const HEADER_LENGTH: usize = 9;
/// Length of the payload, regardless of message kind.
const PAYLOAD_LENGTH: usize = 28;

/// Protocol version this codec accepts. Datagrams carrying any other
/// version byte are rejected.
pub const SUPPORTED_VERSION: u8 = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} bytes but received {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("unsupported datagram type byte {0:#04x}")]
    UnsupportedType(u8),
    #[error("unsupported datagram version {0}")]
    UnsupportedVersion(u8),
}

/// The two datagram kinds this codec understands, identified by the
/// first byte of the header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Geocentric,
    Spherical,
}

impl MessageType {
    const GEOCENTRIC_BYTE: u8 = 0xC1;
    const SPHERICAL_BYTE: u8 = 0xC2;

    fn from_byte(byte: u8) -> Result<Self, ParseError> {
        match byte {
            Self::GEOCENTRIC_BYTE => Ok(Self::Geocentric),
            Self::SPHERICAL_BYTE => Ok(Self::Spherical),
            other => Err(ParseError::UnsupportedType(other)),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Geocentric => Self::GEOCENTRIC_BYTE,
            Self::Spherical => Self::SPHERICAL_BYTE,
        }
    }

    /// The routing token used when building a subject, e.g. `tspi.geocentric.501`.
    pub fn subject_token(self) -> &'static str {
        match self {
            Self::Geocentric => "geocentric",
            Self::Spherical => "spherical",
        }
    }
}

bitflags! {
    /// Named status booleans, in the fixed order the wire format commits to:
    /// position x/y/z, velocity x/y/z, acceleration x/y/z.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        const POSITION_X_VALID     = 1 << 0;
        const POSITION_Y_VALID     = 1 << 1;
        const POSITION_Z_VALID     = 1 << 2;
        const VELOCITY_X_VALID     = 1 << 3;
        const VELOCITY_Y_VALID     = 1 << 4;
        const VELOCITY_Z_VALID     = 1 << 5;
        const ACCELERATION_X_VALID = 1 << 6;
        const ACCELERATION_Y_VALID = 1 << 7;
        const ACCELERATION_Z_VALID = 1 << 8;
    }
}

impl StatusFlags {
    /// Builds the combined flag set from the header's `status` byte and
    /// `status_flags` 16-bit field, matching the reference 24-bit union
    /// `status | (status_flags << 8)`.
    fn from_header_fields(status: u8, status_flags_msb: u16) -> Self {
        let combined = (status as u32) | ((status_flags_msb as u32) << 8);
        Self::from_bits_truncate(combined)
    }
}

/// Wire shape of [`StatusFlags`]: an object of the 9 named booleans, in the
/// fixed order the format commits to, matching the telemetry envelope schema.
/// `bitflags`'s own `serde` support renders a human-readable flag set as a
/// single `"NAME | NAME"` string, which this envelope does not use.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
struct StatusFlagsWire {
    position_x_valid: bool,
    position_y_valid: bool,
    position_z_valid: bool,
    velocity_x_valid: bool,
    velocity_y_valid: bool,
    velocity_z_valid: bool,
    acceleration_x_valid: bool,
    acceleration_y_valid: bool,
    acceleration_z_valid: bool,
}

impl From<StatusFlags> for StatusFlagsWire {
    fn from(flags: StatusFlags) -> Self {
        Self {
            position_x_valid: flags.contains(StatusFlags::POSITION_X_VALID),
            position_y_valid: flags.contains(StatusFlags::POSITION_Y_VALID),
            position_z_valid: flags.contains(StatusFlags::POSITION_Z_VALID),
            velocity_x_valid: flags.contains(StatusFlags::VELOCITY_X_VALID),
            velocity_y_valid: flags.contains(StatusFlags::VELOCITY_Y_VALID),
            velocity_z_valid: flags.contains(StatusFlags::VELOCITY_Z_VALID),
            acceleration_x_valid: flags.contains(StatusFlags::ACCELERATION_X_VALID),
            acceleration_y_valid: flags.contains(StatusFlags::ACCELERATION_Y_VALID),
            acceleration_z_valid: flags.contains(StatusFlags::ACCELERATION_Z_VALID),
        }
    }
}

impl From<StatusFlagsWire> for StatusFlags {
    fn from(wire: StatusFlagsWire) -> Self {
        let mut flags = StatusFlags::empty();
        flags.set(StatusFlags::POSITION_X_VALID, wire.position_x_valid);
        flags.set(StatusFlags::POSITION_Y_VALID, wire.position_y_valid);
        flags.set(StatusFlags::POSITION_Z_VALID, wire.position_z_valid);
        flags.set(StatusFlags::VELOCITY_X_VALID, wire.velocity_x_valid);
        flags.set(StatusFlags::VELOCITY_Y_VALID, wire.velocity_y_valid);
        flags.set(StatusFlags::VELOCITY_Z_VALID, wire.velocity_z_valid);
        flags.set(StatusFlags::ACCELERATION_X_VALID, wire.acceleration_x_valid);
        flags.set(StatusFlags::ACCELERATION_Y_VALID, wire.acceleration_y_valid);
        flags.set(StatusFlags::ACCELERATION_Z_VALID, wire.acceleration_z_valid);
        flags
    }
}

mod status_flags_serde {
    use super::{StatusFlags, StatusFlagsWire};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(flags: &StatusFlags, serializer: S) -> Result<S::Ok, S::Error> {
        StatusFlagsWire::from(*flags).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatusFlags, D::Error> {
        StatusFlagsWire::deserialize(deserializer).map(StatusFlags::from)
    }
}

/// Scale applied to every geocentric/spherical integer field before it
/// becomes a float, except azimuth/elevation which use their own scale.
const LINEAR_SCALE: f64 = 100.0;
const ANGLE_SCALE: f64 = 1_000_000.0;
const TIME_TICKS_PER_SECOND: f64 = 10_000.0;

/// Three linear triples sharing one physical meaning (position, velocity or
/// acceleration), always present regardless of the datagram's kind.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Geocentric {
        position: Triple,
        velocity: Triple,
        acceleration: Triple,
    },
    Spherical {
        range_m: f64,
        azimuth_deg: f64,
        elevation_deg: f64,
        range_rate: f64,
        azimuth_rate: f64,
        elevation_rate: f64,
        range_accel: f64,
        azimuth_accel: f64,
        elevation_accel: f64,
    },
}

/// One canonical telemetry observation, decoded from a wire datagram and
/// stamped with receipt metadata. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TspiRecord {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sensor_id: SensorId,
    pub day: DayOfYear,
    pub time_ticks: TimeTicks,
    pub time_s: f64,
    pub status: u8,
    #[serde(with = "status_flags_serde")]
    pub status_flags: StatusFlags,
    pub payload: Payload,
    pub recv_epoch_ms: i64,
    pub recv_iso: DateTime<Utc>,
}

impl TspiRecord {
    /// The `(sensor_id, day, time_ticks)` deduplication key, stable across
    /// encode/decode round-trips and independent of status/flag changes.
    pub fn dedup_id(&self) -> String {
        format!("{}:{}:{}", self.sensor_id, self.day, self.time_ticks)
    }

    /// Subject this record should be published on: `{prefix}.{kind}.{sensor_id}`.
    pub fn subject(&self, prefix: &str) -> String {
        format!(
            "{}.{}.{}",
            prefix,
            self.kind.subject_token(),
            self.sensor_id
        )
    }
}

/// Decodes a raw 37-byte datagram, stamping it with the given receipt time.
pub fn decode_tspi_datagram(bytes: &[u8], recv_time: DateTime<Utc>) -> Result<TspiRecord, ParseError> {
    if bytes.len() != DATAGRAM_LENGTH {
        return Err(ParseError::WrongLength {
            expected: DATAGRAM_LENGTH,
            actual: bytes.len(),
        });
    }

    let mut header = &bytes[..HEADER_LENGTH];
    let type_byte = header.get_u8();
    let version = header.get_u8();
    if version != SUPPORTED_VERSION {
        return Err(ParseError::UnsupportedVersion(version));
    }
    let kind = MessageType::from_byte(type_byte)?;

    let sensor_id = header.get_u16();
    let day = header.get_u16();
    let time_ticks = header.get_u32();
    let status = header.get_u8();
    let status_flags_msb = header.get_u16();
    let status_flags = StatusFlags::from_header_fields(status, status_flags_msb);

    let mut payload_bytes = &bytes[HEADER_LENGTH..HEADER_LENGTH + PAYLOAD_LENGTH];
    let payload = match kind {
        MessageType::Geocentric => {
            let x = payload_bytes.get_i32() as f64 / LINEAR_SCALE;
            let y = payload_bytes.get_i32() as f64 / LINEAR_SCALE;
            let z = payload_bytes.get_i32() as f64 / LINEAR_SCALE;
            let vx = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let vy = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let vz = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let ax = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let ay = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let az = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            Payload::Geocentric {
                position: Triple { x, y, z },
                velocity: Triple { x: vx, y: vy, z: vz },
                acceleration: Triple { x: ax, y: ay, z: az },
            }
        }
        MessageType::Spherical => {
            let range_m = payload_bytes.get_i32() as f64 / LINEAR_SCALE;
            let azimuth_deg = payload_bytes.get_u32() as f64 / ANGLE_SCALE;
            let elevation_deg = payload_bytes.get_u32() as f64 / ANGLE_SCALE;
            let range_rate = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let azimuth_rate = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let elevation_rate = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let range_accel = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let azimuth_accel = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            let elevation_accel = payload_bytes.get_i16() as f64 / LINEAR_SCALE;
            Payload::Spherical {
                range_m,
                azimuth_deg,
                elevation_deg,
                range_rate,
                azimuth_rate,
                elevation_rate,
                range_accel,
                azimuth_accel,
                elevation_accel,
            }
        }
    };

    let time_s = time_ticks as f64 / TIME_TICKS_PER_SECOND;

    Ok(TspiRecord {
        kind,
        sensor_id,
        day,
        time_ticks,
        time_s,
        status,
        status_flags,
        payload,
        recv_epoch_ms: recv_time.timestamp_millis(),
        recv_iso: recv_time,
    })
}

/// Re-encodes a record back into its 37-byte wire form. Round-trips
/// bit-for-bit with [`decode_tspi_datagram`] for any record it produced.
pub fn encode_tspi_datagram(record: &TspiRecord) -> Bytes {
    let mut dst = BytesMut::with_capacity(DATAGRAM_LENGTH);
    dst.put_u8(record.kind.to_byte());
    dst.put_u8(SUPPORTED_VERSION);
    dst.put_u16(record.sensor_id);
    dst.put_u16(record.day);
    dst.put_u32(record.time_ticks);
    dst.put_u8(record.status);
    dst.put_u16((record.status_flags.bits() >> 8) as u16);

    match &record.payload {
        Payload::Geocentric {
            position,
            velocity,
            acceleration,
        } => {
            dst.put_i32((position.x * LINEAR_SCALE).round() as i32);
            dst.put_i32((position.y * LINEAR_SCALE).round() as i32);
            dst.put_i32((position.z * LINEAR_SCALE).round() as i32);
            dst.put_i16((velocity.x * LINEAR_SCALE).round() as i16);
            dst.put_i16((velocity.y * LINEAR_SCALE).round() as i16);
            dst.put_i16((velocity.z * LINEAR_SCALE).round() as i16);
            dst.put_i16((acceleration.x * LINEAR_SCALE).round() as i16);
            dst.put_i16((acceleration.y * LINEAR_SCALE).round() as i16);
            dst.put_i16((acceleration.z * LINEAR_SCALE).round() as i16);
        }
        Payload::Spherical {
            range_m,
            azimuth_deg,
            elevation_deg,
            range_rate,
            azimuth_rate,
            elevation_rate,
            range_accel,
            azimuth_accel,
            elevation_accel,
        } => {
            dst.put_i32((range_m * LINEAR_SCALE).round() as i32);
            dst.put_u32((azimuth_deg * ANGLE_SCALE).round() as u32);
            dst.put_u32((elevation_deg * ANGLE_SCALE).round() as u32);
            dst.put_i16((range_rate * LINEAR_SCALE).round() as i16);
            dst.put_i16((azimuth_rate * LINEAR_SCALE).round() as i16);
            dst.put_i16((elevation_rate * LINEAR_SCALE).round() as i16);
            dst.put_i16((range_accel * LINEAR_SCALE).round() as i16);
            dst.put_i16((azimuth_accel * LINEAR_SCALE).round() as i16);
            dst.put_i16((elevation_accel * LINEAR_SCALE).round() as i16);
        }
    }

    dst.freeze()
}

/// Tokio codec for framing a stream of back-to-back fixed-width datagrams,
/// e.g. reading straight off a UDP or TCP ingest socket.
pub struct DatagramCodec {
    recv_time_fn: fn() -> DateTime<Utc>,
}

impl Default for DatagramCodec {
    fn default() -> Self {
        Self {
            recv_time_fn: Utc::now,
        }
    }
}

impl Decoder for DatagramCodec {
    type Item = TspiRecord;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < DATAGRAM_LENGTH {
            return Ok(None);
        }
        let frame = src.split_to(DATAGRAM_LENGTH);
        let recv_time = (self.recv_time_fn)();
        decode_tspi_datagram(&frame, recv_time)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl Encoder<TspiRecord> for DatagramCodec {
    type Error = io::Error;

    fn encode(&mut self, item: TspiRecord, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&encode_tspi_datagram(&item));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_geocentric_bytes() -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(0xC1);
        buf.put_u8(SUPPORTED_VERSION);
        buf.put_u16(501);
        buf.put_u16(123);
        buf.put_u32(15340);
        buf.put_u8(0xFF);
        buf.put_u16(0x0001);
        buf.put_i32(512_325);
        buf.put_i32(-1_550);
        buf.put_i32(120_000);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.to_vec()
    }

    #[test]
    fn s1_geocentric_parse() {
        let recv_time = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let record = decode_tspi_datagram(&sample_geocentric_bytes(), recv_time).unwrap();

        assert_eq!(record.kind, MessageType::Geocentric);
        assert_eq!(record.sensor_id, 501);
        assert_eq!(record.day, 123);
        assert!((record.time_s - 1.534).abs() < 1e-9);
        assert_eq!(record.status, 0xFF);
        assert_eq!(record.dedup_id(), "501:123:15340");
        assert_eq!(record.subject("tspi"), "tspi.geocentric.501");

        match record.payload {
            Payload::Geocentric { position, .. } => {
                assert!((position.x - 5123.25).abs() < 1e-9);
                assert!((position.y - (-15.5)).abs() < 1e-9);
                assert!((position.z - 1200.0).abs() < 1e-9);
            }
            _ => panic!("expected geocentric payload"),
        }
    }

    #[test]
    fn s2_spherical_parse() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xC2);
        buf.put_u8(SUPPORTED_VERSION);
        buf.put_u16(2048);
        buf.put_u16(42);
        buf.put_u32(923_400);
        buf.put_u8(0x00);
        buf.put_u16(0x0000);
        buf.put_i32(380_000);
        buf.put_u32(52_123_456);
        buf.put_u32(10_654_321);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(0);

        let recv_time = Utc::now();
        let record = decode_tspi_datagram(&buf, recv_time).unwrap();

        assert_eq!(record.kind, MessageType::Spherical);
        assert_eq!(record.dedup_id(), "2048:42:923400");
        assert_eq!(record.subject("tspi"), "tspi.spherical.2048");

        match record.payload {
            Payload::Spherical {
                range_m,
                azimuth_deg,
                elevation_deg,
                ..
            } => {
                assert!((range_m - 3800.0).abs() < 1e-6);
                assert!((azimuth_deg - 52.123456).abs() < 1e-6);
                assert!((elevation_deg - 10.654321).abs() < 1e-6);
            }
            _ => panic!("expected spherical payload"),
        }
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let recv_time = Utc::now();
        let original = sample_geocentric_bytes();
        let record = decode_tspi_datagram(&original, recv_time).unwrap();
        let encoded = encode_tspi_datagram(&record);
        assert_eq!(original, encoded.to_vec());
    }

    #[test]
    fn dedup_id_stable_under_status_change() {
        let recv_time = Utc::now();
        let mut record = decode_tspi_datagram(&sample_geocentric_bytes(), recv_time).unwrap();
        let dedup_before = record.dedup_id();
        record.status = 0x00;
        record.status_flags = StatusFlags::from_header_fields(0x00, 0x0000);
        assert_eq!(dedup_before, record.dedup_id());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = decode_tspi_datagram(&[0u8; 10], Utc::now()).unwrap_err();
        assert_eq!(
            err,
            ParseError::WrongLength {
                expected: DATAGRAM_LENGTH,
                actual: 10
            }
        );
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let mut bytes = sample_geocentric_bytes();
        bytes[0] = 0x00;
        let err = decode_tspi_datagram(&bytes, Utc::now()).unwrap_err();
        assert_eq!(err, ParseError::UnsupportedType(0x00));
    }
}
