//! JSON Schema (draft 2020-12) validation of the telemetry envelope. Commands
//! and tags never go through this path — their subjects don't carry the
//! telemetry envelope shape, so the player engine inserts them into the
//! timeline unconditionally (§4.8).

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("telemetry payload failed schema validation: {0}")]
    Violation(String),
}

fn triple_schema() -> Value {
    json!({
        "type": "object",
        "required": ["x", "y", "z"],
        "properties": {
            "x": { "type": "number" },
            "y": { "type": "number" },
            "z": { "type": "number" }
        }
    })
}

fn telemetry_envelope_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["type", "sensor_id", "day", "time_s", "status", "status_flags", "recv_epoch_ms", "recv_iso", "payload"],
        "properties": {
            "type": { "enum": ["geocentric", "spherical"] },
            "sensor_id": { "type": "integer", "minimum": 0 },
            "day": { "type": "integer", "minimum": 0 },
            "time_s": { "type": "number", "minimum": 0 },
            "status": { "type": "integer", "minimum": 0, "maximum": 255 },
            "status_flags": {
                "type": "object",
                "required": [
                    "position_x_valid", "position_y_valid", "position_z_valid",
                    "velocity_x_valid", "velocity_y_valid", "velocity_z_valid",
                    "acceleration_x_valid", "acceleration_y_valid", "acceleration_z_valid"
                ],
                "properties": {
                    "position_x_valid": { "type": "boolean" },
                    "position_y_valid": { "type": "boolean" },
                    "position_z_valid": { "type": "boolean" },
                    "velocity_x_valid": { "type": "boolean" },
                    "velocity_y_valid": { "type": "boolean" },
                    "velocity_z_valid": { "type": "boolean" },
                    "acceleration_x_valid": { "type": "boolean" },
                    "acceleration_y_valid": { "type": "boolean" },
                    "acceleration_z_valid": { "type": "boolean" }
                }
            },
            "recv_epoch_ms": { "type": "integer" },
            "recv_iso": { "type": "string" },
            "payload": {
                "oneOf": [
                    {
                        "type": "object",
                        "required": ["kind", "position", "velocity", "acceleration"],
                        "properties": {
                            "kind": { "const": "geocentric" },
                            "position": triple_schema(),
                            "velocity": triple_schema(),
                            "acceleration": triple_schema()
                        }
                    },
                    {
                        "type": "object",
                        "required": [
                            "kind", "range_m", "azimuth_deg", "elevation_deg",
                            "range_rate", "azimuth_rate", "elevation_rate",
                            "range_accel", "azimuth_accel", "elevation_accel"
                        ],
                        "properties": {
                            "kind": { "const": "spherical" },
                            "range_m": { "type": "number" },
                            "azimuth_deg": { "type": "number" },
                            "elevation_deg": { "type": "number" },
                            "range_rate": { "type": "number" },
                            "azimuth_rate": { "type": "number" },
                            "elevation_rate": { "type": "number" },
                            "range_accel": { "type": "number" },
                            "azimuth_accel": { "type": "number" },
                            "elevation_accel": { "type": "number" }
                        }
                    }
                ]
            }
        }
    })
}

static TELEMETRY_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::compile(&telemetry_envelope_schema()).expect("telemetry envelope schema is valid JSON Schema")
});

/// Validates a decoded telemetry envelope (typically the result of
/// `serde_json::to_value(&TspiRecord)`) against the draft 2020-12 schema.
pub fn validate_telemetry(instance: &Value) -> Result<(), SchemaError> {
    TELEMETRY_SCHEMA.validate(instance).map_err(|errors| {
        let message = errors.map(|err| err.to_string()).collect::<Vec<_>>().join("; ");
        SchemaError::Violation(message)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_tspi_datagram, TspiRecord};
    use chrono::Utc;

    fn sample_record() -> TspiRecord {
        use bytes::{BufMut, BytesMut};
        let mut buf = BytesMut::new();
        buf.put_u8(0xC1);
        buf.put_u8(4);
        buf.put_u16(501);
        buf.put_u16(123);
        buf.put_u32(15340);
        buf.put_u8(0xFF);
        buf.put_u16(0x0001);
        buf.put_i32(512_325);
        buf.put_i32(-1_550);
        buf.put_i32(120_000);
        for _ in 0..6 {
            buf.put_i16(0);
        }
        decode_tspi_datagram(&buf, Utc::now()).unwrap()
    }

    #[test]
    fn valid_telemetry_envelope_passes() {
        let record = sample_record();
        let value = serde_json::to_value(&record).unwrap();
        assert!(validate_telemetry(&value).is_ok());
    }

    #[test]
    fn missing_field_fails_validation() {
        let record = sample_record();
        let mut value = serde_json::to_value(&record).unwrap();
        value.as_object_mut().unwrap().remove("sensor_id");
        assert!(validate_telemetry(&value).is_err());
    }
}
