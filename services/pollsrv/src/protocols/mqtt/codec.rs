//! MQTT payload codec

use serde_json::{json, Value};

use crate::core::codec::invert_scale;
use crate::core::entity::{MqttDataType, MqttPoint};
use crate::core::types::{parse_bool_token, ProtocolValue, RawValue};
use crate::error::{PollSrvError, Result};

/// Payload as text; binary payloads become lowercase hex
pub fn payload_text(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => hex::encode(payload),
    }
}

/// JSON-decode opportunistically, falling back to the raw text
fn parse_payload(payload: &[u8]) -> Value {
    let text = payload_text(payload);
    serde_json::from_str(text.trim()).unwrap_or(Value::String(text))
}

/// `{"value": x}` yields `x`, `[x, ...]` yields `x`
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("value") => {
            map.remove("value").unwrap_or(Value::Null)
        },
        Value::Array(items) if !items.is_empty() => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    }
}

/// Decode a received message (scale is applied by the caller)
pub fn decode(raw: &RawValue, point: &MqttPoint) -> Result<ProtocolValue> {
    let RawValue::Message(msg) = raw else {
        return Err(PollSrvError::codec(format!(
            "unexpected raw value for mqtt: {:?}",
            raw
        )));
    };
    let parsed = parse_payload(&msg.payload);

    if point.data_type == MqttDataType::Json {
        return Ok(match parsed {
            Value::String(text) => ProtocolValue::String(text),
            other => ProtocolValue::Json(other),
        });
    }

    let value = unwrap_envelope(parsed);
    match point.data_type {
        MqttDataType::String => Ok(ProtocolValue::String(match value {
            Value::String(s) => s.trim_end_matches('\0').to_string(),
            other => other.to_string(),
        })),
        MqttDataType::Integer => number(&value)
            .map(|f| ProtocolValue::Integer(f.trunc() as i64))
            .ok_or_else(|| not_a(&value, "integer")),
        MqttDataType::Float => number(&value)
            .map(ProtocolValue::Float)
            .ok_or_else(|| not_a(&value, "float")),
        MqttDataType::Boolean => boolean(&value)
            .map(ProtocolValue::Bool)
            .ok_or_else(|| not_a(&value, "boolean")),
        MqttDataType::Json => Ok(ProtocolValue::Json(value)),
    }
}

fn not_a(value: &Value, kind: &str) -> PollSrvError {
    PollSrvError::codec(format!("payload {} is not a valid {}", value, kind))
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .or_else(|| parse_bool_token(s).map(|b| if b { 1.0 } else { 0.0 }))
        },
        _ => None,
    }
}

fn boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => parse_bool_token(s),
        _ => None,
    }
}

/// Encode a publish payload. JSON values go out as JSON, scalars as text.
pub fn encode(value: &ProtocolValue, point: &MqttPoint, scale: f64, offset: f64) -> Result<RawValue> {
    let text = match (point.data_type, value) {
        (_, ProtocolValue::Json(v)) => serde_json::to_string(v)?,
        (MqttDataType::Integer, v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| PollSrvError::codec(format!("'{}' is not numeric", v)))?;
            let x = invert_scale(n, scale, offset).round();
            if !x.is_finite() {
                return Err(PollSrvError::codec(format!("cannot publish {x}")));
            }
            (x as i64).to_string()
        },
        (MqttDataType::Float, v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| PollSrvError::codec(format!("'{}' is not numeric", v)))?;
            let x = invert_scale(n, scale, offset);
            if !x.is_finite() {
                return Err(PollSrvError::codec(format!("cannot publish {x}")));
            }
            ProtocolValue::Float(x).to_string()
        },
        (MqttDataType::Boolean, v) => {
            let b = v
                .as_bool()
                .ok_or_else(|| PollSrvError::codec(format!("'{}' is not a boolean", v)))?;
            b.to_string()
        },
        (_, v) => v.to_string(),
    };
    Ok(RawValue::Payload(text.into_bytes()))
}

/// Undecoded view for diagnostics
pub fn raw_report(raw: &RawValue, point: &MqttPoint) -> Value {
    match raw {
        RawValue::Message(msg) => json!({
            "payload": payload_text(&msg.payload),
            "topic": msg.topic,
            "retained": msg.retained,
            "qos": msg.qos,
            "age_secs": msg.received_at.elapsed().as_secs_f64(),
        }),
        RawValue::Payload(bytes) => json!({
            "payload": payload_text(bytes),
            "topic": point.topic,
        }),
        other => json!({
            "value": format!("{:?}", other),
            "topic": point.topic,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::entity::DEFAULT_MQTT_WAIT;
    use crate::core::types::BrokerMessage;
    use std::time::Instant;

    fn point(data_type: MqttDataType) -> MqttPoint {
        MqttPoint {
            topic: "plant/boiler/temp".into(),
            data_type,
            qos: 0,
            retain: false,
            wait: DEFAULT_MQTT_WAIT,
        }
    }

    fn msg(payload: &[u8]) -> RawValue {
        RawValue::Message(BrokerMessage {
            topic: "plant/boiler/temp".into(),
            payload: payload.to_vec(),
            qos: 1,
            retained: true,
            received_at: Instant::now(),
        })
    }

    #[test]
    fn test_plain_and_enveloped_numbers() {
        let p = point(MqttDataType::Float);
        assert_eq!(decode(&msg(b"21.5"), &p).unwrap(), ProtocolValue::Float(21.5));
        assert_eq!(
            decode(&msg(br#"{"value": 19.25, "unit": "C"}"#), &p).unwrap(),
            ProtocolValue::Float(19.25)
        );
        assert_eq!(decode(&msg(b"[3, 4]"), &p).unwrap(), ProtocolValue::Float(3.0));
        assert!(decode(&msg(b"warm"), &p).is_err());
    }

    #[test]
    fn test_integer_truncates() {
        let p = point(MqttDataType::Integer);
        assert_eq!(decode(&msg(b"7.9"), &p).unwrap(), ProtocolValue::Integer(7));
        assert_eq!(decode(&msg(b"\"-3.2\""), &p).unwrap(), ProtocolValue::Integer(-3));
        assert_eq!(decode(&msg(b"on"), &p).unwrap(), ProtocolValue::Integer(1));
    }

    #[test]
    fn test_boolean_tokens() {
        let p = point(MqttDataType::Boolean);
        assert_eq!(decode(&msg(b"ON"), &p).unwrap(), ProtocolValue::Bool(true));
        assert_eq!(decode(&msg(b"no"), &p).unwrap(), ProtocolValue::Bool(false));
        assert_eq!(decode(&msg(b"true"), &p).unwrap(), ProtocolValue::Bool(true));
        assert_eq!(decode(&msg(b"0"), &p).unwrap(), ProtocolValue::Bool(false));
        assert!(decode(&msg(b"maybe"), &p).is_err());
    }

    #[test]
    fn test_json_type_keeps_structure() {
        let p = point(MqttDataType::Json);
        assert_eq!(
            decode(&msg(br#"{"value": 1, "unit": "C"}"#), &p).unwrap(),
            ProtocolValue::Json(json!({"value": 1, "unit": "C"}))
        );
        assert_eq!(decode(&msg(b"not json"), &p).unwrap(), ProtocolValue::from("not json"));
    }

    #[test]
    fn test_string_and_binary_payloads() {
        let p = point(MqttDataType::String);
        assert_eq!(decode(&msg(b"\"idle\""), &p).unwrap(), ProtocolValue::from("idle"));
        assert_eq!(decode(&msg(&[0xFF, 0x01]), &p).unwrap(), ProtocolValue::from("ff01"));
        assert_eq!(decode(&msg(b"{\"a\":1}"), &p).unwrap(), ProtocolValue::from("{\"a\":1}"));
    }

    #[test]
    fn test_encode_payloads() {
        let text = |raw: RawValue| match raw {
            RawValue::Payload(b) => String::from_utf8(b).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        let int = point(MqttDataType::Integer);
        assert_eq!(text(encode(&ProtocolValue::Float(21.0), &int, 2.0, 1.0).unwrap()), "10");

        let b = point(MqttDataType::Boolean);
        assert_eq!(text(encode(&ProtocolValue::from("on"), &b, 1.0, 0.0).unwrap()), "true");

        let j = point(MqttDataType::Json);
        assert_eq!(
            text(encode(&ProtocolValue::Json(json!({"mode": "eco"})), &j, 1.0, 0.0).unwrap()),
            r#"{"mode":"eco"}"#
        );

        let f = point(MqttDataType::Float);
        assert_eq!(text(encode(&ProtocolValue::Float(2.5), &f, 1.0, 0.0).unwrap()), "2.5");
        assert!(encode(&ProtocolValue::from("x"), &f, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_raw_report() {
        let report = raw_report(&msg(b"42"), &point(MqttDataType::Integer));
        assert_eq!(report["payload"], "42");
        assert_eq!(report["retained"], true);
        assert!(report["age_secs"].as_f64().unwrap() < 5.0);
    }
}
