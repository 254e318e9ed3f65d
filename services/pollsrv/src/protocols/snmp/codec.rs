//! SNMP value codec
//!
//! Works on the [`TypedScalar`] produced by the client, never on wire types.
//! Scaling happens here so that walk tables are scaled row by row.

use serde_json::json;

use crate::core::codec::{apply_scale, invert_scale};
use crate::core::entity::{SnmpDataType, SnmpPoint};
use crate::core::types::{ProtocolValue, RawValue, Scalar, TypedScalar};
use crate::error::{PollSrvError, Result};

/// Decode a GET scalar or a walk table, scaling numeric results
pub fn decode(raw: &RawValue, point: &SnmpPoint, scale: f64, offset: f64) -> Result<ProtocolValue> {
    match raw {
        RawValue::Scalar(typed) => decode_scalar(typed, point.data_type, scale, offset),
        RawValue::Table(rows) => {
            let mut out = Vec::with_capacity(rows.len());
            for (oid, typed) in rows {
                let value = decode_scalar(typed, point.data_type, scale, offset)
                    .map_err(|e| PollSrvError::codec(format!("row {oid}: {e}")))?;
                out.push(json!({ "oid": oid, "value": serde_json::to_value(&value)? }));
            }
            Ok(ProtocolValue::Json(serde_json::Value::Array(out)))
        },
        other => Err(PollSrvError::codec(format!(
            "unexpected raw value for snmp: {:?}",
            other
        ))),
    }
}

fn decode_scalar(
    typed: &TypedScalar,
    data_type: SnmpDataType,
    scale: f64,
    offset: f64,
) -> Result<ProtocolValue> {
    if !data_type.is_numeric() {
        let text = match &typed.value {
            Scalar::Text(s) => s.trim_end_matches('\0').to_string(),
            other => other.to_string(),
        };
        return Ok(ProtocolValue::String(text));
    }

    let number = match &typed.value {
        Scalar::Integer(i) => ProtocolValue::Integer(*i),
        Scalar::Float(f) => ProtocolValue::Float(*f),
        Scalar::Text(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                ProtocolValue::Integer(i)
            } else if let Ok(f) = s.parse::<f64>() {
                ProtocolValue::Float(f)
            } else {
                return Err(PollSrvError::codec(format!(
                    "{} value '{}' is not numeric",
                    typed.syntax, s
                )));
            }
        },
    };
    Ok(apply_scale(number, scale, offset))
}

/// Encode a SET value as a typed scalar
pub fn encode(value: &ProtocolValue, point: &SnmpPoint, scale: f64, offset: f64) -> Result<RawValue> {
    if point.walk {
        return Err(PollSrvError::ReadOnlyTarget(point.oid.clone()));
    }
    let syntax = match point.data_type {
        SnmpDataType::String => {
            return Ok(RawValue::Scalar(TypedScalar::new(
                "OctetString",
                Scalar::Text(value.to_string()),
            )))
        },
        SnmpDataType::Integer => "Integer",
        SnmpDataType::Counter32 => "Counter32",
        SnmpDataType::Counter64 => "Counter64",
        SnmpDataType::Gauge32 => "Gauge32",
        SnmpDataType::Timeticks => "TimeTicks",
    };
    let number = value
        .as_f64()
        .ok_or_else(|| PollSrvError::codec(format!("'{}' is not numeric", value)))?;
    let x = invert_scale(number, scale, offset).round();
    if !x.is_finite() || x < i64::MIN as f64 || x > i64::MAX as f64 {
        return Err(PollSrvError::codec(format!("{x} cannot be encoded as {syntax}")));
    }
    Ok(RawValue::Scalar(TypedScalar::new(syntax, Scalar::Integer(x as i64))))
}

/// Undecoded view for diagnostics
pub fn raw_report(raw: &RawValue, point: &SnmpPoint) -> serde_json::Value {
    match raw {
        RawValue::Scalar(typed) => json!({
            "value": typed.value,
            "type": typed.syntax,
            "oid": point.oid,
        }),
        RawValue::Table(rows) => json!({
            "rows": rows
                .iter()
                .map(|(oid, t)| json!({ "oid": oid, "value": t.value, "type": t.syntax }))
                .collect::<Vec<_>>(),
            "oid": point.oid,
            "size": rows.len(),
        }),
        other => json!({
            "value": format!("{:?}", other),
            "oid": point.oid,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn point(data_type: SnmpDataType, walk: bool) -> SnmpPoint {
        SnmpPoint {
            oid: "1.3.6.1.2.1.1.3.0".into(),
            data_type,
            walk,
        }
    }

    fn scalar(syntax: &str, value: Scalar) -> RawValue {
        RawValue::Scalar(TypedScalar::new(syntax, value))
    }

    #[test]
    fn test_numeric_normalization() {
        let p = point(SnmpDataType::Timeticks, false);
        assert_eq!(
            decode(&scalar("TimeTicks", Scalar::Integer(4200)), &p, 0.01, 0.0).unwrap(),
            ProtocolValue::Float(42.0)
        );
        assert_eq!(
            decode(&scalar("OctetString", Scalar::Text(" 17 ".into())), &p, 1.0, 0.0).unwrap(),
            ProtocolValue::Integer(17)
        );
        assert!(decode(&scalar("OctetString", Scalar::Text("n/a".into())), &p, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_string_passthrough() {
        let p = point(SnmpDataType::String, false);
        assert_eq!(
            decode(&scalar("OctetString", Scalar::Text("OK\0\0".into())), &p, 2.0, 1.0).unwrap(),
            ProtocolValue::from("OK")
        );
        assert_eq!(
            decode(&scalar("Integer", Scalar::Integer(3)), &p, 2.0, 1.0).unwrap(),
            ProtocolValue::from("3")
        );
    }

    #[test]
    fn test_table_rows_are_scaled() {
        let p = point(SnmpDataType::Counter32, true);
        let raw = RawValue::Table(vec![
            ("1.3.6.1.2.1.2.2.1.10.1".into(), TypedScalar::new("Counter32", Scalar::Integer(10))),
            ("1.3.6.1.2.1.2.2.1.10.2".into(), TypedScalar::new("Counter32", Scalar::Integer(20))),
        ]);
        let value = decode(&raw, &p, 2.0, 0.0).unwrap();
        assert_eq!(
            value,
            ProtocolValue::Json(json!([
                {"oid": "1.3.6.1.2.1.2.2.1.10.1", "value": 20.0},
                {"oid": "1.3.6.1.2.1.2.2.1.10.2", "value": 40.0},
            ]))
        );
    }

    #[test]
    fn test_encode() {
        let p = point(SnmpDataType::Gauge32, false);
        assert_eq!(
            encode(&ProtocolValue::Float(21.0), &p, 2.0, 1.0).unwrap(),
            scalar("Gauge32", Scalar::Integer(10))
        );
        let s = point(SnmpDataType::String, false);
        assert_eq!(
            encode(&ProtocolValue::from("ups-1"), &s, 1.0, 0.0).unwrap(),
            scalar("OctetString", Scalar::Text("ups-1".into()))
        );
        assert!(encode(&ProtocolValue::from("x"), &p, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_walk_target_is_read_only() {
        let p = point(SnmpDataType::Integer, true);
        let err = encode(&ProtocolValue::Integer(1), &p, 1.0, 0.0).unwrap_err();
        assert!(matches!(err, PollSrvError::ReadOnlyTarget(_)));
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_raw_report() {
        let p = point(SnmpDataType::Integer, false);
        let report = raw_report(&scalar("Integer", Scalar::Integer(5)), &p);
        assert_eq!(report, json!({"value": 5, "type": "Integer", "oid": "1.3.6.1.2.1.1.3.0"}));
    }
}
