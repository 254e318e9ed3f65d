//! Value codec dispatch and shared numeric helpers
//!
//! Protocol codecs live next to their transports; this module picks one by
//! matching on the validated [`EntityTarget`] and owns the linear transform
//! every numeric decode shares.

use crate::core::entity::{EntityConfig, EntityTarget, RegisterKind};
use crate::core::types::{ProtocolValue, RawValue};
use crate::error::Result;
use crate::protocols::{modbus, mqtt, snmp};

/// Decimal digits kept on float results
pub const FLOAT_PRECISION: i32 = 6;

/// Round to [`FLOAT_PRECISION`] decimal digits
pub fn round_float(v: f64) -> f64 {
    let factor = 10f64.powi(FLOAT_PRECISION);
    let rounded = (v * factor).round() / factor;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Effective scale; zero means "no scaling"
fn effective_scale(scale: f64) -> f64 {
    if scale == 0.0 {
        1.0
    } else {
        scale
    }
}

/// Apply `value * scale + offset` to numeric values.
///
/// Integers stay integers under the identity transform; anything else
/// becomes a rounded float. Non-numeric values pass through.
pub fn apply_scale(value: ProtocolValue, scale: f64, offset: f64) -> ProtocolValue {
    let scale = effective_scale(scale);
    match value {
        ProtocolValue::Integer(i) if scale == 1.0 && offset == 0.0 => ProtocolValue::Integer(i),
        ProtocolValue::Integer(i) => ProtocolValue::Float(round_float(i as f64 * scale + offset)),
        ProtocolValue::Float(f) => ProtocolValue::Float(round_float(f * scale + offset)),
        other => other,
    }
}

/// Inverse transform `(value - offset) / scale`
pub fn invert_scale(value: f64, scale: f64, offset: f64) -> f64 {
    (value - offset) / effective_scale(scale)
}

/// Decode a raw wire value for `entity`
pub fn decode(raw: &RawValue, entity: &EntityConfig) -> Result<ProtocolValue> {
    let value = match &entity.target {
        EntityTarget::Modbus(point) => modbus::codec::decode(raw, point)?,
        EntityTarget::Snmp(point) => snmp::codec::decode(raw, point, entity.scale, entity.offset)?,
        EntityTarget::Mqtt(point) => mqtt::codec::decode(raw, point)?,
    };
    Ok(match &entity.target {
        // Table rows are scaled per row inside the SNMP codec
        EntityTarget::Snmp(_) => value,
        _ => apply_scale(value, entity.scale, entity.offset),
    })
}

/// Encode `value` for a write to `entity`.
///
/// `kind` is the resolved Modbus register kind and is ignored elsewhere.
pub fn encode(
    value: &ProtocolValue,
    entity: &EntityConfig,
    kind: Option<RegisterKind>,
) -> Result<RawValue> {
    match &entity.target {
        EntityTarget::Modbus(point) => modbus::codec::encode(
            value,
            point,
            kind.unwrap_or(RegisterKind::Holding),
            entity.scale,
            entity.offset,
        ),
        EntityTarget::Snmp(point) => snmp::codec::encode(value, point, entity.scale, entity.offset),
        EntityTarget::Mqtt(point) => mqtt::codec::encode(value, point, entity.scale, entity.offset),
    }
}

/// Diagnostic view of an undecoded value
pub fn raw_report(
    raw: &RawValue,
    entity: &EntityConfig,
    kind: Option<RegisterKind>,
) -> serde_json::Value {
    match &entity.target {
        EntityTarget::Modbus(point) => modbus::codec::raw_report(raw, point, kind),
        EntityTarget::Snmp(point) => snmp::codec::raw_report(raw, point),
        EntityTarget::Mqtt(point) => mqtt::codec::raw_report(raw, point),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_scale_and_offset() {
        assert_eq!(
            apply_scale(ProtocolValue::Integer(10), 2.0, 1.0),
            ProtocolValue::Float(21.0)
        );
        assert_eq!(invert_scale(21.0, 2.0, 1.0), 10.0);
    }

    #[test]
    fn test_identity_keeps_integers() {
        assert_eq!(
            apply_scale(ProtocolValue::Integer(-5), 1.0, 0.0),
            ProtocolValue::Integer(-5)
        );
    }

    #[test]
    fn test_zero_scale_is_no_scaling() {
        assert_eq!(
            apply_scale(ProtocolValue::Integer(7), 0.0, 0.0),
            ProtocolValue::Integer(7)
        );
        assert_eq!(invert_scale(7.0, 0.0, 0.0), 7.0);
    }

    #[test]
    fn test_float_noise_is_rounded() {
        assert_eq!(
            apply_scale(ProtocolValue::Integer(3), 0.1, 0.0),
            ProtocolValue::Float(0.3)
        );
        assert_eq!(round_float(1.000_000_4), 1.0);
        assert_eq!(round_float(-0.000_000_1), 0.0);
    }

    #[test]
    fn test_non_numeric_passthrough() {
        assert_eq!(
            apply_scale(ProtocolValue::from("OK"), 2.0, 1.0),
            ProtocolValue::from("OK")
        );
        assert_eq!(
            apply_scale(ProtocolValue::Bool(true), 2.0, 1.0),
            ProtocolValue::Bool(true)
        );
    }
}
