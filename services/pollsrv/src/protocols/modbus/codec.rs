//! Modbus register codec
//!
//! Words are combined most-significant first unless `word_order` is little,
//! in which case the word sequence is reversed before composing. `byte_order`
//! is carried on the point but does not swap bytes within a register.

use serde_json::json;
use tracing::trace;

use crate::core::codec::invert_scale;
use crate::core::entity::{ModbusDataType, ModbusPoint, Order, RegisterKind};
use crate::core::types::{ProtocolValue, RawValue};
use crate::error::{PollSrvError, Result};

/// Decode registers or bits for `point` (scale is applied by the caller)
pub fn decode(raw: &RawValue, point: &ModbusPoint) -> Result<ProtocolValue> {
    match raw {
        RawValue::Bits(bits) => decode_bits(bits),
        RawValue::Registers(words) => decode_registers(words, point),
        other => Err(PollSrvError::codec(format!(
            "unexpected raw value for modbus: {:?}",
            other
        ))),
    }
}

fn decode_bits(bits: &[bool]) -> Result<ProtocolValue> {
    match bits {
        [] => Err(PollSrvError::codec("empty bit response")),
        [single] => Ok(ProtocolValue::Bool(*single)),
        many if many.len() > 63 => Err(PollSrvError::codec(format!(
            "{} bits do not fit an integer",
            many.len()
        ))),
        many => {
            let packed = many
                .iter()
                .enumerate()
                .filter(|(_, b)| **b)
                .fold(0i64, |acc, (i, _)| acc | (1 << i));
            Ok(ProtocolValue::Integer(packed))
        },
    }
}

fn decode_registers(words: &[u16], point: &ModbusPoint) -> Result<ProtocolValue> {
    if point.data_type == ModbusDataType::String {
        return decode_string(words);
    }

    let width = point.data_type.word_count() as usize;
    if words.len() != width {
        return Err(PollSrvError::codec(format!(
            "{} needs {} register(s), got {}",
            point.data_type.as_str(),
            width,
            words.len()
        )));
    }

    let combined = ordered(words, point.word_order)
        .iter()
        .fold(0u64, |acc, w| (acc << 16) | u64::from(*w));
    trace!(
        "Compose {:04X?} ({:?} words) -> 0x{:X}",
        words,
        point.word_order,
        combined
    );

    let value = match point.data_type {
        ModbusDataType::Uint16 | ModbusDataType::Uint32 => ProtocolValue::Integer(combined as i64),
        ModbusDataType::Int16 => ProtocolValue::Integer(i64::from(combined as u16 as i16)),
        ModbusDataType::Int32 => ProtocolValue::Integer(i64::from(combined as u32 as i32)),
        ModbusDataType::Float32 => {
            let f = f32::from_bits(combined as u32);
            if !f.is_finite() {
                return Err(PollSrvError::codec(format!("float32 is not finite: {f}")));
            }
            ProtocolValue::Float(f64::from(f))
        },
        ModbusDataType::Uint64 => match i64::try_from(combined) {
            Ok(i) => ProtocolValue::Integer(i),
            Err(_) => ProtocolValue::Float(combined as f64),
        },
        ModbusDataType::Int64 => ProtocolValue::Integer(combined as i64),
        ModbusDataType::String => decode_string(words)?,
    };
    Ok(value)
}

fn decode_string(words: &[u16]) -> Result<ProtocolValue> {
    if words.is_empty() {
        return Err(PollSrvError::codec("string needs at least one register"));
    }
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let text = String::from_utf8_lossy(&bytes[..end]);
    Ok(ProtocolValue::String(text.trim_end_matches('\0').to_string()))
}

fn ordered(words: &[u16], order: Order) -> Vec<u16> {
    match order {
        Order::Big => words.to_vec(),
        Order::Little => words.iter().rev().copied().collect(),
    }
}

/// Encode `value` for a write of `point` as `kind`
pub fn encode(
    value: &ProtocolValue,
    point: &ModbusPoint,
    kind: RegisterKind,
    scale: f64,
    offset: f64,
) -> Result<RawValue> {
    if !kind.is_writable() {
        return Err(PollSrvError::ReadOnlyRegister {
            kind: kind.to_string(),
            address: point.address,
        });
    }
    if kind == RegisterKind::Coil {
        return Ok(RawValue::Bits(vec![coil_state(value)?]));
    }
    if point.data_type == ModbusDataType::String {
        return encode_string(value, point);
    }

    let number = value.as_f64().ok_or_else(|| {
        PollSrvError::codec(format!("'{}' is not numeric", value))
    })?;
    let x = invert_scale(number, scale, offset);
    if !x.is_finite() {
        return Err(PollSrvError::codec(format!("cannot encode {x}")));
    }

    let words: Vec<u16> = match point.data_type {
        ModbusDataType::Uint16 | ModbusDataType::Int16 => {
            let mut v = x.round();
            if v < 0.0 {
                v += 65_536.0;
            }
            vec![v.clamp(0.0, 65_535.0) as u16]
        },
        ModbusDataType::Uint32 => split_words(in_range(x.round(), 0.0, u32::MAX as f64)? as u64, 2),
        ModbusDataType::Int32 => {
            let v = in_range(x.round(), i32::MIN as f64, i32::MAX as f64)? as i32;
            split_words(u64::from(v as u32), 2)
        },
        ModbusDataType::Float32 => {
            let f = x as f32;
            if !f.is_finite() {
                return Err(PollSrvError::codec(format!("{x} overflows float32")));
            }
            split_words(u64::from(f.to_bits()), 2)
        },
        ModbusDataType::Uint64 => split_words(below(x.round(), 0.0, TWO_POW_64)? as u64, 4),
        ModbusDataType::Int64 => {
            let v = below(x.round(), -TWO_POW_63, TWO_POW_63)? as i64;
            split_words(v as u64, 4)
        },
        ModbusDataType::String => return encode_string(value, point),
    };
    Ok(RawValue::Registers(ordered(&words, point.word_order)))
}

/// Coil state from a number or an on/off token
fn coil_state(value: &ProtocolValue) -> Result<bool> {
    if let Some(f) = value.as_f64() {
        return Ok(f.trunc() != 0.0);
    }
    value
        .as_bool()
        .ok_or_else(|| PollSrvError::codec(format!("'{}' is not a coil state", value)))
}

fn encode_string(value: &ProtocolValue, point: &ModbusPoint) -> Result<RawValue> {
    let text = value.to_string();
    let mut bytes = text.into_bytes();
    let capacity = point.count.map(|c| c as usize * 2);
    match capacity {
        Some(cap) if bytes.len() > cap => {
            return Err(PollSrvError::codec(format!(
                "string of {} bytes exceeds {} register(s)",
                bytes.len(),
                cap / 2
            )))
        },
        Some(cap) => bytes.resize(cap, 0),
        None => {
            if bytes.is_empty() || bytes.len() % 2 == 1 {
                bytes.push(0);
            }
        },
    }
    let words = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Ok(RawValue::Registers(words))
}

// u64::MAX and i64::MAX round up to these as f64, so the upper bound is exclusive
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// `v` within `[min, end)`
fn below(v: f64, min: f64, end: f64) -> Result<f64> {
    if v < min || v >= end {
        return Err(PollSrvError::codec(format!("{v} out of range [{min}, {end})")));
    }
    Ok(v)
}

fn in_range(v: f64, min: f64, max: f64) -> Result<f64> {
    if v < min || v > max {
        return Err(PollSrvError::codec(format!(
            "{v} out of range [{min}, {max}]"
        )));
    }
    Ok(v)
}

/// Most-significant word first
fn split_words(v: u64, count: usize) -> Vec<u16> {
    (0..count)
        .rev()
        .map(|i| (v >> (16 * i)) as u16)
        .collect()
}

/// Undecoded view for diagnostics
pub fn raw_report(
    raw: &RawValue,
    point: &ModbusPoint,
    kind: Option<RegisterKind>,
) -> serde_json::Value {
    let detected = kind.map(RegisterKind::as_str);
    match raw {
        RawValue::Registers(words) => json!({
            "registers": words,
            "detected_type": detected,
            "address": point.address,
            "size": words.len(),
        }),
        RawValue::Bits(bits) if bits.len() == 1 => json!({
            "value": bits[0],
            "detected_type": detected,
            "address": point.address,
        }),
        RawValue::Bits(bits) => json!({
            "bits": bits,
            "detected_type": detected,
            "address": point.address,
            "size": bits.len(),
        }),
        other => json!({
            "value": format!("{:?}", other),
            "address": point.address,
            "size": other.size(),
        }),
    }
}
