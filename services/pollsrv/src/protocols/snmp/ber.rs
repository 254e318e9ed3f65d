//! SNMP v1/v2c message codec (BER subset)
//!
//! Covers exactly what GET, GETNEXT and SET need: the message envelope,
//! the four PDU kinds, and the SMIv2 application types.

use std::fmt;

use crate::core::types::{Scalar, TypedScalar};
use crate::error::{PollSrvError, Result};

// Universal tags
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

// Application tags
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_OPAQUE: u8 = 0x44;
const TAG_COUNTER64: u8 = 0x46;

// v2c exception values
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;

/// Protocol version as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpVersion {
    V1,
    V2c,
}

impl SnmpVersion {
    /// Parse a configured version. v3 is rejected as unsupported.
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().to_ascii_lowercase().trim_start_matches('v') {
            "1" => Ok(SnmpVersion::V1),
            "2" | "2c" => Ok(SnmpVersion::V2c),
            "3" => Err(PollSrvError::unsupported("SNMPv3 is not supported")),
            other => Err(PollSrvError::config(format!(
                "unknown SNMP version '{other}'"
            ))),
        }
    }

    fn wire(self) -> i64 {
        match self {
            SnmpVersion::V1 => 0,
            SnmpVersion::V2c => 1,
        }
    }
}

impl fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnmpVersion::V1 => f.write_str("1"),
            SnmpVersion::V2c => f.write_str("2c"),
        }
    }
}

/// Object identifier arcs
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub Vec<u32>);

impl Oid {
    /// Parse dotted-decimal text; a leading dot is accepted
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim().trim_start_matches('.');
        let arcs = trimmed
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| PollSrvError::config(format!("malformed OID '{text}'")))?;
        if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
            return Err(PollSrvError::config(format!("malformed OID '{text}'")));
        }
        Ok(Oid(arcs))
    }

    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", arc)?;
            first = false;
        }
        Ok(())
    }
}

/// Variable binding value
#[derive(Debug, Clone, PartialEq)]
pub enum BerValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectId(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl BerValue {
    /// v2c exception markers carry no data
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            BerValue::NoSuchObject | BerValue::NoSuchInstance | BerValue::EndOfMibView
        )
    }

    /// Normalize once at the transport boundary
    pub fn to_typed(&self) -> TypedScalar {
        match self {
            BerValue::Integer(i) => TypedScalar::new("Integer", Scalar::Integer(*i)),
            BerValue::OctetString(bytes) => {
                TypedScalar::new("OctetString", Scalar::Text(printable(bytes)))
            },
            BerValue::Null => TypedScalar::new("Null", Scalar::Text(String::new())),
            BerValue::ObjectId(oid) => {
                TypedScalar::new("ObjectIdentifier", Scalar::Text(oid.to_string()))
            },
            BerValue::IpAddress(ip) => TypedScalar::new(
                "IpAddress",
                Scalar::Text(format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3])),
            ),
            BerValue::Counter32(v) => TypedScalar::new("Counter32", Scalar::Integer(i64::from(*v))),
            BerValue::Gauge32(v) => TypedScalar::new("Gauge32", Scalar::Integer(i64::from(*v))),
            BerValue::TimeTicks(v) => TypedScalar::new("TimeTicks", Scalar::Integer(i64::from(*v))),
            BerValue::Opaque(bytes) => TypedScalar::new("Opaque", Scalar::Text(hex::encode(bytes))),
            BerValue::Counter64(v) => match i64::try_from(*v) {
                Ok(i) => TypedScalar::new("Counter64", Scalar::Integer(i)),
                Err(_) => TypedScalar::new("Counter64", Scalar::Float(*v as f64)),
            },
            BerValue::NoSuchObject => TypedScalar::new("NoSuchObject", Scalar::Text(String::new())),
            BerValue::NoSuchInstance => {
                TypedScalar::new("NoSuchInstance", Scalar::Text(String::new()))
            },
            BerValue::EndOfMibView => TypedScalar::new("EndOfMibView", Scalar::Text(String::new())),
        }
    }
}

/// UTF-8 text when printable, hex otherwise
fn printable(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control() || c.is_whitespace() || c == '\0') => {
            s.trim_end_matches('\0').to_string()
        },
        _ => hex::encode(bytes),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduKind {
    Get,
    GetNext,
    Response,
    Set,
}

impl PduKind {
    fn tag(self) -> u8 {
        match self {
            PduKind::Get => 0xA0,
            PduKind::GetNext => 0xA1,
            PduKind::Response => 0xA2,
            PduKind::Set => 0xA3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0xA0 => Ok(PduKind::Get),
            0xA1 => Ok(PduKind::GetNext),
            0xA2 => Ok(PduKind::Response),
            0xA3 => Ok(PduKind::Set),
            other => Err(PollSrvError::protocol(format!(
                "unsupported PDU tag 0x{other:02X}"
            ))),
        }
    }
}

/// One SNMP message
#[derive(Debug, Clone, PartialEq)]
pub struct SnmpMessage {
    pub version: SnmpVersion,
    pub community: Vec<u8>,
    pub kind: PduKind,
    pub request_id: i32,
    pub error_status: i64,
    pub error_index: i64,
    pub bindings: Vec<(Oid, BerValue)>,
}

impl SnmpMessage {
    pub fn request(
        version: SnmpVersion,
        community: &str,
        kind: PduKind,
        request_id: i32,
        bindings: Vec<(Oid, BerValue)>,
    ) -> Self {
        Self {
            version,
            community: community.as_bytes().to_vec(),
            kind,
            request_id,
            error_status: 0,
            error_index: 0,
            bindings,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut varbinds = Vec::new();
        for (oid, value) in &self.bindings {
            let mut vb = Vec::new();
            write_oid(&mut vb, oid);
            write_value(&mut vb, value);
            write_tlv(&mut varbinds, TAG_SEQUENCE, &vb);
        }

        let mut pdu = Vec::new();
        write_integer(&mut pdu, TAG_INTEGER, i64::from(self.request_id));
        write_integer(&mut pdu, TAG_INTEGER, self.error_status);
        write_integer(&mut pdu, TAG_INTEGER, self.error_index);
        write_tlv(&mut pdu, TAG_SEQUENCE, &varbinds);

        let mut body = Vec::new();
        write_integer(&mut body, TAG_INTEGER, self.version.wire());
        write_tlv(&mut body, TAG_OCTET_STRING, &self.community);
        write_tlv(&mut body, self.kind.tag(), &pdu);

        let mut out = Vec::with_capacity(body.len() + 4);
        write_tlv(&mut out, TAG_SEQUENCE, &body);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut outer = Reader::new(buf);
        let mut msg = Reader::new(outer.expect(TAG_SEQUENCE)?);

        let version = match msg.integer()? {
            0 => SnmpVersion::V1,
            1 => SnmpVersion::V2c,
            other => {
                return Err(PollSrvError::protocol(format!(
                    "unsupported SNMP version field {other}"
                )))
            },
        };
        let community = msg.expect(TAG_OCTET_STRING)?.to_vec();
        let (tag, pdu_body) = msg.tlv()?;
        let kind = PduKind::from_tag(tag)?;

        let mut pdu = Reader::new(pdu_body);
        let request_id = i32::try_from(pdu.integer()?)
            .map_err(|_| PollSrvError::protocol("request id out of range"))?;
        let error_status = pdu.integer()?;
        let error_index = pdu.integer()?;

        let mut list = Reader::new(pdu.expect(TAG_SEQUENCE)?);
        let mut bindings = Vec::new();
        while !list.is_empty() {
            let mut vb = Reader::new(list.expect(TAG_SEQUENCE)?);
            let oid = decode_oid(vb.expect(TAG_OID)?)?;
            let value = vb.value()?;
            bindings.push((oid, value));
        }

        Ok(Self {
            version,
            community,
            kind,
            request_id,
            error_status,
            error_index,
            bindings,
        })
    }
}

/// Standard error-status names
pub fn error_status_name(status: i64) -> &'static str {
    match status {
        0 => "noError",
        1 => "tooBig",
        2 => "noSuchName",
        3 => "badValue",
        4 => "readOnly",
        5 => "genErr",
        6 => "noAccess",
        7 => "wrongType",
        8 => "wrongLength",
        9 => "wrongEncoding",
        10 => "wrongValue",
        11 => "noCreation",
        12 => "inconsistentValue",
        13 => "resourceUnavailable",
        14 => "commitFailed",
        15 => "undoFailed",
        16 => "authorizationError",
        17 => "notWritable",
        18 => "inconsistentName",
        _ => "unknown",
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (8 - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    write_length(out, content.len());
    out.extend_from_slice(content);
}

/// Minimal two's complement
fn write_integer(out: &mut Vec<u8>, tag: u8, v: i64) {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        if (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    write_tlv(out, tag, &bytes[start..]);
}

/// Minimal unsigned, with a leading zero when the top bit is set
fn write_unsigned(out: &mut Vec<u8>, tag: u8, v: u64) {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
    let mut content = Vec::with_capacity(9);
    if bytes[skip] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(&bytes[skip..]);
    write_tlv(out, tag, &content);
}

fn write_oid(out: &mut Vec<u8>, oid: &Oid) {
    let arcs = &oid.0;
    let mut content = Vec::new();
    let first = arcs.first().copied().unwrap_or(0) * 40 + arcs.get(1).copied().unwrap_or(0);
    push_base128(&mut content, first);
    for arc in arcs.iter().skip(2) {
        push_base128(&mut content, *arc);
    }
    write_tlv(out, TAG_OID, &content);
}

fn push_base128(out: &mut Vec<u8>, mut v: u32) {
    let mut tmp = [0u8; 5];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    let last = tmp.len() - 1;
    for (j, b) in tmp.iter().enumerate().skip(i) {
        out.push(if j == last { *b } else { *b | 0x80 });
    }
}

fn write_value(out: &mut Vec<u8>, value: &BerValue) {
    match value {
        BerValue::Integer(i) => write_integer(out, TAG_INTEGER, *i),
        BerValue::OctetString(b) => write_tlv(out, TAG_OCTET_STRING, b),
        BerValue::Null => write_tlv(out, TAG_NULL, &[]),
        BerValue::ObjectId(oid) => write_oid(out, oid),
        BerValue::IpAddress(ip) => write_tlv(out, TAG_IP_ADDRESS, ip),
        BerValue::Counter32(v) => write_unsigned(out, TAG_COUNTER32, u64::from(*v)),
        BerValue::Gauge32(v) => write_unsigned(out, TAG_GAUGE32, u64::from(*v)),
        BerValue::TimeTicks(v) => write_unsigned(out, TAG_TIMETICKS, u64::from(*v)),
        BerValue::Opaque(b) => write_tlv(out, TAG_OPAQUE, b),
        BerValue::Counter64(v) => write_unsigned(out, TAG_COUNTER64, *v),
        BerValue::NoSuchObject => write_tlv(out, TAG_NO_SUCH_OBJECT, &[]),
        BerValue::NoSuchInstance => write_tlv(out, TAG_NO_SUCH_INSTANCE, &[]),
        BerValue::EndOfMibView => write_tlv(out, TAG_END_OF_MIB_VIEW, &[]),
    }
}

// ============================================================================
// Decoding
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| PollSrvError::protocol("truncated BER data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.byte()?;
        let first = self.byte()?;
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let n = (first & 0x7F) as usize;
            if n == 0 || n > 4 {
                return Err(PollSrvError::protocol(format!(
                    "unsupported BER length form 0x{first:02X}"
                )));
            }
            (0..n).try_fold(0usize, |acc, _| Ok::<_, PollSrvError>((acc << 8) | self.byte()? as usize))?
        };
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| PollSrvError::protocol("BER length exceeds buffer"))?;
        let buf = self.buf;
        let content = &buf[self.pos..end];
        self.pos = end;
        Ok((tag, content))
    }

    fn expect(&mut self, tag: u8) -> Result<&'a [u8]> {
        let (got, content) = self.tlv()?;
        if got != tag {
            return Err(PollSrvError::protocol(format!(
                "expected BER tag 0x{tag:02X}, got 0x{got:02X}"
            )));
        }
        Ok(content)
    }

    fn integer(&mut self) -> Result<i64> {
        decode_signed(self.expect(TAG_INTEGER)?)
    }

    fn value(&mut self) -> Result<BerValue> {
        let (tag, content) = self.tlv()?;
        Ok(match tag {
            TAG_INTEGER => BerValue::Integer(decode_signed(content)?),
            TAG_OCTET_STRING => BerValue::OctetString(content.to_vec()),
            TAG_NULL => BerValue::Null,
            TAG_OID => BerValue::ObjectId(decode_oid(content)?),
            TAG_IP_ADDRESS => {
                let ip: [u8; 4] = content
                    .try_into()
                    .map_err(|_| PollSrvError::protocol("IpAddress must be 4 bytes"))?;
                BerValue::IpAddress(ip)
            },
            TAG_COUNTER32 => BerValue::Counter32(decode_unsigned(content)? as u32),
            TAG_GAUGE32 => BerValue::Gauge32(decode_unsigned(content)? as u32),
            TAG_TIMETICKS => BerValue::TimeTicks(decode_unsigned(content)? as u32),
            TAG_OPAQUE => BerValue::Opaque(content.to_vec()),
            TAG_COUNTER64 => BerValue::Counter64(decode_unsigned(content)?),
            TAG_NO_SUCH_OBJECT => BerValue::NoSuchObject,
            TAG_NO_SUCH_INSTANCE => BerValue::NoSuchInstance,
            TAG_END_OF_MIB_VIEW => BerValue::EndOfMibView,
            other => {
                return Err(PollSrvError::protocol(format!(
                    "unsupported value tag 0x{other:02X}"
                )))
            },
        })
    }
}

fn decode_signed(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(PollSrvError::protocol(format!(
            "INTEGER of {} bytes",
            content.len()
        )));
    }
    let init: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(content.iter().fold(init, |acc, b| (acc << 8) | i64::from(*b)))
}

fn decode_unsigned(content: &[u8]) -> Result<u64> {
    let content = match content {
        [0, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    if content.is_empty() || content.len() > 8 {
        return Err(PollSrvError::protocol(format!(
            "unsigned of {} bytes",
            content.len()
        )));
    }
    Ok(content.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_oid(content: &[u8]) -> Result<Oid> {
    let mut arcs = Vec::new();
    let mut acc: u32 = 0;
    for (i, b) in content.iter().enumerate() {
        acc = acc
            .checked_mul(128)
            .map(|v| v | u32::from(b & 0x7F))
            .ok_or_else(|| PollSrvError::protocol("OID arc overflow"))?;
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (acc / 40).min(2);
                arcs.push(first);
                arcs.push(acc - first * 40);
            } else {
                arcs.push(acc);
            }
            acc = 0;
        } else if i == content.len() - 1 {
            return Err(PollSrvError::protocol("truncated OID arc"));
        }
    }
    if arcs.is_empty() {
        return Err(PollSrvError::protocol("empty OID"));
    }
    Ok(Oid(arcs))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_get_request_bytes() {
        let oid = Oid::parse("1.3.6.1.2.1.1.1.0").unwrap();
        let msg = SnmpMessage::request(
            SnmpVersion::V2c,
            "public",
            PduKind::Get,
            1,
            vec![(oid, BerValue::Null)],
        );
        let expected = hex::decode(
            "302602010104067075626c6963a019020101020100020100300e300c06082b060102010101000500",
        )
        .unwrap();
        assert_eq!(msg.encode(), expected);
        assert_eq!(SnmpMessage::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn test_integer_encoding_is_minimal() {
        let cases: [(i64, &[u8]); 5] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x00, 0x80]),
            (-1, &[0xFF]),
            (-129, &[0xFF, 0x7F]),
        ];
        for (v, content) in cases {
            let mut out = Vec::new();
            write_integer(&mut out, TAG_INTEGER, v);
            assert_eq!(&out[2..], content, "{v}");
            assert_eq!(decode_signed(content).unwrap(), v);
        }
    }

    #[test]
    fn test_unsigned_types() {
        let mut out = Vec::new();
        write_value(&mut out, &BerValue::Counter32(u32::MAX));
        assert_eq!(out, vec![0x41, 0x05, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]);
        let mut r = Reader::new(&out);
        assert_eq!(r.value().unwrap(), BerValue::Counter32(u32::MAX));
    }

    #[test]
    fn test_oid_large_arcs() {
        let oid = Oid::parse(".1.3.6.1.4.1.2021.10.1.3.1").unwrap();
        let mut out = Vec::new();
        write_oid(&mut out, &oid);
        assert_eq!(decode_oid(&out[2..]).unwrap(), oid);
        assert_eq!(oid.to_string(), "1.3.6.1.4.1.2021.10.1.3.1");
    }

    #[test]
    fn test_malformed_oids() {
        assert!(Oid::parse("").is_err());
        assert!(Oid::parse("1").is_err());
        assert!(Oid::parse("1.3.x").is_err());
        assert!(Oid::parse("3.1").is_err());
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(SnmpVersion::parse("2c").unwrap(), SnmpVersion::V2c);
        assert_eq!(SnmpVersion::parse("v1").unwrap(), SnmpVersion::V1);
        assert!(matches!(
            SnmpVersion::parse("3"),
            Err(PollSrvError::Unsupported(_))
        ));
    }

    #[test]
    fn test_typed_normalization() {
        assert_eq!(
            BerValue::OctetString(b"UPS 3000".to_vec()).to_typed().value,
            Scalar::Text("UPS 3000".into())
        );
        assert_eq!(
            BerValue::OctetString(vec![0x00, 0x1B, 0xFF]).to_typed().value,
            Scalar::Text("001bff".into())
        );
        assert_eq!(BerValue::TimeTicks(100).to_typed().syntax, "TimeTicks");
        assert_eq!(
            BerValue::IpAddress([10, 0, 0, 1]).to_typed().value,
            Scalar::Text("10.0.0.1".into())
        );
    }

    #[test]
    fn test_truncated_input_rejected() {
        assert!(SnmpMessage::decode(&[0x30, 0x10, 0x02]).is_err());
        assert!(SnmpMessage::decode(&[]).is_err());
    }
}
