//! Modbus PDU
//!
//! Requests are built in a fixed-size stack buffer; responses are parsed from
//! the same type so framing code never deals with raw offsets.

use tracing::trace;

use super::constants::{
    EXCEPTION_FLAG, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MAX_READ_COILS,
    MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::core::entity::RegisterKind;
use crate::error::{PollSrvError, Result};

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a received PDU
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(PollSrvError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(PollSrvError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(PollSrvError::protocol(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    fn u16_at(&self, offset: usize) -> Option<u16> {
        (offset + 1 < self.len).then(|| u16::from_be_bytes([self.data[offset], self.data[offset + 1]]))
    }

    // ------------------------------------------------------------------
    // Request builders
    // ------------------------------------------------------------------

    /// FC01-FC04 read request for `kind`
    pub fn read_request(kind: RegisterKind, address: u16, count: u16) -> Result<Self> {
        let limit = if kind.is_bit() {
            MAX_READ_COILS
        } else {
            MAX_READ_REGISTERS
        };
        if count == 0 || count > limit {
            return Err(PollSrvError::protocol(format!(
                "read count {} out of range 1..={} for {}",
                count, limit, kind
            )));
        }
        if address as u32 + count as u32 > 0x1_0000 {
            return Err(PollSrvError::protocol(format!(
                "read of {} from {} exceeds the 16-bit address space",
                count, address
            )));
        }
        Ok(PduBuilder::new()
            .function_code(read_function_code(kind))?
            .address(address)?
            .quantity(count)?
            .build())
    }

    /// FC05 write single coil
    pub fn write_single_coil(address: u16, on: bool) -> Result<Self> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_COIL)?
            .address(address)?
            .quantity(if on { 0xFF00 } else { 0x0000 })?
            .build())
    }

    /// FC06 write single register
    pub fn write_single_register(address: u16, value: u16) -> Result<Self> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    /// FC15 write multiple coils
    pub fn write_multiple_coils(address: u16, bits: &[bool]) -> Result<Self> {
        if bits.is_empty() || bits.len() > MAX_WRITE_COILS as usize {
            return Err(PollSrvError::protocol(format!(
                "coil write count {} out of range",
                bits.len()
            )));
        }
        let packed = pack_bits(bits);
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_COILS)?
            .address(address)?
            .quantity(bits.len() as u16)?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build())
    }

    /// FC16 write multiple registers
    pub fn write_multiple_registers(address: u16, values: &[u16]) -> Result<Self> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(PollSrvError::protocol(format!(
                "register write count {} out of range",
                values.len()
            )));
        }
        let mut builder = PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(values.len() as u16)?
            .byte((values.len() * 2) as u8)?;
        for v in values {
            builder = builder.quantity(*v)?;
        }
        Ok(builder.build())
    }

    // ------------------------------------------------------------------
    // Response parsers
    // ------------------------------------------------------------------

    fn check_function(&self, expected: u8) -> Result<()> {
        if let Some(code) = self.exception_code() {
            return Err(PollSrvError::protocol(format!(
                "exception 0x{:02X} ({}) for FC{:02X}",
                code,
                exception_description(code),
                expected
            )));
        }
        match self.function_code() {
            Some(fc) if fc == expected => Ok(()),
            Some(fc) => Err(PollSrvError::protocol(format!(
                "function code mismatch: expected {:02X}, got {:02X}",
                expected, fc
            ))),
            None => Err(PollSrvError::protocol("empty response PDU")),
        }
    }

    /// Parse a FC03/FC04 response into exactly `count` words
    pub fn parse_registers(&self, kind: RegisterKind, count: u16) -> Result<Vec<u16>> {
        self.check_function(read_function_code(kind))?;
        let byte_count = *self
            .as_slice()
            .get(1)
            .ok_or_else(|| PollSrvError::protocol("response missing byte count"))?
            as usize;
        if byte_count != count as usize * 2 || self.len < 2 + byte_count {
            return Err(PollSrvError::protocol(format!(
                "register response carries {} bytes, expected {}",
                byte_count,
                count as usize * 2
            )));
        }
        let words: Vec<u16> = self.data[2..2 + byte_count]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        trace!("FC{:02X} words: {:?}", read_function_code(kind), words);
        Ok(words)
    }

    /// Parse a FC01/FC02 response into exactly `count` bits
    pub fn parse_bits(&self, kind: RegisterKind, count: u16) -> Result<Vec<bool>> {
        self.check_function(read_function_code(kind))?;
        let byte_count = *self
            .as_slice()
            .get(1)
            .ok_or_else(|| PollSrvError::protocol("response missing byte count"))?
            as usize;
        let needed = (count as usize).div_ceil(8);
        if byte_count != needed || self.len < 2 + byte_count {
            return Err(PollSrvError::protocol(format!(
                "bit response carries {} bytes, expected {}",
                byte_count, needed
            )));
        }
        Ok(unpack_bits(&self.data[2..2 + byte_count], count as usize))
    }

    /// Validate a write echo (FC05/06/15/16 all echo address + value/quantity)
    pub fn check_write_echo(&self, request: &ModbusPdu) -> Result<()> {
        let fc = request
            .function_code()
            .ok_or_else(|| PollSrvError::protocol("empty request PDU"))?;
        self.check_function(fc)?;
        let (Some(addr), Some(val)) = (self.u16_at(1), self.u16_at(3)) else {
            return Err(PollSrvError::protocol("write response too short"));
        };
        if Some(addr) != request.u16_at(1) || Some(val) != request.u16_at(3) {
            return Err(PollSrvError::protocol(format!(
                "write echo mismatch: address {} value {}",
                addr, val
            )));
        }
        Ok(())
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> Result<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> Result<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> Result<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> Result<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> Result<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }
}

pub fn read_function_code(kind: RegisterKind) -> u8 {
    match kind {
        RegisterKind::Coil => FC_READ_COILS,
        RegisterKind::Discrete => FC_READ_DISCRETE_INPUTS,
        RegisterKind::Holding => FC_READ_HOLDING_REGISTERS,
        RegisterKind::Input => FC_READ_INPUT_REGISTERS,
    }
}

/// LSB-first packing used by FC01/02/15
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, b)| **b) {
        bytes[i / 8] |= 1 << (i % 8);
    }
    bytes
}

pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).map(|b| b & (1 << (i % 8)) != 0).unwrap_or(false))
        .collect()
}

fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_pdu_builder() {
        let pdu = PduBuilder::new()
            .function_code(0x03)
            .unwrap()
            .address(0x0100)
            .unwrap()
            .quantity(0x000A)
            .unwrap()
            .build();

        assert_eq!(pdu.len(), 5);
        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_read_request_limits() {
        let pdu = ModbusPdu::read_request(RegisterKind::Input, 7, 2).unwrap();
        assert_eq!(pdu.as_slice(), &[0x04, 0x00, 0x07, 0x00, 0x02]);

        assert!(ModbusPdu::read_request(RegisterKind::Holding, 0, 0).is_err());
        assert!(ModbusPdu::read_request(RegisterKind::Holding, 0, 126).is_err());
        assert!(ModbusPdu::read_request(RegisterKind::Coil, 0, 2000).is_ok());
        assert!(ModbusPdu::read_request(RegisterKind::Holding, 65535, 2).is_err());
    }

    #[test]
    fn test_write_multiple_registers_layout() {
        let pdu = ModbusPdu::write_multiple_registers(0x10, &[0x0001, 0x0002]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0x00, 0x01, 0x00, 0x02]
        );
    }

    #[test]
    fn test_exception_response() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));

        let err = pdu.parse_registers(RegisterKind::Holding, 1).unwrap_err();
        assert!(err.to_string().contains("illegal data address"));
    }

    #[test]
    fn test_parse_registers_strict_length() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x00, 0x01, 0x00, 0x02]).unwrap();
        assert_eq!(
            pdu.parse_registers(RegisterKind::Holding, 2).unwrap(),
            vec![1, 2]
        );
        assert!(pdu.parse_registers(RegisterKind::Holding, 1).is_err());
        assert!(pdu.parse_registers(RegisterKind::Input, 2).is_err());
    }

    #[test]
    fn test_bits_roundtrip_lsb_first() {
        let bits = [true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(unpack_bits(&packed, bits.len()), bits.to_vec());
    }

    #[test]
    fn test_write_echo() {
        let req = ModbusPdu::write_single_register(4, 0xBEEF).unwrap();
        let ok = ModbusPdu::from_slice(req.as_slice()).unwrap();
        assert!(ok.check_write_echo(&req).is_ok());

        let bad = ModbusPdu::from_slice(&[0x06, 0x00, 0x04, 0x00, 0x00]).unwrap();
        assert!(bad.check_write_echo(&req).is_err());
    }

    #[test]
    fn test_pdu_overflow() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.extend(&vec![0xFF; MAX_PDU_SIZE + 1]).is_err());
        assert!(ModbusPdu::from_slice(&vec![0x01; MAX_PDU_SIZE + 1]).is_err());
    }
}
