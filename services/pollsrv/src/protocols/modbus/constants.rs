//! Modbus protocol constants
//!
//! Limits follow the protocol definition: the PDU is capped at 253 bytes
//! (256-byte RS485 ADU minus slave address and CRC).

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header bytes before the unit id: Transaction(2) + Protocol(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Receive buffer for one TCP/UDP frame (header + unit + PDU, with margin)
pub const RESPONSE_BUFFER_SIZE: usize = 512;

/// Smallest valid RTU frame: unit + function + exception code + CRC(2)
pub const MIN_RTU_FRAME: usize = 5;

// ============================================================================
// Operation Limits
// ============================================================================

/// FC03/FC04: (253 - 2) / 2
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC16: (253 - 6) / 2
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// FC01/FC02
pub const MAX_READ_COILS: u16 = 2000;

/// FC15
pub const MAX_WRITE_COILS: u16 = 1968;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception bit set on the echoed function code
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Connection Defaults
// ============================================================================

pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_SLAVE_ID: u8 = 1;
pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Silence that marks the end of an RTU frame
pub const RTU_INTER_FRAME_GAP: Duration = Duration::from_millis(50);
