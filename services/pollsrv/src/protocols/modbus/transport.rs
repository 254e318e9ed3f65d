//! Modbus framing over TCP, UDP and serial RTU
//!
//! TCP and UDP wrap the PDU in an MBAP header with a rolling transaction id.
//! RTU frames are `unit + PDU + CRC-16/MODBUS` and end after a silent gap.

use std::fmt;
use std::time::Duration;

use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

#[cfg(feature = "modbus-rtu")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, RESPONSE_BUFFER_SIZE};
#[cfg(feature = "modbus-rtu")]
use super::constants::{MIN_RTU_FRAME, RTU_INTER_FRAME_GAP};
use super::pdu::ModbusPdu;
use crate::error::{PollSrvError, Result};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS of `data`
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Physical endpoint of a Modbus device
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusEndpoint {
    Tcp {
        host: String,
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
    },
    Rtu {
        port: String,
        baudrate: u32,
        parity: char,
        stopbits: u8,
        bytesize: u8,
    },
}

impl fmt::Display for ModbusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusEndpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ModbusEndpoint::Udp { host, port } => write!(f, "udp://{}:{}", host, port),
            ModbusEndpoint::Rtu {
                port,
                baudrate,
                parity,
                stopbits,
                bytesize,
            } => write!(
                f,
                "rtu://{}@{}/{}{}{}",
                port, baudrate, bytesize, parity, stopbits
            ),
        }
    }
}

enum Link {
    Tcp(TcpStream),
    Udp(UdpSocket),
    #[cfg(feature = "modbus-rtu")]
    Rtu(SerialStream),
}

/// One open Modbus link
pub struct ModbusFramer {
    link: Link,
    transaction_id: u16,
}

impl ModbusFramer {
    /// Open the physical link
    pub async fn open(endpoint: &ModbusEndpoint, io_timeout: Duration) -> Result<Self> {
        let link = match endpoint {
            ModbusEndpoint::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                let stream = timeout(io_timeout, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| PollSrvError::timeout(format!("connect to {addr}")))?
                    .map_err(|e| PollSrvError::connection(format!("{addr}: {e}")))?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                Link::Tcp(stream)
            },
            ModbusEndpoint::Udp { host, port } => {
                let addr = format!("{host}:{port}");
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                timeout(io_timeout, socket.connect(&addr))
                    .await
                    .map_err(|_| PollSrvError::timeout(format!("resolve {addr}")))?
                    .map_err(|e| PollSrvError::connection(format!("{addr}: {e}")))?;
                Link::Udp(socket)
            },
            #[cfg(feature = "modbus-rtu")]
            ModbusEndpoint::Rtu {
                port,
                baudrate,
                parity,
                stopbits,
                bytesize,
            } => {
                let parity = match parity.to_ascii_uppercase() {
                    'E' => tokio_serial::Parity::Even,
                    'O' => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };
                let data_bits = match bytesize {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };
                let stop_bits = match stopbits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };
                let serial = tokio_serial::new(port.as_str(), *baudrate)
                    .data_bits(data_bits)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .timeout(io_timeout)
                    .open_native_async()
                    .map_err(|e| PollSrvError::connection(format!("serial {port}: {e}")))?;
                Link::Rtu(serial)
            },
            #[cfg(not(feature = "modbus-rtu"))]
            ModbusEndpoint::Rtu { .. } => {
                return Err(PollSrvError::unsupported(
                    "Modbus RTU requires the modbus-rtu feature",
                ))
            },
        };
        debug!("Modbus link open: {}", endpoint);
        Ok(Self {
            link,
            transaction_id: 0,
        })
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Send one request PDU and wait for its response PDU
    pub async fn exchange(
        &mut self,
        unit_id: u8,
        request: &ModbusPdu,
        io_timeout: Duration,
    ) -> Result<ModbusPdu> {
        let tid = self.next_transaction();
        match &mut self.link {
            Link::Tcp(stream) => {
                let frame = mbap_frame(tid, unit_id, request);
                trace!("TCP TX: {}", hex::encode(&frame));
                stream.write_all(&frame).await?;

                let mut header = [0u8; MBAP_HEADER_LEN];
                timeout(io_timeout, stream.read_exact(&mut header)).await??;
                let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                if length < 2 || length > MAX_MBAP_LENGTH {
                    return Err(PollSrvError::protocol(format!(
                        "invalid MBAP length {length}"
                    )));
                }
                let mut body = vec![0u8; length];
                timeout(io_timeout, stream.read_exact(&mut body)).await??;
                trace!("TCP RX: {}{}", hex::encode(header), hex::encode(&body));

                let rx_tid = u16::from_be_bytes([header[0], header[1]]);
                if rx_tid != tid {
                    return Err(PollSrvError::protocol(format!(
                        "transaction id mismatch: sent {tid}, got {rx_tid}"
                    )));
                }
                ModbusPdu::from_slice(&body[1..])
            },
            Link::Udp(socket) => {
                let frame = mbap_frame(tid, unit_id, request);
                trace!("UDP TX: {}", hex::encode(&frame));
                socket.send(&frame).await?;

                let deadline = Instant::now() + io_timeout;
                let mut buf = [0u8; RESPONSE_BUFFER_SIZE];
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let n = timeout(remaining, socket.recv(&mut buf)).await??;
                    let (rx_tid, pdu) = parse_mbap(&buf[..n])?;
                    if rx_tid == tid {
                        return Ok(pdu);
                    }
                    // Late answer to an earlier, timed-out request
                    warn!("UDP stale datagram: tid {} (want {})", rx_tid, tid);
                }
            },
            #[cfg(feature = "modbus-rtu")]
            Link::Rtu(port) => {
                let mut frame = Vec::with_capacity(request.len() + 3);
                frame.push(unit_id);
                frame.extend_from_slice(request.as_slice());
                frame.extend_from_slice(&crc16(&frame).to_le_bytes());
                trace!("RTU TX: {}", hex::encode(&frame));
                port.write_all(&frame).await?;
                port.flush().await?;

                let response = read_rtu_frame(port, io_timeout).await?;
                trace!("RTU RX: {}", hex::encode(&response));
                parse_rtu(&response, unit_id)
            },
        }
    }
}

/// Build a TCP/UDP ADU
pub fn mbap_frame(tid: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.extend_from_slice(&tid.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    frame
}

/// Split a TCP/UDP ADU into transaction id and PDU
pub fn parse_mbap(frame: &[u8]) -> Result<(u16, ModbusPdu)> {
    if frame.len() < MBAP_HEADER_LEN + 2 {
        return Err(PollSrvError::protocol(format!(
            "MBAP frame too short: {} bytes",
            frame.len()
        )));
    }
    let tid = u16::from_be_bytes([frame[0], frame[1]]);
    let protocol = u16::from_be_bytes([frame[2], frame[3]]);
    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if protocol != 0 {
        return Err(PollSrvError::protocol(format!(
            "unexpected protocol id {protocol}"
        )));
    }
    if length < 2 || MBAP_HEADER_LEN + length > frame.len() {
        return Err(PollSrvError::protocol(format!(
            "MBAP length {} does not match frame of {} bytes",
            length,
            frame.len()
        )));
    }
    let pdu = ModbusPdu::from_slice(&frame[MBAP_HEADER_LEN + 1..MBAP_HEADER_LEN + length])?;
    Ok((tid, pdu))
}

/// Validate an RTU frame and extract its PDU
pub fn parse_rtu(frame: &[u8], unit_id: u8) -> Result<ModbusPdu> {
    if frame.len() < 4 {
        return Err(PollSrvError::protocol(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(PollSrvError::protocol(format!(
            "CRC mismatch: received {received:04X}, computed {computed:04X}"
        )));
    }
    if body[0] != unit_id {
        return Err(PollSrvError::protocol(format!(
            "unit id mismatch: expected {}, got {}",
            unit_id, body[0]
        )));
    }
    ModbusPdu::from_slice(&body[1..])
}

#[cfg(feature = "modbus-rtu")]
async fn read_rtu_frame(port: &mut SerialStream, io_timeout: Duration) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; RESPONSE_BUFFER_SIZE];
    let mut total = 0usize;
    let deadline = Instant::now() + io_timeout;

    loop {
        // Wait the full timeout for the first byte, then only the inter-frame gap
        let wait = if total == 0 {
            deadline.saturating_duration_since(Instant::now())
        } else {
            RTU_INTER_FRAME_GAP
        };
        match timeout(wait, port.read(&mut buf[total..])).await {
            Ok(Ok(0)) => return Err(PollSrvError::connection("serial port closed")),
            Ok(Ok(n)) => {
                total += n;
                if total >= buf.len() {
                    return Err(PollSrvError::protocol("RTU frame exceeds buffer size"));
                }
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if total >= MIN_RTU_FRAME => break,
            Err(_) if total == 0 => return Err(PollSrvError::timeout("RTU response")),
            Err(_) => {
                return Err(PollSrvError::timeout(format!(
                    "RTU frame incomplete: {total} bytes"
                )))
            },
        }
        if Instant::now() >= deadline && total >= MIN_RTU_FRAME {
            break;
        }
    }
    buf.truncate(total);
    Ok(buf)
}
