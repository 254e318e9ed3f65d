//! In-memory Modbus TCP slave
//!
//! Serves FC01-FC06, FC15 and FC16 from four sparse tables. Reading or
//! writing an address that was never populated answers with exception 0x02,
//! which is what register-kind detection relies on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::constants::{
    EXCEPTION_FLAG, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH, MBAP_HEADER_LEN,
};
use super::pdu::{pack_bits, unpack_bits};
use crate::error::{PollSrvError, Result};

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const ILLEGAL_DATA_VALUE: u8 = 0x03;

#[derive(Default)]
struct Tables {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    discrete: HashMap<u16, bool>,
}

/// Shared register image plus request counter
#[derive(Clone, Default)]
pub struct ModbusSimulator {
    tables: Arc<RwLock<Tables>>,
    requests: Arc<AtomicUsize>,
    last_unit: Arc<AtomicU8>,
}

impl ModbusSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_holding(self, start: u16, words: &[u16]) -> Self {
        self.set_holding(start, words);
        self
    }

    pub fn with_input(self, start: u16, words: &[u16]) -> Self {
        {
            let mut t = self.tables.write();
            for (i, w) in words.iter().enumerate() {
                t.input.insert(start + i as u16, *w);
            }
        }
        self
    }

    pub fn with_coils(self, start: u16, bits: &[bool]) -> Self {
        {
            let mut t = self.tables.write();
            for (i, b) in bits.iter().enumerate() {
                t.coils.insert(start + i as u16, *b);
            }
        }
        self
    }

    pub fn with_discrete(self, start: u16, bits: &[bool]) -> Self {
        {
            let mut t = self.tables.write();
            for (i, b) in bits.iter().enumerate() {
                t.discrete.insert(start + i as u16, *b);
            }
        }
        self
    }

    pub fn set_holding(&self, start: u16, words: &[u16]) {
        let mut t = self.tables.write();
        for (i, w) in words.iter().enumerate() {
            t.holding.insert(start + i as u16, *w);
        }
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.tables.read().holding.get(&address).copied()
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.tables.read().coils.get(&address).copied()
    }

    /// Requests served since start
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Unit id of the most recent request
    pub fn last_unit(&self) -> u8 {
        self.last_unit.load(Ordering::Relaxed)
    }

    /// Listen on an ephemeral localhost port until `cancel` fires
    pub async fn start(&self, cancel: CancellationToken) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        info!("Modbus simulator listening on {}", local_addr);

        let sim = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Simulator connection from {}", peer);
                            let sim = sim.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {},
                                    result = sim.serve(stream) => {
                                        if let Err(e) = result {
                                            debug!("Simulator connection closed: {}", e);
                                        }
                                    },
                                }
                            });
                        },
                        Err(e) => {
                            debug!("Simulator accept error: {}", e);
                            break;
                        },
                    },
                }
            }
        });
        Ok(local_addr)
    }

    async fn serve(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            if stream.read_exact(&mut header).await.is_err() {
                return Ok(());
            }
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if length < 2 || length > MAX_MBAP_LENGTH {
                return Err(PollSrvError::protocol(format!("bad MBAP length {length}")));
            }
            let mut body = vec![0u8; length];
            stream.read_exact(&mut body).await?;
            self.requests.fetch_add(1, Ordering::Relaxed);
            self.last_unit.store(body[0], Ordering::Relaxed);

            let pdu = self.handle(&body[1..]);
            let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
            frame.extend_from_slice(&header[..4]);
            frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
            frame.push(body[0]);
            frame.extend_from_slice(&pdu);
            stream.write_all(&frame).await?;
        }
    }

    /// Answer one request PDU
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 5 {
            let fc = request.first().copied().unwrap_or(0);
            return exception(fc, ILLEGAL_DATA_VALUE);
        }
        let fc = request[0];
        let address = u16::from_be_bytes([request[1], request[2]]);
        let operand = u16::from_be_bytes([request[3], request[4]]);
        let result = match fc {
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
                let t = self.tables.read();
                let table = if fc == FC_READ_HOLDING_REGISTERS {
                    &t.holding
                } else {
                    &t.input
                };
                read_range(table, address, operand).map(|words| {
                    let mut out = vec![fc, (words.len() * 2) as u8];
                    for w in words {
                        out.extend_from_slice(&w.to_be_bytes());
                    }
                    out
                })
            },
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
                let t = self.tables.read();
                let table = if fc == FC_READ_COILS {
                    &t.coils
                } else {
                    &t.discrete
                };
                read_range(table, address, operand).map(|bits| {
                    let packed = pack_bits(&bits);
                    let mut out = vec![fc, packed.len() as u8];
                    out.extend_from_slice(&packed);
                    out
                })
            },
            FC_WRITE_SINGLE_REGISTER => {
                let mut t = self.tables.write();
                match t.holding.get_mut(&address) {
                    Some(slot) => {
                        *slot = operand;
                        Ok(request[..5].to_vec())
                    },
                    None => Err(ILLEGAL_DATA_ADDRESS),
                }
            },
            FC_WRITE_SINGLE_COIL => {
                let state = match operand {
                    0xFF00 => Ok(true),
                    0x0000 => Ok(false),
                    _ => Err(ILLEGAL_DATA_VALUE),
                };
                state.and_then(|on| {
                    let mut t = self.tables.write();
                    match t.coils.get_mut(&address) {
                        Some(slot) => {
                            *slot = on;
                            Ok(request[..5].to_vec())
                        },
                        None => Err(ILLEGAL_DATA_ADDRESS),
                    }
                })
            },
            FC_WRITE_MULTIPLE_REGISTERS => {
                let data = request.get(6..).unwrap_or_default();
                if data.len() != operand as usize * 2 {
                    Err(ILLEGAL_DATA_VALUE)
                } else {
                    let words: Vec<u16> = data
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                    let mut t = self.tables.write();
                    write_range(&mut t.holding, address, &words).map(|()| request[..5].to_vec())
                }
            },
            FC_WRITE_MULTIPLE_COILS => {
                let data = request.get(6..).unwrap_or_default();
                if data.len() != (operand as usize).div_ceil(8) {
                    Err(ILLEGAL_DATA_VALUE)
                } else {
                    let bits = unpack_bits(data, operand as usize);
                    let mut t = self.tables.write();
                    write_range(&mut t.coils, address, &bits).map(|()| request[..5].to_vec())
                }
            },
            _ => Err(ILLEGAL_FUNCTION),
        };
        result.unwrap_or_else(|code| exception(fc, code))
    }
}

fn read_range<T: Copy>(
    table: &HashMap<u16, T>,
    address: u16,
    count: u16,
) -> std::result::Result<Vec<T>, u8> {
    (0..count)
        .map(|i| {
            address
                .checked_add(i)
                .and_then(|a| table.get(&a).copied())
                .ok_or(ILLEGAL_DATA_ADDRESS)
        })
        .collect()
}

fn write_range<T: Copy>(
    table: &mut HashMap<u16, T>,
    address: u16,
    values: &[T],
) -> std::result::Result<(), u8> {
    let all_present = (0..values.len() as u16)
        .all(|i| address.checked_add(i).is_some_and(|a| table.contains_key(&a)));
    if !all_present {
        return Err(ILLEGAL_DATA_ADDRESS);
    }
    for (i, v) in values.iter().enumerate() {
        table.insert(address + i as u16, *v);
    }
    Ok(())
}

fn exception(fc: u8, code: u8) -> Vec<u8> {
    vec![fc | EXCEPTION_FLAG, code]
}
