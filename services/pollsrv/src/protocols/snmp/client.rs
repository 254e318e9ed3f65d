//! SNMP v1/v2c transport client over UDP

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::ber::{error_status_name, BerValue, Oid, PduKind, SnmpMessage, SnmpVersion};
use crate::core::client::{ReadRequest, TransportClient, WriteRequest};
use crate::core::entity::Address;
use crate::core::registry::Protocol;
use crate::core::types::{RawValue, Scalar, TypedScalar};
use crate::error::{PollSrvError, Result};

pub const DEFAULT_SNMP_PORT: u16 = 161;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_COMMUNITY: &str = "public";

/// sysDescr.0, probed on connect
pub const SYS_DESCR_OID: &str = "1.3.6.1.2.1.1.1.0";

/// Upper bound on rows returned by one walk
const MAX_WALK_ROWS: usize = 10_000;

const RECV_BUFFER_SIZE: usize = 65_535;

pub struct SnmpClient {
    host: String,
    port: u16,
    community: String,
    version: SnmpVersion,
    timeout: Duration,
    retries: u32,
    socket: Option<UdpSocket>,
    next_request_id: i32,
}

impl std::fmt::Debug for SnmpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnmpClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("version", &self.version)
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

impl SnmpClient {
    /// Build a client; `version` "3" fails with [`PollSrvError::Unsupported`]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        community: impl Into<String>,
        version: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self> {
        Ok(Self {
            host: host.into(),
            port,
            community: community.into(),
            version: SnmpVersion::parse(version)?,
            timeout,
            retries,
            socket: None,
            next_request_id: rand::random::<i32>() & 0x3FFF_FFFF,
        })
    }

    fn request_id(&mut self) -> i32 {
        self.next_request_id = self.next_request_id.wrapping_add(1) & 0x7FFF_FFFF;
        self.next_request_id
    }

    async fn open_socket(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let target = format!("{}:{}", self.host, self.port);
        timeout(self.timeout, socket.connect(&target))
            .await
            .map_err(|_| PollSrvError::timeout(format!("resolve {target}")))?
            .map_err(|e| PollSrvError::connection(format!("{target}: {e}")))?;
        Ok(socket)
    }

    /// Send one request and wait for the matching response, retrying on timeout
    async fn exchange(&mut self, kind: PduKind, bindings: Vec<(Oid, BerValue)>) -> Result<SnmpMessage> {
        let request_id = self.request_id();
        let packet =
            SnmpMessage::request(self.version, &self.community, kind, request_id, bindings).encode();
        let socket = self.socket.as_ref().ok_or_else(PollSrvError::not_connected)?;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        for attempt in 0..=self.retries {
            trace!("SNMP TX #{} {}: {}", request_id, attempt, hex::encode(&packet));
            socket.send(&packet).await?;
            let deadline = tokio::time::Instant::now() + self.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let n = match timeout(remaining, socket.recv(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => break,
                };
                match SnmpMessage::decode(&buf[..n]) {
                    Ok(resp) if resp.request_id == request_id && resp.kind == PduKind::Response => {
                        return Ok(resp);
                    },
                    Ok(resp) => trace!("SNMP ignoring response id {}", resp.request_id),
                    Err(e) => debug!("SNMP undecodable datagram: {}", e),
                }
            }
            debug!("SNMP request {} attempt {} timed out", request_id, attempt + 1);
        }
        Err(PollSrvError::timeout(format!(
            "no SNMP response from {}:{} after {} attempt(s)",
            self.host,
            self.port,
            self.retries + 1
        )))
    }

    pub async fn get(&mut self, oid: &Oid) -> Result<TypedScalar> {
        let resp = self.exchange(PduKind::Get, vec![(oid.clone(), BerValue::Null)]).await?;
        check_status(&resp)?;
        let (_, value) = resp
            .bindings
            .into_iter()
            .next()
            .ok_or_else(|| PollSrvError::protocol("empty SNMP response"))?;
        if value.is_exception() {
            return Err(PollSrvError::not_found(format!("{oid}: {:?}", value)));
        }
        Ok(value.to_typed())
    }

    /// GETNEXT until the returned OID leaves the subtree under `root`
    pub async fn walk(&mut self, root: &Oid) -> Result<Vec<(String, TypedScalar)>> {
        let mut rows = Vec::new();
        let mut cursor = root.clone();
        while rows.len() < MAX_WALK_ROWS {
            let resp = self
                .exchange(PduKind::GetNext, vec![(cursor.clone(), BerValue::Null)])
                .await?;
            // v1 agents report the end of the MIB as noSuchName
            if resp.error_status == 2 {
                break;
            }
            check_status(&resp)?;
            let Some((oid, value)) = resp.bindings.into_iter().next() else {
                break;
            };
            if value.is_exception() || !oid.starts_with(root) || oid <= cursor {
                break;
            }
            rows.push((oid.to_string(), value.to_typed()));
            cursor = oid;
        }
        debug!("SNMP walk {} returned {} row(s)", root, rows.len());
        Ok(rows)
    }

    pub async fn set(&mut self, oid: &Oid, value: BerValue) -> Result<()> {
        let resp = self.exchange(PduKind::Set, vec![(oid.clone(), value)]).await?;
        check_status(&resp)
    }
}

fn check_status(resp: &SnmpMessage) -> Result<()> {
    if resp.error_status == 0 {
        return Ok(());
    }
    Err(PollSrvError::protocol(format!(
        "SNMP error {} ({}) at index {}",
        error_status_name(resp.error_status),
        resp.error_status,
        resp.error_index
    )))
}

/// Wire value for a SET from an encoded typed scalar
pub fn ber_from_typed(value: &TypedScalar) -> Result<BerValue> {
    let integer = || match &value.value {
        Scalar::Integer(i) => Ok(*i),
        Scalar::Float(f) if f.is_finite() => Ok(f.round() as i64),
        other => Err(PollSrvError::codec(format!(
            "{} needs a number, got '{}'",
            value.syntax, other
        ))),
    };
    let unsigned32 = |v: i64| {
        u32::try_from(v).map_err(|_| {
            PollSrvError::codec(format!("{} out of range for {}", v, value.syntax))
        })
    };
    Ok(match value.syntax.as_str() {
        "Integer" => BerValue::Integer(integer()?),
        "Counter32" => BerValue::Counter32(unsigned32(integer()?)?),
        "Gauge32" => BerValue::Gauge32(unsigned32(integer()?)?),
        "TimeTicks" => BerValue::TimeTicks(unsigned32(integer()?)?),
        "Counter64" => BerValue::Counter64(u64::try_from(integer()?).map_err(|_| {
            PollSrvError::codec("Counter64 must not be negative")
        })?),
        "OctetString" => BerValue::OctetString(value.value.to_string().into_bytes()),
        other => {
            return Err(PollSrvError::codec(format!(
                "cannot SET value of syntax {other}"
            )))
        },
    })
}

#[async_trait]
impl TransportClient for SnmpClient {
    fn protocol(&self) -> Protocol {
        Protocol::Snmp
    }

    fn endpoint(&self) -> String {
        format!("snmp://{}:{} (v{})", self.host, self.port, self.version)
    }

    async fn connect(&mut self) -> bool {
        if self.socket.is_some() {
            return true;
        }
        let socket = match self.open_socket().await {
            Ok(s) => s,
            Err(e) => {
                warn!("SNMP connect {}:{} failed: {}", self.host, self.port, e);
                return false;
            },
        };
        self.socket = Some(socket);

        let probe = match Oid::parse(SYS_DESCR_OID) {
            Ok(oid) => self.get(&oid).await,
            Err(e) => Err(e),
        };
        match probe {
            Ok(descr) => {
                info!("SNMP connected: {} ({})", self.endpoint(), descr.value);
                true
            },
            Err(e) => {
                warn!("SNMP probe of {}:{} failed: {}", self.host, self.port, e);
                self.socket = None;
                false
            },
        }
    }

    async fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            info!("SNMP disconnected: {}:{}", self.host, self.port);
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn read(&mut self, address: &Address, request: &ReadRequest) -> Option<RawValue> {
        let Address::Oid(text) = address else {
            warn!("SNMP read with non-OID address {}", address);
            return None;
        };
        let oid = match Oid::parse(text) {
            Ok(oid) => oid,
            Err(e) => {
                warn!("SNMP read: {}", e);
                return None;
            },
        };
        let result = if request.walk {
            self.walk(&oid).await.map(RawValue::Table)
        } else {
            self.get(&oid).await.map(RawValue::Scalar)
        };
        match result {
            Ok(raw) => Some(raw),
            Err(e) => {
                debug!("SNMP read {} failed: {}", oid, e);
                None
            },
        }
    }

    async fn write(&mut self, address: &Address, value: &RawValue, _request: &WriteRequest) -> bool {
        let (Address::Oid(text), RawValue::Scalar(typed)) = (address, value) else {
            warn!("SNMP write needs an OID and a scalar, got {} / {:?}", address, value);
            return false;
        };
        let result = match (Oid::parse(text), ber_from_typed(typed)) {
            (Ok(oid), Ok(ber)) => self.set(&oid, ber).await,
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("SNMP SET {} acknowledged", text);
                true
            },
            Err(e) => {
                warn!("SNMP SET {} failed: {}", text, e);
                false
            },
        }
    }
}
