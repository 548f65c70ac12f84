//! In-process TCP device simulators for testing
//!
//! Stand-ins for the SCPI instruments and the CDS unit. Both bind an ephemeral
//! port on 127.0.0.1 and count the connections they see, so tests can assert
//! that no socket was leaked.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cds::codec::{
    registers, RegisterAddress, RegisterFrame, CMD_BEGIN_STREAM, CMD_END_STREAM, CMD_READ,
    REQUEST_LEN,
};
use crate::endpoint::DeviceEndpoint;
use crate::scpi::IDN_QUERY;

/// `*IDN?` answer of a freshly started [`ScpiSimulator`]
pub const SCPI_IDENTITY: &str = "BENCH-SIM,SCPI,0,1.0";

/// Endpoint on 127.0.0.1 with nothing listening
pub fn unused_endpoint() -> DeviceEndpoint {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(1);
    DeviceEndpoint::new("127.0.0.1", port)
}

#[derive(Default)]
struct ConnectionCounters {
    accepted: AtomicUsize,
    open: AtomicUsize,
}

impl ConnectionCounters {
    fn opened(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }

    async fn wait_for_idle(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.open.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ============================================================================
// SCPI
// ============================================================================

#[derive(Default)]
struct ScpiState {
    responses: Mutex<HashMap<String, String>>,
    received: Mutex<Vec<String>>,
    connections: ConnectionCounters,
}

/// Line-oriented SCPI instrument. Commands without a configured response get
/// no answer at all, like a real source acknowledging a set-command.
pub struct ScpiSimulator {
    addr: SocketAddr,
    state: Arc<ScpiState>,
    accept_task: JoinHandle<()>,
}

impl ScpiSimulator {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        info!("SCPI simulator listening on {}", addr);

        let state = Arc::new(ScpiState::default());
        state
            .responses
            .lock()
            .insert(IDN_QUERY.to_string(), SCPI_IDENTITY.to_string());

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("SCPI simulator: connection from {}", peer);
                        accept_state.connections.opened();
                        let conn_state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_scpi(stream, &conn_state).await {
                                debug!("SCPI simulator: connection error: {}", e);
                            }
                            conn_state.connections.closed();
                        });
                    },
                    Err(e) => {
                        error!("SCPI simulator: accept error: {}", e);
                        break;
                    },
                }
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::new("127.0.0.1", self.addr.port())
    }

    /// Answer `command` (exact, trimmed match) with `reply`
    pub fn respond_to(&self, command: &str, reply: &str) {
        self.state
            .responses
            .lock()
            .insert(command.to_string(), reply.to_string());
    }

    /// Go fully silent, including `*IDN?`
    pub fn clear_responses(&self) {
        self.state.responses.lock().clear();
    }

    /// Every command line received so far, across all connections
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.connections.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.connections.open.load(Ordering::SeqCst)
    }

    /// Wait until every client connection is closed
    pub async fn wait_for_idle(&self, within: Duration) -> bool {
        self.state.connections.wait_for_idle(within).await
    }
}

impl Drop for ScpiSimulator {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_scpi(stream: TcpStream, state: &ScpiState) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let command = line.trim().to_string();
        if command.is_empty() {
            continue;
        }

        let reply = state.responses.lock().get(&command).cloned();
        state.received.lock().push(command);

        if let Some(reply) = reply {
            writer.write_all(reply.as_bytes()).await?;
            if !reply.ends_with('\n') {
                writer.write_all(b"\n").await?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// CDS
// ============================================================================

/// How the CDS simulator answers a register read
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CdsReply {
    /// ACK frame with the value in wire byte order
    Value(f32),
    /// Exact frame bytes
    Raw(RegisterFrame),
    Nak,
    /// No answer at all
    Silent,
}

#[derive(Default)]
struct CdsState {
    registers: Mutex<HashMap<RegisterAddress, CdsReply>>,
    response_delay: Mutex<Duration>,
    stream_begins: AtomicUsize,
    stream_ends: AtomicUsize,
    reads: AtomicUsize,
    connections: ConnectionCounters,
}

/// CDS register server. Unknown registers are answered with NAK.
pub struct CdsSimulator {
    addr: SocketAddr,
    state: Arc<CdsState>,
    accept_task: JoinHandle<()>,
}

impl CdsSimulator {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        info!("CDS simulator listening on {}", addr);

        let state = Arc::new(CdsState::default());

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("CDS simulator: connection from {}", peer);
                        accept_state.connections.opened();
                        let conn_state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_cds(stream, &conn_state).await {
                                debug!("CDS simulator: connection error: {}", e);
                            }
                            conn_state.connections.closed();
                        });
                    },
                    Err(e) => {
                        error!("CDS simulator: accept error: {}", e);
                        break;
                    },
                }
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn set_value(&self, address: RegisterAddress, value: f32) {
        self.set_reply(address, CdsReply::Value(value));
    }

    pub fn set_reply(&self, address: RegisterAddress, reply: CdsReply) {
        self.state.registers.lock().insert(address, reply);
    }

    /// Voltage, real power and current of line 1
    pub fn set_measurements(&self, voltage: f32, power: f32, current: f32) {
        let mut map = self.state.registers.lock();
        map.insert(registers::VOLTAGE_L1, CdsReply::Value(voltage));
        map.insert(registers::REAL_POWER, CdsReply::Value(power));
        map.insert(registers::CURRENT_L1, CdsReply::Value(current));
    }

    /// Delay applied before every answer, begin/end stream included
    pub fn set_response_delay(&self, delay: Duration) {
        *self.state.response_delay.lock() = delay;
    }

    pub fn stream_begins(&self) -> usize {
        self.state.stream_begins.load(Ordering::SeqCst)
    }

    pub fn stream_ends(&self) -> usize {
        self.state.stream_ends.load(Ordering::SeqCst)
    }

    pub fn register_reads(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.connections.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.connections.open.load(Ordering::SeqCst)
    }

    pub async fn wait_for_idle(&self, within: Duration) -> bool {
        self.state.connections.wait_for_idle(within).await
    }
}

impl Drop for CdsSimulator {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_cds(mut stream: TcpStream, state: &CdsState) -> std::io::Result<()> {
    let mut request = [0u8; REQUEST_LEN];

    loop {
        match stream.read_exact(&mut request).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let delay = *state.response_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let address = RegisterAddress::new(request[1], request[2]);
        let reply = match request[0] {
            CMD_BEGIN_STREAM => {
                state.stream_begins.fetch_add(1, Ordering::SeqCst);
                Some(RegisterFrame::ack([0; 4]))
            },
            CMD_END_STREAM => {
                state.stream_ends.fetch_add(1, Ordering::SeqCst);
                Some(RegisterFrame::ack([0; 4]))
            },
            CMD_READ => {
                state.reads.fetch_add(1, Ordering::SeqCst);
                let configured = state.registers.lock().get(&address).copied();
                match configured {
                    Some(CdsReply::Value(value)) => Some(RegisterFrame::ack_f32(value)),
                    Some(CdsReply::Raw(frame)) => Some(frame),
                    Some(CdsReply::Silent) => None,
                    Some(CdsReply::Nak) | None => Some(RegisterFrame::nak()),
                }
            },
            other => {
                debug!("CDS simulator: unknown command 0x{:02X}", other);
                Some(RegisterFrame::nak())
            },
        };

        if let Some(frame) = reply {
            stream.write_all(frame.as_bytes()).await?;
        }
    }
}
