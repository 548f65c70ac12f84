//! Persistent CDS connection

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::codec::{
    encode_request, read_request, registers, CpState, RegisterAddress, RegisterFrame,
    CMD_BEGIN_STREAM, CMD_END_STREAM, FRAME_LEN, REQUEST_LEN,
};
use crate::endpoint::DeviceEndpoint;
use crate::error::{ProtocolError, Result};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 2000;

const STREAM_CONTROL: RegisterAddress = RegisterAddress::new(0, 0);

/// CDS connection options
#[derive(Debug, Clone)]
pub struct CdsOptions {
    pub connect_timeout: Duration,
    /// Bound on every single request/response exchange
    pub read_timeout: Duration,
}

impl Default for CdsOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

/// Connected CDS unit.
///
/// Exchanges are strictly sequential: every operation takes `&mut self` and
/// completes (or times out) before the next request is written.
///
/// A timed-out exchange leaves its answer (or part of it) on the way, so the
/// responses would trail the requests from then on. The adapter marks itself
/// out of step instead and reconnects before the next request, beginning the
/// stream again if it was streaming.
#[derive(Debug)]
pub struct CdsAdapter {
    endpoint: DeviceEndpoint,
    stream: Option<TcpStream>,
    options: CdsOptions,
    streaming: bool,
    out_of_step: bool,
}

async fn connect(endpoint: &DeviceEndpoint, options: &CdsOptions) -> Result<TcpStream> {
    debug!("CDS connecting: {}", endpoint);

    let stream = match timeout(
        options.connect_timeout,
        TcpStream::connect(endpoint.address()),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("CDS connect {} failed: {}", endpoint, e);
            return Err(ProtocolError::connection(endpoint, e.to_string()));
        },
        Err(_) => {
            warn!("CDS connect {} timed out", endpoint);
            return Err(ProtocolError::connection(
                endpoint,
                format!(
                    "connect timed out after {} ms",
                    options.connect_timeout.as_millis()
                ),
            ));
        },
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!("CDS set_nodelay {}: {}", endpoint, e);
    }
    Ok(stream)
}

impl CdsAdapter {
    pub async fn open(endpoint: &DeviceEndpoint, options: CdsOptions) -> Result<Self> {
        let stream = connect(endpoint, &options).await?;
        info!("CDS connected: {}", endpoint);
        Ok(Self {
            endpoint: endpoint.clone(),
            stream: Some(stream),
            options,
            streaming: false,
            out_of_step: false,
        })
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// True after a timed-out exchange until the next request reconnects
    pub fn is_out_of_step(&self) -> bool {
        self.out_of_step
    }

    /// Ask the unit to start serving register values
    pub async fn begin_stream(&mut self) -> Result<()> {
        let frame = self
            .transact(encode_request(CMD_BEGIN_STREAM, STREAM_CONTROL), "begin stream")
            .await?;
        frame.validate()?;
        self.streaming = true;
        debug!("CDS stream started: {}", self.endpoint);
        Ok(())
    }

    /// Stop the register stream. The adapter counts as not streaming even if
    /// the unit never acknowledges.
    pub async fn end_stream(&mut self) -> Result<()> {
        self.streaming = false;
        let frame = self
            .transact(encode_request(CMD_END_STREAM, STREAM_CONTROL), "end stream")
            .await?;
        frame.validate()?;
        debug!("CDS stream ended: {}", self.endpoint);
        Ok(())
    }

    /// Read one register; non-ACK frames are [`ProtocolError::Decode`]
    pub async fn read_register(&mut self, address: RegisterAddress) -> Result<RegisterFrame> {
        let frame = self.transact(read_request(address), "read").await?;
        frame.validate().map_err(|e| match e {
            ProtocolError::Decode(reason) => {
                ProtocolError::decode(format!("register {}: {}", address, reason))
            },
            other => other,
        })?;
        Ok(frame)
    }

    /// Read a float register. NaN and infinities are rejected as malformed.
    pub async fn read_f32(&mut self, address: RegisterAddress) -> Result<f32> {
        let value = self.read_register(address).await?.decode_f32();
        if !value.is_finite() {
            return Err(ProtocolError::decode(format!(
                "register {}: non-finite value {}",
                address, value
            )));
        }
        Ok(value)
    }

    pub async fn read_cp_state(&mut self) -> Result<CpState> {
        Ok(self.read_register(registers::CP_STATE).await?.decode_cp_state())
    }

    pub async fn close(mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        debug!("CDS closed: {}", self.endpoint);
        Ok(())
    }

    async fn transact(
        &mut self,
        request: [u8; REQUEST_LEN],
        what: &str,
    ) -> Result<RegisterFrame> {
        if self.out_of_step {
            self.resync().await?;
        }
        self.exchange(request, what).await
    }

    /// Replace the connection that may still carry late answers
    async fn resync(&mut self) -> Result<()> {
        warn!("CDS {} out of step after a timeout, reconnecting", self.endpoint);
        if let Some(mut stale) = self.stream.take() {
            if let Err(e) = stale.shutdown().await {
                debug!("CDS close stale {}: {}", self.endpoint, e);
            }
        }

        self.stream = Some(connect(&self.endpoint, &self.options).await?);
        self.out_of_step = false;

        if self.streaming {
            let begun = match self
                .exchange(encode_request(CMD_BEGIN_STREAM, STREAM_CONTROL), "begin stream")
                .await
            {
                Ok(frame) => frame.validate(),
                Err(e) => Err(e),
            };
            if let Err(e) = begun {
                // Try again on the next request
                self.out_of_step = true;
                return Err(e);
            }
        }
        info!("CDS reconnected: {}", self.endpoint);
        Ok(())
    }

    async fn exchange(
        &mut self,
        request: [u8; REQUEST_LEN],
        what: &str,
    ) -> Result<RegisterFrame> {
        let read_timeout = self.options.read_timeout;
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;

        discard_pending(stream, &self.endpoint);

        stream.write_all(&request).await.map_err(|e| {
            ProtocolError::io(format!("{} write to {} failed: {}", what, self.endpoint, e))
        })?;

        let mut buffer = [0u8; FRAME_LEN];
        match timeout(read_timeout, stream.read_exact(&mut buffer)).await {
            Ok(Ok(_)) => {
                debug!("CDS RX {}: {:02X?}", self.endpoint, buffer);
                Ok(RegisterFrame::from_bytes(buffer))
            },
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
                ProtocolError::io(format!("{}: connection closed by {}", what, self.endpoint)),
            ),
            Ok(Err(e)) => Err(ProtocolError::io(format!(
                "{} read from {} failed: {}",
                what, self.endpoint, e
            ))),
            Err(_) => {
                self.out_of_step = true;
                Err(ProtocolError::timeout(format!(
                    "{} on {} timed out after {} ms",
                    what,
                    self.endpoint,
                    read_timeout.as_millis()
                )))
            },
        }
    }
}

/// Drop whatever a late answer to an earlier, timed-out request left behind
fn discard_pending(stream: &mut TcpStream, endpoint: &DeviceEndpoint) {
    let mut scratch = [0u8; 64];
    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => debug!("CDS {} discarded {} stale bytes", endpoint, n),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{unused_endpoint, CdsReply, CdsSimulator};

    fn fast_options() -> CdsOptions {
        CdsOptions {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_stream_and_read() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_value(registers::VOLTAGE_L1, 230.0);

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_options())
            .await
            .unwrap();
        adapter.begin_stream().await.unwrap();
        assert!(adapter.is_streaming());

        let volts = adapter.read_f32(registers::VOLTAGE_L1).await.unwrap();
        assert_eq!(volts, 230.0);

        adapter.end_stream().await.unwrap();
        assert!(!adapter.is_streaming());
        adapter.close().await.unwrap();

        assert_eq!(sim.stream_begins(), 1);
        assert_eq!(sim.stream_ends(), 1);
    }

    #[tokio::test]
    async fn test_nak_is_decode_error() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_reply(registers::REAL_POWER, CdsReply::Nak);

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_options())
            .await
            .unwrap();
        let err = adapter.read_f32(registers::REAL_POWER).await.unwrap_err();
        assert!(err.is_decode());
        assert!(err.to_string().contains("0x08:0x43"));

        // The connection stays usable after a rejected register
        sim.set_value(registers::REAL_POWER, 11.0);
        assert_eq!(adapter.read_f32(registers::REAL_POWER).await.unwrap(), 11.0);
    }

    #[tokio::test]
    async fn test_non_finite_value_rejected() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_value(registers::CURRENT_L1, f32::NAN);

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_options())
            .await
            .unwrap();
        assert!(adapter
            .read_f32(registers::CURRENT_L1)
            .await
            .unwrap_err()
            .is_decode());
    }

    #[tokio::test]
    async fn test_read_timeout_then_recover() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_value(registers::VOLTAGE_L1, 400.0);
        sim.set_response_delay(Duration::from_millis(400));

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_options())
            .await
            .unwrap();
        let err = adapter.read_f32(registers::VOLTAGE_L1).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(adapter.is_out_of_step());

        // Let the late frame arrive, then make sure it is not mistaken for the next answer
        sim.set_response_delay(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(400)).await;
        sim.set_value(registers::VOLTAGE_L1, 231.0);
        assert_eq!(adapter.read_f32(registers::VOLTAGE_L1).await.unwrap(), 231.0);
        assert!(!adapter.is_out_of_step());
    }

    #[tokio::test]
    async fn test_late_answer_never_taken_for_next_register() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_measurements(400.0, 5000.0, 12.0);

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_options())
            .await
            .unwrap();
        adapter.begin_stream().await.unwrap();

        sim.set_response_delay(Duration::from_millis(400));
        let err = adapter.read_f32(registers::VOLTAGE_L1).await.unwrap_err();
        assert!(err.is_timeout());

        // The voltage answer is still on its way when the next request goes out
        sim.set_response_delay(Duration::ZERO);
        assert_eq!(adapter.read_f32(registers::REAL_POWER).await.unwrap(), 5000.0);
        assert_eq!(adapter.read_f32(registers::CURRENT_L1).await.unwrap(), 12.0);
        assert_eq!(adapter.read_f32(registers::VOLTAGE_L1).await.unwrap(), 400.0);

        // One reconnect, with the stream begun again on it
        assert_eq!(sim.accepted_connections(), 2);
        assert_eq!(sim.stream_begins(), 2);
        assert!(adapter.is_streaming());
        adapter.close().await.unwrap();
        assert!(sim.wait_for_idle(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_cp_state() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_reply(
            registers::CP_STATE,
            CdsReply::Raw(RegisterFrame::ack([0x05, 0, 0, 0])),
        );

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_options())
            .await
            .unwrap();
        assert_eq!(adapter.read_cp_state().await.unwrap(), CpState::C2);
    }

    #[tokio::test]
    async fn test_open_refused() {
        let err = CdsAdapter::open(&unused_endpoint(), fast_options())
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }
}
