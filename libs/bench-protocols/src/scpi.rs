//! SCPI over TCP
//!
//! Newline-terminated ASCII commands to the voltage source and the current sink.
//! Many bench instruments never answer set-commands, so by default a quiet
//! device is treated as an acknowledgement rather than a failure
//! ([`ResponsePolicy::AckOrSilenceOk`]).

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::endpoint::DeviceEndpoint;
use crate::error::{ProtocolError, Result};

/// Default TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Default wait for a reply in milliseconds
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Payload reported when the device stayed silent
pub const NO_DATA_RECEIVED: &str = "no data received";

/// Identification query used as a connectivity probe
pub const IDN_QUERY: &str = "*IDN?";

const READ_CHUNK_SIZE: usize = 1024;

/// What a silent device means for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponsePolicy {
    /// Silence (or the peer closing) within the timeout counts as success
    #[default]
    AckOrSilenceOk,
    /// Silence is reported as [`ProtocolError::Timeout`]
    RequireResponse,
}

/// Connection options
#[derive(Debug, Clone)]
pub struct ScpiOptions {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub policy: ResponsePolicy,
}

impl Default for ScpiOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            policy: ResponsePolicy::default(),
        }
    }
}

impl ScpiOptions {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    pub fn with_policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Outcome of one SCPI exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiReply {
    pub succeeded: bool,
    /// Trimmed response text, or [`NO_DATA_RECEIVED`]
    pub payload: String,
}

impl ScpiReply {
    fn data(payload: String) -> Self {
        Self {
            succeeded: true,
            payload,
        }
    }

    fn silent() -> Self {
        Self {
            succeeded: true,
            payload: NO_DATA_RECEIVED.to_string(),
        }
    }

    /// True when the device actually answered
    pub fn has_data(&self) -> bool {
        self.payload != NO_DATA_RECEIVED
    }
}

/// One TCP session with an SCPI instrument
#[derive(Debug)]
pub struct ScpiClient {
    stream: TcpStream,
    endpoint: DeviceEndpoint,
    options: ScpiOptions,
    identity: Option<String>,
}

impl ScpiClient {
    /// Connect and probe the instrument with `*IDN?`.
    ///
    /// An unanswered probe is fine; a refused, unreachable or reset connection
    /// is a [`ProtocolError::Connection`].
    pub async fn connect(endpoint: &DeviceEndpoint, options: ScpiOptions) -> Result<Self> {
        debug!("SCPI connecting: {}", endpoint);

        let stream = match timeout(
            options.connect_timeout,
            TcpStream::connect(endpoint.address()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("SCPI connect {} failed: {}", endpoint, e);
                return Err(ProtocolError::connection(endpoint, e.to_string()));
            },
            Err(_) => {
                warn!("SCPI connect {} timed out", endpoint);
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
            debug!("SCPI set_nodelay {}: {}", endpoint, e);
        }

        let mut client = Self {
            stream,
            endpoint: endpoint.clone(),
            options,
            identity: None,
        };

        // The probe always tolerates silence, whatever the command policy is
        let probe = client
            .exchange(IDN_QUERY, ResponsePolicy::AckOrSilenceOk)
            .await
            .map_err(|e| match e {
                ProtocolError::Io(reason) => ProtocolError::connection(endpoint, reason),
                other => other,
            })?;

        if probe.has_data() {
            info!("SCPI connected: {} ({})", endpoint, probe.payload);
            client.identity = Some(probe.payload);
        } else {
            info!("SCPI connected: {} (no identification)", endpoint);
        }

        Ok(client)
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    /// `*IDN?` answer from the connect probe, if the device gave one
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Send one command and wait for at most one reply chunk
    pub async fn send_command(&mut self, text: &str) -> Result<ScpiReply> {
        let policy = self.options.policy;
        self.exchange(text, policy).await
    }

    /// Shut the socket down. Dropping the client closes it as well.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        debug!("SCPI closed: {}", self.endpoint);
        Ok(())
    }

    async fn exchange(&mut self, text: &str, policy: ResponsePolicy) -> Result<ScpiReply> {
        self.discard_pending();

        debug!("SCPI TX {}: {}", self.endpoint, text);
        let line = format!("{}\n", text);
        if let Err(e) = self.stream.write_all(line.as_bytes()).await {
            warn!("SCPI write {} '{}' failed: {}", self.endpoint, text, e);
            return Err(ProtocolError::io(format!(
                "write '{}' to {} failed: {}",
                text, self.endpoint, e
            )));
        }

        let mut buffer = [0u8; READ_CHUNK_SIZE];
        match timeout(self.options.response_timeout, self.stream.read(&mut buffer)).await {
            Ok(Ok(n)) if n > 0 => {
                let payload = String::from_utf8_lossy(&buffer[..n]).trim().to_string();
                debug!("SCPI RX {}: {}", self.endpoint, payload);
                Ok(ScpiReply::data(payload))
            },
            Ok(Ok(_)) => {
                debug!("SCPI {} closed by peer after '{}'", self.endpoint, text);
                self.silence(text, policy)
            },
            Ok(Err(e)) => match policy {
                ResponsePolicy::AckOrSilenceOk => {
                    debug!("SCPI read {} after '{}': {}", self.endpoint, text, e);
                    Ok(ScpiReply::silent())
                },
                ResponsePolicy::RequireResponse => Err(ProtocolError::io(format!(
                    "read from {} failed: {}",
                    self.endpoint, e
                ))),
            },
            Err(_) => {
                debug!("SCPI {} silent after '{}'", self.endpoint, text);
                self.silence(text, policy)
            },
        }
    }

    fn silence(&self, text: &str, policy: ResponsePolicy) -> Result<ScpiReply> {
        match policy {
            ResponsePolicy::AckOrSilenceOk => Ok(ScpiReply::silent()),
            ResponsePolicy::RequireResponse => Err(ProtocolError::timeout(format!(
                "no response to '{}' from {} within {} ms",
                text,
                self.endpoint,
                self.options.response_timeout.as_millis()
            ))),
        }
    }

    /// Drop bytes a previous, timed-out exchange left in the socket
    fn discard_pending(&mut self) {
        let mut scratch = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => debug!("SCPI {} discarded {} stale bytes", self.endpoint, n),
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{unused_endpoint, ScpiSimulator};
    use tracing_test::traced_test;

    fn fast_options() -> ScpiOptions {
        ScpiOptions::default().with_response_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_connect_reads_identity() {
        let sim = ScpiSimulator::start().await.unwrap();
        let client = ScpiClient::connect(&sim.endpoint(), fast_options())
            .await
            .unwrap();

        assert_eq!(client.identity(), Some(crate::simulator::SCPI_IDENTITY));
        assert_eq!(sim.received(), vec![IDN_QUERY.to_string()]);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_returns_trimmed_payload() {
        let sim = ScpiSimulator::start().await.unwrap();
        sim.respond_to("MEAS:POW?", "5000.0\r\n");

        let mut client = ScpiClient::connect(&sim.endpoint(), fast_options())
            .await
            .unwrap();
        let reply = client.send_command("MEAS:POW?").await.unwrap();

        assert!(reply.succeeded);
        assert!(reply.has_data());
        assert_eq!(reply.payload, "5000.0");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_silent_device_is_success() {
        let sim = ScpiSimulator::start().await.unwrap();
        sim.clear_responses();

        let mut client = ScpiClient::connect(&sim.endpoint(), fast_options())
            .await
            .unwrap();
        assert_eq!(client.identity(), None);

        let reply = client.send_command("OUTP ON").await.unwrap();
        assert_eq!(
            reply,
            ScpiReply {
                succeeded: true,
                payload: NO_DATA_RECEIVED.to_string()
            }
        );
        assert!(!reply.has_data());
        assert!(logs_contain("silent after 'OUTP ON'"));
    }

    #[tokio::test]
    async fn test_require_response_turns_silence_into_timeout() {
        let sim = ScpiSimulator::start().await.unwrap();
        sim.clear_responses();

        let options = fast_options().with_policy(ResponsePolicy::RequireResponse);
        // The probe still tolerates silence
        let mut client = ScpiClient::connect(&sim.endpoint(), options).await.unwrap();

        let err = client.send_command("MEAS:POW?").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let endpoint = unused_endpoint();
        let err = ScpiClient::connect(&endpoint, fast_options())
            .await
            .unwrap_err();
        assert!(err.is_connection(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_commands_arrive_in_order() {
        let sim = ScpiSimulator::start().await.unwrap();
        let mut client = ScpiClient::connect(&sim.endpoint(), fast_options())
            .await
            .unwrap();

        client.send_command("SOUR:FUNC CURR").await.unwrap();
        client.send_command("SOUR:CURR 12").await.unwrap();

        assert_eq!(
            sim.received(),
            vec!["*IDN?", "SOUR:FUNC CURR", "SOUR:CURR 12"]
        );
    }
}
