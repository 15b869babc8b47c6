//! Transport layer for the note acceptor.
//!
//! Defines the `Transport` trait (an opaque command/response channel keyed by
//! command) and `SspSerialTransport`, the plain-SSP implementation over a
//! COM/USB-serial port using the `serialport` crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::event::DeviceEvent;
use super::ssp;
use crate::config::AcceptorConfig;
use crate::error::{AcceptorError, Result};

// ---------------------------------------------------------------------------
// Commands and responses
// ---------------------------------------------------------------------------

/// Where an accepted note of a given value ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteRoute {
    /// Kept in the payout store for change.
    Payout,
    Cashbox,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sync,
    HostProtocolVersion(u8),
    Poll,
    Enable,
    Disable,
    GetSerialNumber,
    PayoutAmount {
        amount: u32,
        country_code: String,
    },
    EmptyAll,
    GetDenominationRoute {
        value: u32,
        country_code: String,
    },
    SetDenominationRoute {
        value: u32,
        route: NoteRoute,
        country_code: String,
    },
    FloatAmount {
        min_payout: u16,
        amount: u32,
        country_code: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::HostProtocolVersion(_) => "HOST_PROTOCOL_VERSION",
            Self::Poll => "POLL",
            Self::Enable => "ENABLE",
            Self::Disable => "DISABLE",
            Self::GetSerialNumber => "GET_SERIAL_NUMBER",
            Self::PayoutAmount { .. } => "PAYOUT_AMOUNT",
            Self::EmptyAll => "EMPTY_ALL",
            Self::GetDenominationRoute { .. } => "GET_DENOMINATION_ROUTE",
            Self::SetDenominationRoute { .. } => "SET_DENOMINATION_ROUTE",
            Self::FloatAmount { .. } => "FLOAT_AMOUNT",
        }
    }
}

/// Generic response status reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Ok,
    CommandNotKnown,
    WrongParameterCount,
    ParameterOutOfRange,
    CannotProcess,
    SoftwareError,
    Fail,
    KeyNotSet,
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseInfo {
    None,
    Events(Vec<DeviceEvent>),
    SerialNumber(u32),
    Route(NoteRoute),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub info: ResponseInfo,
}

impl CommandResponse {
    pub fn ok(info: ResponseInfo) -> Self {
        Self {
            status: ResponseStatus::Ok,
            info,
        }
    }

    pub fn with_status(status: ResponseStatus) -> Self {
        Self {
            status,
            info: ResponseInfo::None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Opaque request/response channel to the acceptor.
///
/// Implementations bound each `command` by their own response timeout and
/// report it as `DeviceTimeout`.
#[async_trait]
pub trait Transport: Send {
    /// Open the link and perform any handshake.
    async fn open(&mut self, port: &str, baud_rate: u32) -> Result<()>;

    /// Send one command and wait for its single response.
    async fn command(&mut self, command: Command) -> Result<CommandResponse>;

    /// Release the link. Closing a closed transport is not an error.
    async fn close(&mut self) -> Result<()>;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Serial SSP transport
// ---------------------------------------------------------------------------

/// Connection state for the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connected,
    Error,
}

/// Open port handle, shared with the blocking worker of an in-flight
/// exchange so that abandoning the exchange never loses the handle.
type SharedPort = Arc<Mutex<Box<dyn serialport::SerialPort>>>;

/// Plain SSP over a serial port (9600 8N2 by default on NV200 units).
pub struct SspSerialTransport {
    address: u8,
    timeout: Duration,
    port_name: String,
    baud_rate: u32,
    port: Option<SharedPort>,
    seq: bool,
    state: TransportState,
}

impl SspSerialTransport {
    pub fn new(address: u8, timeout: Duration) -> Self {
        Self {
            address,
            timeout,
            port_name: String::new(),
            baud_rate: 0,
            port: None,
            seq: true,
            state: TransportState::Disconnected,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    async fn exchange(&mut self, command: &Command) -> Result<CommandResponse> {
        let name = command.name();
        let port = self
            .port
            .clone()
            .ok_or(AcceptorError::DeviceNotReady { command: name })?;

        let frame = ssp::encode_frame(self.address, self.seq, &ssp::encode_command(command));
        let address = self.address;
        let timeout = self.timeout;

        // Stays Error if this future is dropped before the reply is in.
        self.state = TransportState::Error;
        let reply = tokio::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| AcceptorError::protocol(name, "serial port lock poisoned"))?;
            write_and_read_frame(port.as_mut(), &frame, address, timeout, name)
        })
        .await
        .map_err(|e| AcceptorError::protocol(name, format!("serial worker failed: {e}")))??;

        self.seq = !self.seq;
        self.state = TransportState::Connected;
        ssp::decode_response(command, &reply.data)
    }
}

/// Blocking half of one exchange: write the frame, then read until one
/// complete frame for our address arrives or the deadline passes.
fn write_and_read_frame(
    port: &mut dyn serialport::SerialPort,
    frame: &[u8],
    address: u8,
    timeout: Duration,
    command: &'static str,
) -> Result<ssp::Frame> {
    let io_err = |e: std::io::Error| AcceptorError::protocol(command, format!("serial I/O: {e}"));

    let _ = port.clear(serialport::ClearBuffer::Input);
    debug!("SSP TX ({} bytes): {:02X?}", frame.len(), frame);
    port.write_all(frame).map_err(io_err)?;
    port.flush().map_err(io_err)?;

    let deadline = Instant::now() + timeout;
    let mut decoder = ssp::FrameDecoder::new();
    let mut buf = [0u8; 64];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(AcceptorError::DeviceTimeout {
                command,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        port.set_timeout(deadline - now).map_err(|e| {
            AcceptorError::protocol(command, format!("set timeout: {e}"))
        })?;

        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(io_err(e)),
        };

        for &byte in &buf[..n] {
            match decoder.push(byte) {
                Some(Ok(reply)) if reply.address == address => {
                    debug!("SSP RX ({} bytes): {:02X?}", reply.data.len(), reply.data);
                    return Ok(reply);
                }
                Some(Ok(reply)) => {
                    debug!(address = reply.address, "Ignoring SSP frame for another address");
                }
                Some(Err(e)) => return Err(AcceptorError::protocol(command, e)),
                None => {}
            }
        }
    }
}

#[async_trait]
impl Transport for SspSerialTransport {
    async fn open(&mut self, port: &str, baud_rate: u32) -> Result<()> {
        if self.port.is_some() {
            self.close().await?;
        }
        self.port_name = port.to_string();
        self.baud_rate = baud_rate;
        info!("Opening serial port {} @ {} baud", port, baud_rate);

        let builder = serialport::new(port, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::Two)
            .timeout(self.timeout);
        let opened = tokio::task::spawn_blocking(move || builder.open())
            .await
            .map_err(|e| AcceptorError::DeviceUnreachable {
                port: port.to_string(),
                reason: format!("open worker failed: {e}"),
            })?;
        let serial = opened.map_err(|e| {
            self.state = TransportState::Error;
            AcceptorError::DeviceUnreachable {
                port: port.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.port = Some(Arc::new(Mutex::new(serial)));
        self.seq = true;

        // SYNC resets the sequence flag on the device side; the protocol
        // version fixes the poll event layout.
        for handshake in [Command::Sync, Command::HostProtocolVersion(ssp::PROTOCOL_VERSION)] {
            let resp = match self.exchange(&handshake).await {
                Ok(resp) => resp,
                Err(e) => {
                    let _ = self.close().await;
                    return Err(e);
                }
            };
            if !resp.is_ok() {
                let _ = self.close().await;
                return Err(AcceptorError::protocol(
                    handshake.name(),
                    format!("status {:?}", resp.status),
                ));
            }
        }

        self.state = TransportState::Connected;
        info!("Serial port {} connected (SSP v{})", port, ssp::PROTOCOL_VERSION);
        Ok(())
    }

    async fn command(&mut self, command: Command) -> Result<CommandResponse> {
        self.exchange(&command).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            info!("Serial port {} disconnected", self.port_name);
        } else if self.state == TransportState::Error {
            warn!("Serial port {} closed after an I/O error", self.port_name);
        }
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn description(&self) -> String {
        format!("SSP({}@{})", self.port_name, self.baud_rate)
    }
}

/// Serial SSP transport for the configured slave address and timeout.
pub fn create_serial_transport(config: &AcceptorConfig) -> Box<dyn Transport> {
    Box::new(SspSerialTransport::new(
        config.device_address,
        config.command_timeout(),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
