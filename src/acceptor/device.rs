//! Device session primitives.
//!
//! `Device` owns the transport and tracks whether the link is closed, open or
//! enabled. Every primitive is bounded by the configured command timeout,
//! maps a non-OK device status to `DeviceProtocol`, and refuses commands the
//! current state cannot serve with `DeviceNotReady`.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::event::DeviceEvent;
use super::transport::{Command, CommandResponse, NoteRoute, ResponseInfo, Transport};
use crate::config::AcceptorConfig;
use crate::error::{AcceptorError, Result};

/// Slack on top of the transport's own timeout so the transport reports its
/// timeout first when it can.
const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// OPEN covers the port open plus the SYNC and protocol-version handshake.
const OPEN_TIMEOUT_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Closed,
    Open,
    Enabled,
}

pub struct Device {
    transport: Box<dyn Transport>,
    port: String,
    baud_rate: u32,
    country_code: String,
    timeout: Duration,
    state: DeviceState,
}

async fn bounded<T>(
    command: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout + TIMEOUT_GRACE, fut).await {
        Ok(result) => result,
        Err(_) => Err(AcceptorError::DeviceTimeout {
            command,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

impl Device {
    pub fn new(transport: Box<dyn Transport>, config: &AcceptorConfig) -> Self {
        Self {
            transport,
            port: config.serial.port.clone(),
            baud_rate: config.serial.baud_rate,
            country_code: config.country_code.clone(),
            timeout: config.command_timeout(),
            state: DeviceState::Closed,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    pub async fn open(&mut self) -> Result<()> {
        let timeout = self.timeout * OPEN_TIMEOUT_FACTOR;
        let port = self.port.clone();
        let result = bounded("OPEN", timeout, self.transport.open(&port, self.baud_rate)).await;
        match result {
            Ok(()) => {
                self.state = DeviceState::Open;
                info!(port = %self.port, transport = %self.transport.description(), "Device opened");
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Closed;
                warn!(port = %self.port, error = %e, "Device open failed");
                Err(e)
            }
        }
    }

    pub async fn enable(&mut self) -> Result<()> {
        self.execute(Command::Enable, DeviceState::Open).await?;
        self.state = DeviceState::Enabled;
        Ok(())
    }

    pub async fn disable(&mut self) -> Result<()> {
        self.execute(Command::Disable, DeviceState::Open).await?;
        self.state = DeviceState::Open;
        Ok(())
    }

    /// Release the link. The state is `Closed` afterwards even if the
    /// transport reported an error.
    pub async fn close(&mut self) -> Result<()> {
        let timeout = self.timeout;
        let result = bounded("CLOSE", timeout, self.transport.close()).await;
        self.state = DeviceState::Closed;
        match &result {
            Ok(()) => debug!(port = %self.port, "Device closed"),
            Err(e) => warn!(port = %self.port, error = %e, "Device close reported an error"),
        }
        result
    }

    /// One POLL. Events come back in device order.
    pub async fn poll(&mut self) -> Result<Vec<DeviceEvent>> {
        let response = self.execute(Command::Poll, DeviceState::Enabled).await?;
        match response.info {
            ResponseInfo::Events(events) => Ok(events),
            ResponseInfo::None => Ok(Vec::new()),
            other => Err(AcceptorError::protocol(
                "POLL",
                format!("unexpected response payload {other:?}"),
            )),
        }
    }

    pub async fn get_serial_number(&mut self) -> Result<String> {
        let response = self
            .execute(Command::GetSerialNumber, DeviceState::Enabled)
            .await?;
        match response.info {
            ResponseInfo::SerialNumber(serial) => Ok(serial.to_string()),
            other => Err(AcceptorError::protocol(
                "GET_SERIAL_NUMBER",
                format!("unexpected response payload {other:?}"),
            )),
        }
    }

    pub async fn payout(&mut self, amount: u32) -> Result<()> {
        let command = Command::PayoutAmount {
            amount,
            country_code: self.country_code.clone(),
        };
        self.execute(command, DeviceState::Enabled).await?;
        info!(amount, "Payout requested");
        Ok(())
    }

    pub async fn empty_cashbox(&mut self) -> Result<()> {
        self.execute(Command::EmptyAll, DeviceState::Enabled).await?;
        info!("Payout store emptied to cashbox");
        Ok(())
    }

    /// Keep `amount` in the payout store, paying the rest to the cashbox, in
    /// notes no smaller than `min_payout`.
    pub async fn float_amount(&mut self, min_payout: u16, amount: u32) -> Result<()> {
        let command = Command::FloatAmount {
            min_payout,
            amount,
            country_code: self.country_code.clone(),
        };
        self.execute(command, DeviceState::Enabled).await?;
        info!(min_payout, amount, "Float requested");
        Ok(())
    }

    pub async fn get_denomination_route(&mut self, value: u32) -> Result<NoteRoute> {
        let command = Command::GetDenominationRoute {
            value,
            country_code: self.country_code.clone(),
        };
        let response = self.execute(command, DeviceState::Enabled).await?;
        match response.info {
            ResponseInfo::Route(route) => Ok(route),
            other => Err(AcceptorError::protocol(
                "GET_DENOMINATION_ROUTE",
                format!("unexpected response payload {other:?}"),
            )),
        }
    }

    pub async fn set_denomination_route(&mut self, value: u32, route: NoteRoute) -> Result<()> {
        let command = Command::SetDenominationRoute {
            value,
            route,
            country_code: self.country_code.clone(),
        };
        self.execute(command, DeviceState::Enabled).await?;
        info!(value, ?route, "Denomination route set");
        Ok(())
    }

    /// Send `command` if the device is at least in `requires`, bounded by the
    /// command timeout. Non-OK status is an error.
    async fn execute(&mut self, command: Command, requires: DeviceState) -> Result<CommandResponse> {
        let name = command.name();
        if !self.satisfies(requires) {
            debug!(command = name, state = ?self.state, "Command refused in current state");
            return Err(AcceptorError::DeviceNotReady { command: name });
        }

        let timeout = self.timeout;
        let response = match bounded(name, timeout, self.transport.command(command)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(command = name, port = %self.port, error = %e, "Device command failed");
                return Err(e);
            }
        };

        if !response.is_ok() {
            warn!(command = name, status = ?response.status, "Device rejected command");
            return Err(AcceptorError::protocol(
                name,
                format!("status {:?}", response.status),
            ));
        }
        debug!(command = name, "Device command ok");
        Ok(response)
    }

    fn satisfies(&self, requires: DeviceState) -> bool {
        match requires {
            DeviceState::Closed => true,
            DeviceState::Open => self.state != DeviceState::Closed,
            DeviceState::Enabled => self.state == DeviceState::Enabled,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
