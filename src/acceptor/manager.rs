//! Session manager: at most one acceptance session per serial port.
//!
//! Start and stop take the registry exclusively for their whole duration, so
//! a second start or stop issued while one is in flight fails fast with
//! `DeviceBusy` instead of queueing behind a multi-second device bring-up.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::ledger::LedgerSnapshot;
use super::session::{NoteInventory, Session, SessionHandle, SessionStatus, SessionSummary};
use super::transport::{create_serial_transport, Transport};
use crate::config::AcceptorConfig;
use crate::error::{AcceptorError, Result};
use crate::notifier::EventNotifier;

/// Builds the transport for a new session.
pub type TransportFactory = Arc<dyn Fn(&AcceptorConfig) -> Box<dyn Transport> + Send + Sync>;

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    factory: TransportFactory,
    notifier: Arc<dyn EventNotifier>,
}

impl SessionManager {
    /// Manager driving real serial SSP devices.
    pub fn new(notifier: Arc<dyn EventNotifier>) -> Self {
        Self::with_factory(Arc::new(create_serial_transport), notifier)
    }

    pub fn with_factory(factory: TransportFactory, notifier: Arc<dyn EventNotifier>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            notifier,
        }
    }

    /// Start a session on `config.serial.port`.
    ///
    /// A live session on the port is `SessionAlreadyRunning`; a dead one
    /// (failed recovery) is stopped and replaced.
    pub async fn start_session(&self, config: AcceptorConfig, operator_id: &str) -> Result<Uuid> {
        if operator_id.trim().is_empty() {
            return Err(AcceptorError::Config("operator id is required".into()));
        }
        let mut sessions = self.busy_guard()?;
        let port = config.serial.port.clone();

        if let Some(existing) = sessions.get(&port) {
            if existing.poll_status().is_alive() {
                return Err(AcceptorError::SessionAlreadyRunning { port });
            }
        }
        if let Some(dead) = sessions.remove(&port) {
            warn!(port = %port, session_id = %dead.id(), "Replacing dead session");
            if let Err(e) = dead.stop().await {
                warn!(port = %port, error = %e, "Stopping dead session failed");
            }
        }

        let transport = (self.factory)(&config);
        let session = Session::start(config, operator_id, transport, self.notifier.clone()).await?;
        let id = session.id();
        sessions.insert(port.clone(), session);
        info!(port = %port, session_id = %id, "Session registered");
        Ok(id)
    }

    pub async fn stop_session(&self, port: &str) -> Result<SessionSummary> {
        let mut sessions = self.busy_guard()?;
        let session = sessions
            .remove(port)
            .ok_or_else(|| AcceptorError::SessionNotRunning { port: port.to_string() })?;
        session.stop().await
    }

    pub async fn status(&self, port: &str) -> Option<SessionStatus> {
        self.sessions.lock().await.get(port).map(Session::poll_status)
    }

    pub async fn ledger(&self, port: &str) -> Result<LedgerSnapshot> {
        self.handle(port).await?.ledger().await
    }

    pub async fn note_inventory(&self, port: &str) -> Result<NoteInventory> {
        self.handle(port).await?.note_inventory().await
    }

    pub async fn active_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Stop every session; used on process exit.
    pub async fn shutdown(&self) -> Vec<SessionSummary> {
        let mut sessions = self.sessions.lock().await;
        let mut summaries = Vec::with_capacity(sessions.len());
        for (port, session) in sessions.drain() {
            match session.stop().await {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(port = %port, error = %e, "Stopping session on shutdown failed"),
            }
        }
        info!(stopped = summaries.len(), "Session manager shut down");
        summaries
    }

    fn busy_guard(&self) -> Result<tokio::sync::MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .try_lock()
            .map_err(|_| AcceptorError::DeviceBusy("another session start or stop is in progress".into()))
    }

    /// Query handle for the session on `port`. The registry lock is released
    /// before the caller waits on the sequencer.
    async fn handle(&self, port: &str) -> Result<SessionHandle> {
        self.sessions
            .lock()
            .await
            .get(port)
            .map(Session::handle)
            .ok_or_else(|| AcceptorError::SessionNotRunning { port: port.to_string() })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
