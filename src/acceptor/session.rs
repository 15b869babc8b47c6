//! Acceptance session.
//!
//! A `Session` is a handle to one sequencer task that owns the device, the
//! ledger and the reset bookkeeping. The sequencer serialises everything that
//! touches the device: poll ticks, dispatch of their events, caller commands
//! and reset episodes. Callers talk to it through a command channel and read
//! its status through a watch channel; nothing is shared behind a lock.
//!
//! Stopping cancels the loop at the next safe boundary. An in-flight tick is
//! always finished (and its credits counted) before the transport is closed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::denomination::DenominationCatalog;
use super::device::{Device, DeviceState};
use super::event::DeviceEvent;
use super::handler::{self, DeviceAction, TransactionState};
use super::ledger::{LedgerEntry, LedgerSnapshot};
use super::recovery::{EpisodeOutcome, RecoveryController};
use super::transport::{NoteRoute, Transport};
use crate::config::AcceptorConfig;
use crate::error::{AcceptorError, Result};
use crate::notifier::{EventNotifier, Notification, NotifierQueue};

const COMMAND_QUEUE_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Resetting,
    /// A reset episode exhausted its retries; the transport is closed and
    /// polling has stopped. Only `stop` is useful from here.
    Failed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub consecutive_poll_failures: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub current_note_channel: Option<u8>,
    pub total_value: u64,
}

impl SessionStatus {
    fn running() -> Self {
        Self {
            state: SessionState::Running,
            consecutive_poll_failures: 0,
            last_poll_at: None,
            last_error: None,
            current_note_channel: None,
            total_value: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Resetting)
    }
}

/// Returned by `stop` and sent as the final notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub operator_id: String,
    pub port: String,
    pub total_value: u64,
    pub entries: BTreeMap<String, LedgerEntry>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

/// Route of one catalog denomination as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum RouteState {
    Routed(NoteRoute),
    /// The device answered with a non-OK status.
    Unavailable(String),
    Error(String),
}

/// Label -> route for every catalog denomination.
pub type NoteInventory = BTreeMap<String, RouteState>;

enum SessionCommand {
    SerialNumber(oneshot::Sender<Result<String>>),
    Payout {
        amount: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    EmptyCashbox(oneshot::Sender<Result<()>>),
    FloatAmount {
        min_payout: u16,
        amount: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    GetRoute {
        value: u32,
        reply: oneshot::Sender<Result<NoteRoute>>,
    },
    SetRoute {
        value: u32,
        route: NoteRoute,
        reply: oneshot::Sender<Result<()>>,
    },
    NoteInventory(oneshot::Sender<Result<NoteInventory>>),
    Ledger(oneshot::Sender<LedgerSnapshot>),
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

pub struct Session {
    id: Uuid,
    operator_id: String,
    port: String,
    cancel: CancellationToken,
    handle: SessionHandle,
    task: Option<JoinHandle<SessionSummary>>,
}

/// Cheap clone of a running session's query side. Requests queue behind the
/// sequencer and fail with `SessionClosed` once it has stopped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl Session {
    /// Bring the device up and start polling.
    ///
    /// Fails with `DeviceStartFailed` once the start retries are exhausted;
    /// in that case the transport is closed and no task is left behind.
    pub async fn start(
        config: AcceptorConfig,
        operator_id: impl Into<String>,
        transport: Box<dyn Transport>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Result<Session> {
        config.validate()?;
        let operator_id = operator_id.into();
        let id = Uuid::new_v4();
        let port = config.serial.port.clone();
        info!(
            session_id = %id,
            operator_id = %operator_id,
            port = %port,
            baud_rate = config.serial.baud_rate,
            country_code = %config.country_code,
            "Starting acceptance session"
        );

        let catalog = DenominationCatalog::from_specs(&config.denominations);
        let mut device = Device::new(transport, &config);
        let mut recovery = RecoveryController::new(&config);
        let cancel = CancellationToken::new();

        let startup_events = match recovery.start(&mut device, &cancel).await {
            Ok(events) => events,
            Err(e) => {
                if device.state() != DeviceState::Closed {
                    let _ = device.close().await;
                }
                error!(session_id = %id, port = %port, error = %e, "Session start failed");
                return Err(e);
            }
        };

        let (status_tx, status_rx) = watch::channel(SessionStatus::running());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let sequencer = Sequencer {
            id,
            operator_id: operator_id.clone(),
            started_at: Utc::now(),
            poll_interval: config.poll_interval(),
            drain_timeout: config.notifier_drain_timeout(),
            tx: TransactionState::new(&catalog),
            catalog,
            device,
            recovery,
            notifier: NotifierQueue::spawn(notifier),
            status: status_tx,
            commands: command_rx,
            cancel: cancel.clone(),
            failed: false,
        };
        let task = tokio::spawn(sequencer.run(startup_events));
        info!(session_id = %id, "Session running");

        Ok(Session {
            id,
            operator_id,
            port,
            cancel,
            handle: SessionHandle {
                commands: command_tx,
                status: status_rx,
            },
            task: Some(task),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn poll_status(&self) -> SessionStatus {
        self.handle.poll_status()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stop polling, disable and close the device, emit the final
    /// notification and return the ledger.
    pub async fn stop(mut self) -> Result<SessionSummary> {
        info!(session_id = %self.id, "Stopping acceptance session");
        self.cancel.cancel();
        let task = self.task.take().ok_or(AcceptorError::SessionClosed)?;
        task.await.map_err(|e| {
            error!(session_id = %self.id, error = %e, "Session task ended abnormally");
            AcceptorError::SessionClosed
        })
    }

    pub async fn ledger(&self) -> Result<LedgerSnapshot> {
        self.handle.ledger().await
    }

    pub async fn serial_number(&self) -> Result<String> {
        self.handle.serial_number().await
    }

    pub async fn payout(&self, amount: u32) -> Result<()> {
        self.handle.payout(amount).await
    }

    pub async fn empty_cashbox(&self) -> Result<()> {
        self.handle.empty_cashbox().await
    }

    pub async fn float_amount(&self, min_payout: u16, amount: u32) -> Result<()> {
        self.handle.float_amount(min_payout, amount).await
    }

    pub async fn denomination_route(&self, value: u32) -> Result<NoteRoute> {
        self.handle.denomination_route(value).await
    }

    pub async fn set_denomination_route(&self, value: u32, route: NoteRoute) -> Result<()> {
        self.handle.set_denomination_route(value, route).await
    }

    pub async fn note_inventory(&self) -> Result<NoteInventory> {
        self.handle.note_inventory().await
    }
}

impl SessionHandle {
    pub fn poll_status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub async fn ledger(&self) -> Result<LedgerSnapshot> {
        self.request(SessionCommand::Ledger).await
    }

    pub async fn serial_number(&self) -> Result<String> {
        self.request(SessionCommand::SerialNumber).await?
    }

    pub async fn payout(&self, amount: u32) -> Result<()> {
        self.request(|reply| SessionCommand::Payout { amount, reply })
            .await?
    }

    pub async fn empty_cashbox(&self) -> Result<()> {
        self.request(SessionCommand::EmptyCashbox).await?
    }

    pub async fn float_amount(&self, min_payout: u16, amount: u32) -> Result<()> {
        self.request(|reply| SessionCommand::FloatAmount {
            min_payout,
            amount,
            reply,
        })
        .await?
    }

    pub async fn denomination_route(&self, value: u32) -> Result<NoteRoute> {
        self.request(|reply| SessionCommand::GetRoute { value, reply })
            .await?
    }

    pub async fn set_denomination_route(&self, value: u32, route: NoteRoute) -> Result<()> {
        self.request(|reply| SessionCommand::SetRoute { value, route, reply })
            .await?
    }

    pub async fn note_inventory(&self) -> Result<NoteInventory> {
        self.request(SessionCommand::NoteInventory).await?
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| AcceptorError::SessionClosed)?;
        rx.await.map_err(|_| AcceptorError::SessionClosed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.task.is_some() {
            debug!(session_id = %self.id, "Session dropped without stop; cancelling");
            self.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

/// Where a batch of events came from. Resets reported while the device is
/// being (re)started are forwarded but do not start another episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Startup,
    Poll,
    Restart,
}

#[derive(Debug, Default)]
struct FollowUp {
    recover: bool,
    re_enable: bool,
}

struct Sequencer {
    id: Uuid,
    operator_id: String,
    started_at: DateTime<Utc>,
    poll_interval: Duration,
    drain_timeout: Duration,
    catalog: DenominationCatalog,
    tx: TransactionState,
    device: Device,
    recovery: RecoveryController,
    notifier: NotifierQueue,
    status: watch::Sender<SessionStatus>,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
    /// Recovery gave up; no more ticks.
    failed: bool,
}

impl Sequencer {
    async fn run(mut self, startup_events: Vec<DeviceEvent>) -> SessionSummary {
        let follow = self.apply(startup_events, Origin::Startup);
        if follow.re_enable {
            self.re_enable().await;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                _ = ticker.tick(), if !self.failed => {
                    if self.tick().await {
                        ticker.reset();
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// One poll plus dispatch. Returns true when a reset episode brought the
    /// device back and the ticker should be re-armed.
    async fn tick(&mut self) -> bool {
        let events = match self.device.poll().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Poll failed; retrying on next tick");
                self.status.send_modify(|s| {
                    s.consecutive_poll_failures += 1;
                    s.last_error = Some(e.to_string());
                });
                return false;
            }
        };
        self.status.send_modify(|s| {
            s.consecutive_poll_failures = 0;
            s.last_poll_at = Some(Utc::now());
            s.last_error = None;
        });

        let follow = self.apply(events, Origin::Poll);
        if follow.recover {
            if let Some(rearm) = self.recover().await {
                return rearm;
            }
        }
        if follow.re_enable {
            self.re_enable().await;
        }
        false
    }

    /// Run every event through the handler in order and queue its
    /// notification. Device follow-ups are collected, not executed.
    fn apply(&mut self, events: Vec<DeviceEvent>, origin: Origin) -> FollowUp {
        let mut follow = FollowUp::default();
        for event in &events {
            let dispatch = handler::handle_event(&self.catalog, &mut self.tx, event);
            match dispatch.action {
                Some(DeviceAction::BeginRecovery) if origin == Origin::Poll => follow.recover = true,
                Some(DeviceAction::BeginRecovery) => {
                    debug!(?origin, "Reset reported while starting; not starting another episode")
                }
                Some(DeviceAction::ReEnable) => follow.re_enable = true,
                None => {}
            }
            self.notifier.send(Notification::device_event(
                self.id,
                &self.operator_id,
                event,
                &dispatch,
            ));
        }

        let note = self.tx.current_note_channel;
        let total = self.tx.ledger.total_value();
        self.status.send_modify(|s| {
            s.current_note_channel = note;
            s.total_value = total;
        });
        follow
    }

    /// `None` when the episode was skipped and the tick carries on.
    async fn recover(&mut self) -> Option<bool> {
        self.set_state(SessionState::Resetting);
        match self.recovery.run_episode(&mut self.device, &self.cancel).await {
            EpisodeOutcome::Skipped => {
                self.set_state(SessionState::Running);
                None
            }
            EpisodeOutcome::Recovered(events) => {
                let follow = self.apply(events, Origin::Restart);
                self.set_state(SessionState::Running);
                if follow.re_enable {
                    self.re_enable().await;
                }
                Some(true)
            }
            EpisodeOutcome::Failed(e) => {
                error!(session_id = %self.id, error = %e, "Reset recovery failed; polling stopped");
                self.failed = true;
                self.status.send_modify(|s| {
                    s.state = SessionState::Failed;
                    s.last_error = Some(e.to_string());
                });
                Some(false)
            }
            EpisodeOutcome::Cancelled => Some(false),
        }
    }

    async fn re_enable(&mut self) {
        if let Err(e) = self.device.enable().await {
            warn!(error = %e, "Re-enable after DISABLED failed");
        }
    }

    fn set_state(&self, state: SessionState) {
        self.status.send_modify(|s| s.state = state);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SerialNumber(reply) => {
                let _ = reply.send(self.device.get_serial_number().await);
            }
            SessionCommand::Payout { amount, reply } => {
                let _ = reply.send(self.device.payout(amount).await);
            }
            SessionCommand::EmptyCashbox(reply) => {
                let _ = reply.send(self.device.empty_cashbox().await);
            }
            SessionCommand::FloatAmount {
                min_payout,
                amount,
                reply,
            } => {
                let _ = reply.send(self.device.float_amount(min_payout, amount).await);
            }
            SessionCommand::GetRoute { value, reply } => {
                let _ = reply.send(self.device.get_denomination_route(value).await);
            }
            SessionCommand::SetRoute { value, route, reply } => {
                let _ = reply.send(self.device.set_denomination_route(value, route).await);
            }
            SessionCommand::NoteInventory(reply) => {
                let _ = reply.send(self.note_inventory().await);
            }
            SessionCommand::Ledger(reply) => {
                let _ = reply.send(self.tx.ledger.snapshot());
            }
        }
    }

    async fn note_inventory(&mut self) -> Result<NoteInventory> {
        if self.device.state() != DeviceState::Enabled {
            return Err(AcceptorError::DeviceNotReady {
                command: "GET_DENOMINATION_ROUTE",
            });
        }
        let notes: Vec<(String, u64)> = self
            .catalog
            .iter()
            .map(|d| (d.label.clone(), d.face_value))
            .collect();

        let mut inventory = NoteInventory::new();
        for (label, face_value) in notes {
            let state = match u32::try_from(face_value) {
                Err(_) => RouteState::Error(format!("face value {face_value} out of range")),
                Ok(value) => match self.device.get_denomination_route(value).await {
                    Ok(route) => RouteState::Routed(route),
                    Err(AcceptorError::DeviceProtocol { detail, .. }) => RouteState::Unavailable(detail),
                    Err(e) => RouteState::Error(e.to_string()),
                },
            };
            inventory.insert(label, state);
        }
        Ok(inventory)
    }

    async fn shutdown(mut self) -> SessionSummary {
        self.set_state(SessionState::Stopped);
        if self.device.state() != DeviceState::Closed {
            if let Err(e) = self.device.disable().await {
                debug!(error = %e, "Disable on stop failed");
            }
            let _ = self.device.close().await;
        }

        let snapshot = self.tx.ledger.snapshot();
        let summary = SessionSummary {
            session_id: self.id,
            operator_id: self.operator_id.clone(),
            port: self.device.port().to_string(),
            total_value: snapshot.total_value,
            entries: snapshot.entries,
            started_at: self.started_at,
            stopped_at: Utc::now(),
        };
        self.notifier
            .send(Notification::TransactionCompleted(summary.clone()));
        self.notifier.drain(self.drain_timeout).await;

        info!(
            session_id = %self.id,
            total_value = summary.total_value,
            notes = summary.entries.values().map(|e| e.count).sum::<u64>(),
            "Acceptance session stopped"
        );
        summary
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::denomination::NoteSpec;
    use crate::acceptor::event::EventName;
    use crate::acceptor::testing::{poll_events, RecordingNotifier, ScriptedTransport};
    use crate::acceptor::transport::{CommandResponse, ResponseStatus};
    use crate::notifier::TRANSACTION_COMPLETED;

    fn two_note_config() -> AcceptorConfig {
        AcceptorConfig {
            denominations: vec![NoteSpec::new(500, "5 EUR"), NoteSpec::new(1_000, "10 EUR")],
            ..AcceptorConfig::default()
        }
    }

    fn credit(channel: u8) -> DeviceEvent {
        DeviceEvent::on_channel(EventName::CreditNote, channel)
    }

    async fn start(script: &ScriptedTransport, notifier: &RecordingNotifier) -> Session {
        Session::start(
            two_note_config(),
            "op-1",
            script.boxed(),
            Arc::new(notifier.clone()),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_credits_in_one_poll() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;
        script.push_poll(poll_events(vec![credit(1), credit(2), credit(1)]));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let summary = session.stop().await.unwrap();

        assert_eq!(summary.total_value, 2_000);
        assert_eq!(summary.entries["5 EUR"].count, 2);
        assert_eq!(summary.entries["10 EUR"].count, 1);
        assert_eq!(summary.operator_id, "op-1");
        assert_eq!(
            notifier.event_names(),
            vec!["CREDIT_NOTE", "CREDIT_NOTE", "CREDIT_NOTE", TRANSACTION_COMPLETED]
        );
        match notifier.delivered().last() {
            Some(Notification::TransactionCompleted(s)) => assert_eq!(s.total_value, 2_000),
            other => panic!("unexpected final notification {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_is_deterministic() {
        let polls = || {
            vec![
                vec![DeviceEvent::on_channel(EventName::ReadNote, 2), credit(2)],
                vec![DeviceEvent::new(EventName::NoteRejected)],
                vec![credit(1), credit(9), credit(1)],
            ]
        };

        let mut ledgers = Vec::new();
        for _ in 0..2 {
            let script = ScriptedTransport::new();
            let notifier = RecordingNotifier::new();
            let session = start(&script, &notifier).await;
            for batch in polls() {
                script.push_poll(poll_events(batch));
            }
            tokio::time::sleep(Duration::from_millis(3_500)).await;
            let summary = session.stop().await.unwrap();
            ledgers.push((summary.total_value, summary.entries));
        }
        assert_eq!(ledgers[0], ledgers[1]);
        assert_eq!(ledgers[0].0, 2_000);
        assert_eq!(ledgers[0].1["Unknown"].count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_credit() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;
        script.push_poll(poll_events(vec![credit(2)]));
        script.set_poll_delay(Duration::from_millis(500));
        script.clear_calls();

        // first tick fires at 1s and its POLL is still outstanding at 1.2s
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let summary = session.stop().await.unwrap();

        assert_eq!(summary.total_value, 1_000);
        assert_eq!(script.calls(), vec!["POLL", "DISABLE", "CLOSE"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_resets_within_cooldown_run_one_episode() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;
        script.push_poll(poll_events(vec![DeviceEvent::new(EventName::SlaveReset)]));
        // verification poll of the episode
        script.push_poll(poll_events(vec![credit(1)]));
        script.push_poll(poll_events(vec![DeviceEvent::new(EventName::SlaveReset)]));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(session.poll_status().state, SessionState::Running);
        let summary = session.stop().await.unwrap();

        // start plus exactly one recovery episode
        assert_eq!(script.count("OPEN"), 2);
        assert_eq!(summary.total_value, 500);
        let resets = notifier
            .event_names()
            .into_iter()
            .filter(|n| *n == "SLAVE_RESET")
            .count();
        assert_eq!(resets, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recovery_stops_polling() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;
        script.push_poll(poll_events(vec![credit(1), DeviceEvent::new(EventName::SlaveReset)]));
        script.fail_all_opens(true);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let status = session.poll_status();
        assert_eq!(status.state, SessionState::Failed);
        assert!(!status.is_alive());
        assert!(!script.is_open());

        let calls = script.calls().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(script.calls().len(), calls);

        assert_eq!(
            session.payout(500).await.unwrap_err(),
            AcceptorError::DeviceNotReady { command: "PAYOUT_AMOUNT" }
        );
        let summary = session.stop().await.unwrap();
        assert_eq!(summary.total_value, 500);
        assert_eq!(script.calls().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_leaves_nothing_running() {
        let script = ScriptedTransport::new();
        script.fail_all_opens(true);
        let notifier = RecordingNotifier::new();
        let err = Session::start(
            two_note_config(),
            "op-1",
            script.boxed(),
            Arc::new(notifier.clone()),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, AcceptorError::DeviceStartFailed { attempts: 3, .. }));
        let expected = ["OPEN", "CLOSE", "OPEN", "CLOSE", "OPEN", "CLOSE"];
        assert_eq!(script.calls(), expected);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(script.calls(), expected);
        assert!(notifier.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_triggers_re_enable() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;
        script.push_poll(poll_events(vec![DeviceEvent::new(EventName::Disabled)]));
        script.respond("ENABLE", Ok(CommandResponse::with_status(ResponseStatus::Fail)));
        script.push_poll(poll_events(vec![DeviceEvent::new(EventName::Disabled)]));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        // one at start, two re-enables (the first one refused and only logged)
        assert_eq!(script.count("ENABLE"), 3);
        assert!(session.poll_status().is_alive());
        session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failures_are_counted_and_cleared() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;
        script.push_poll(Err(AcceptorError::DeviceTimeout {
            command: "POLL",
            timeout_ms: 3_000,
        }));
        script.push_poll(Ok(CommandResponse::with_status(ResponseStatus::Fail)));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let status = session.poll_status();
        assert_eq!(status.consecutive_poll_failures, 2);
        assert!(status.last_error.is_some());
        assert!(status.is_alive());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = session.poll_status();
        assert_eq!(status.consecutive_poll_failures, 0);
        assert!(status.last_poll_at.is_some());
        session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_poll_events_are_dispatched() {
        let script = ScriptedTransport::new();
        script.push_poll(poll_events(vec![DeviceEvent::new(EventName::SlaveReset), credit(2)]));
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;

        assert_eq!(session.ledger().await.unwrap().total_value, 1_000);
        tokio::time::sleep(Duration::from_secs(5)).await;
        // the reset seen while starting does not trigger an episode
        assert_eq!(script.count("OPEN"), 1);
        session.stop().await.unwrap();
        assert_eq!(notifier.event_names()[..2], ["SLAVE_RESET", "CREDIT_NOTE"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_and_inventory() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;
        script.respond(
            "GET_DENOMINATION_ROUTE",
            Ok(CommandResponse::ok(crate::acceptor::transport::ResponseInfo::Route(
                NoteRoute::Payout,
            ))),
        );
        script.respond(
            "GET_DENOMINATION_ROUTE",
            Ok(CommandResponse::with_status(ResponseStatus::ParameterOutOfRange)),
        );

        assert_eq!(session.serial_number().await.unwrap(), "12345678");
        let inventory = session.note_inventory().await.unwrap();
        assert_eq!(inventory["5 EUR"], RouteState::Routed(NoteRoute::Payout));
        assert!(matches!(inventory["10 EUR"], RouteState::Unavailable(_)));

        session.payout(1_000).await.unwrap();
        session.empty_cashbox().await.unwrap();
        session.float_amount(500, 2_000).await.unwrap();
        session.set_denomination_route(500, NoteRoute::Cashbox).await.unwrap();
        assert_eq!(session.denomination_route(500).await.unwrap(), NoteRoute::Cashbox);
        session.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifier_failures_do_not_stall_polling() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::failing_every(1);
        let session = start(&script, &notifier).await;
        script.push_poll(poll_events(vec![credit(1)]));
        script.push_poll(poll_events(vec![credit(2)]));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let summary = session.stop().await.unwrap();
        assert_eq!(summary.total_value, 1_500);
        assert_eq!(notifier.attempts(), 3);
        assert!(notifier.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_closes_device() {
        let script = ScriptedTransport::new();
        let notifier = RecordingNotifier::new();
        let session = start(&script, &notifier).await;
        drop(session);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!script.is_open());
        assert_eq!(notifier.event_names(), vec![TRANSACTION_COMPLETED]);
    }
}
