//! In-memory doubles for the transport and notifier.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::event::DeviceEvent;
use super::transport::{Command, CommandResponse, NoteRoute, ResponseInfo, Transport};
use crate::error::{AcceptorError, Result};
use crate::notifier::{EventNotifier, Notification};

pub(crate) fn poll_events(events: Vec<DeviceEvent>) -> Result<CommandResponse> {
    Ok(CommandResponse::ok(ResponseInfo::Events(events)))
}

#[derive(Default)]
struct Script {
    calls: Vec<String>,
    open: bool,
    open_failures: u32,
    open_always_fails: bool,
    polls: VecDeque<Result<CommandResponse>>,
    poll_delay: Option<Duration>,
    responses: HashMap<&'static str, VecDeque<Result<CommandResponse>>>,
    hanging: HashSet<&'static str>,
}

/// Scripted acceptor. Clones share one script, so a test keeps a handle
/// after boxing a copy into a `Device`.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap();
        f(&mut script)
    }

    pub(crate) fn push_poll(&self, response: Result<CommandResponse>) {
        self.with(|s| s.polls.push_back(response));
    }

    pub(crate) fn respond(&self, command: &'static str, response: Result<CommandResponse>) {
        self.with(|s| s.responses.entry(command).or_default().push_back(response));
    }

    pub(crate) fn hang(&self, command: &'static str) {
        self.with(|s| s.hanging.insert(command));
    }

    pub(crate) fn fail_opens(&self, count: u32) {
        self.with(|s| s.open_failures = count);
    }

    pub(crate) fn fail_all_opens(&self, fail: bool) {
        self.with(|s| s.open_always_fails = fail);
    }

    pub(crate) fn set_poll_delay(&self, delay: Duration) {
        self.with(|s| s.poll_delay = Some(delay));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub(crate) fn count(&self, command: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| *c == command).count())
    }

    pub(crate) fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    pub(crate) fn is_open(&self) -> bool {
        self.with(|s| s.open)
    }
}

fn default_response(command: &Command) -> CommandResponse {
    match command {
        Command::GetSerialNumber => CommandResponse::ok(ResponseInfo::SerialNumber(12_345_678)),
        Command::GetDenominationRoute { .. } => CommandResponse::ok(ResponseInfo::Route(NoteRoute::Cashbox)),
        Command::Poll => CommandResponse::ok(ResponseInfo::Events(Vec::new())),
        _ => CommandResponse::ok(ResponseInfo::None),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&mut self, port: &str, _baud_rate: u32) -> Result<()> {
        self.with(|s| {
            s.calls.push("OPEN".into());
            let fail = if s.open_always_fails {
                true
            } else if s.open_failures > 0 {
                s.open_failures -= 1;
                true
            } else {
                false
            };
            if fail {
                s.open = false;
                return Err(AcceptorError::DeviceUnreachable {
                    port: port.to_string(),
                    reason: "scripted open failure".into(),
                });
            }
            s.open = true;
            Ok(())
        })
    }

    async fn command(&mut self, command: Command) -> Result<CommandResponse> {
        let name = command.name();
        let (open, hanging, delay) = self.with(|s| {
            s.calls.push(name.into());
            (s.open, s.hanging.contains(name), s.poll_delay)
        });
        if !open {
            return Err(AcceptorError::DeviceNotReady { command: name });
        }
        if hanging {
            return std::future::pending().await;
        }
        if let (Command::Poll, Some(delay)) = (&command, delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            let queued = if matches!(command, Command::Poll) {
                s.polls.pop_front()
            } else {
                s.responses.get_mut(name).and_then(VecDeque::pop_front)
            };
            queued.unwrap_or_else(|| Ok(default_response(&command)))
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.with(|s| {
            s.calls.push("CLOSE".into());
            s.open = false;
        });
        Ok(())
    }

    fn description(&self) -> String {
        "scripted".into()
    }
}

/// Records every notification; optionally fails every `n`th delivery.
#[derive(Clone, Default)]
pub(crate) struct RecordingNotifier {
    inner: Arc<Mutex<Recorded>>,
    fail_every: Option<usize>,
}

#[derive(Default)]
struct Recorded {
    attempts: usize,
    delivered: Vec<Notification>,
}

impl RecordingNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_every(n: usize) -> Self {
        Self {
            fail_every: Some(n),
            ..Self::default()
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts
    }

    pub(crate) fn delivered(&self) -> Vec<Notification> {
        self.inner.lock().unwrap().delivered.clone()
    }

    pub(crate) fn event_names(&self) -> Vec<&'static str> {
        self.delivered().iter().map(Notification::event_name).collect()
    }
}

#[async_trait]
impl EventNotifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts += 1;
        if let Some(n) = self.fail_every {
            if inner.attempts % n == 0 {
                return Err(AcceptorError::NotifierDelivery("scripted failure".into()));
            }
        }
        inner.delivered.push(notification.clone());
        Ok(())
    }
}
