//! Outbound event relay.
//!
//! Every dispatched device event and the final transaction summary are handed
//! to an `EventNotifier`. Delivery is best-effort: the session pushes
//! notifications onto an unbounded queue drained by a dedicated task, so a
//! slow or failing sink never stalls polling, and failures are only logged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::acceptor::denomination::Denomination;
use crate::acceptor::event::{DeviceEvent, EventName, Severity};
use crate::acceptor::handler::Dispatch;
use crate::acceptor::session::SessionSummary;
use crate::config::WebhookConfig;
use crate::error::{AcceptorError, Result};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

pub const TRANSACTION_COMPLETED: &str = "TRANSACTION_COMPLETED";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub session_id: Uuid,
    pub operator_id: String,
    pub event_name: EventName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denomination: Option<Denomination>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    DeviceEvent(EventNotification),
    TransactionCompleted(SessionSummary),
}

impl Notification {
    pub fn device_event(
        session_id: Uuid,
        operator_id: &str,
        event: &DeviceEvent,
        dispatch: &Dispatch,
    ) -> Self {
        Self::DeviceEvent(EventNotification {
            session_id,
            operator_id: operator_id.to_string(),
            event_name: event.name,
            channel: event.channel,
            description: event.description.clone(),
            denomination: dispatch.denomination.clone(),
            severity: dispatch.severity,
            timestamp: Utc::now(),
        })
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::DeviceEvent(n) => n.event_name.as_str(),
            Self::TransactionCompleted(_) => TRANSACTION_COMPLETED,
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Drops everything. Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl EventNotifier for NoopNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

/// Forwards notifications into an in-process channel (UI bridge, tests).
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventNotifier for ChannelNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.tx
            .send(notification.clone())
            .map_err(|_| AcceptorError::NotifierDelivery("receiver dropped".into()))
    }
}

/// POSTs `{"type": <source>, "data": <notification>}` to a webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    source: String,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AcceptorError::Config(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            source: config.source.clone(),
        })
    }

    fn envelope(&self, notification: &Notification) -> serde_json::Value {
        serde_json::json!({
            "type": self.source,
            "data": notification,
        })
    }
}

#[async_trait]
impl EventNotifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.envelope(notification))
            .send()
            .await
            .map_err(|e| AcceptorError::NotifierDelivery(format!("POST {}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AcceptorError::NotifierDelivery(format!(
                "POST {} returned {status}",
                self.url
            )));
        }
        debug!(event = notification.event_name(), "Webhook delivered");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Ordered, non-blocking hand-off from the sequencer to a notifier.
pub(crate) struct NotifierQueue {
    tx: mpsc::UnboundedSender<Notification>,
    task: JoinHandle<()>,
}

impl NotifierQueue {
    pub(crate) fn spawn(notifier: Arc<dyn EventNotifier>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let task = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if let Err(e) = notifier.notify(&notification).await {
                    warn!(
                        event = notification.event_name(),
                        error = %e,
                        "Notifier delivery failed"
                    );
                }
            }
        });
        Self { tx, task }
    }

    pub(crate) fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("Notifier queue closed; notification dropped");
        }
    }

    /// Close the queue and give pending deliveries `timeout` to finish.
    pub(crate) async fn drain(self, timeout: Duration) {
        let Self { tx, mut task } = self;
        drop(tx);
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Notifier drain timed out; aborting");
            task.abort();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
