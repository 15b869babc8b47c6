//! Start-up retries and self-reset recovery.
//!
//! `initialize_and_start` brings the device from closed to enabled-and-
//! answering, retrying with exponential backoff. `RecoveryController` wraps it
//! in reset episodes: at most one at a time, none within the cool-down of the
//! previous one, each preceded by a stabilisation wait that grows with the
//! number of consecutive failed attempts.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::Device;
use super::event::DeviceEvent;
use crate::config::{AcceptorConfig, RecoveryPolicy, StartupPolicy};
use crate::error::{AcceptorError, Result};

// ---------------------------------------------------------------------------
// Reset bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetState {
    pub in_progress: bool,
    /// Consecutive failed start attempts plus episodes begun since the last
    /// successful start.
    pub attempt_count: u32,
    pub last_reset_started: Option<Instant>,
}

impl ResetState {
    /// Claim a new episode at `now`. Refused while one is running or within
    /// `cooldown` of the previous episode's start.
    pub fn try_begin(&mut self, now: Instant, cooldown: Duration) -> bool {
        if self.in_progress {
            return false;
        }
        if let Some(last) = self.last_reset_started {
            if now.duration_since(last) < cooldown {
                return false;
            }
        }
        self.in_progress = true;
        self.last_reset_started = Some(now);
        self.attempt_count += 1;
        true
    }

    pub fn finish(&mut self, recovered: bool) {
        self.in_progress = false;
        if recovered {
            self.attempt_count = 0;
        }
    }
}

pub fn stabilization_delay(policy: &RecoveryPolicy, attempt_count: u32) -> Duration {
    let ms = policy
        .stabilization_step_ms
        .saturating_mul(u64::from(attempt_count))
        .min(policy.stabilization_cap_ms);
    Duration::from_millis(ms)
}

/// `base * 2^(attempt - 1)` for 1-based `attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Sleep unless cancelled first. Returns true on cancellation.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

// ---------------------------------------------------------------------------
// Start sequence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPlan {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub settle_delay: Duration,
}

impl StartPlan {
    pub fn initial(startup: &StartupPolicy) -> Self {
        Self {
            max_retries: startup.max_retries,
            base_delay: Duration::from_millis(startup.base_delay_ms),
            settle_delay: Duration::from_millis(startup.settle_delay_ms),
        }
    }

    pub fn after_reset(startup: &StartupPolicy, recovery: &RecoveryPolicy) -> Self {
        Self {
            max_retries: startup.max_retries,
            base_delay: Duration::from_millis(recovery.base_delay_ms),
            settle_delay: Duration::from_millis(startup.reset_settle_delay_ms),
        }
    }
}

/// Open, enable, settle and verify with one POLL; retry with backoff.
///
/// Returns the events of the verifying POLL so the caller can dispatch them.
/// After the last failed attempt no further transport call is made.
pub async fn initialize_and_start(
    device: &mut Device,
    plan: &StartPlan,
    reset: &mut ResetState,
    cancel: &CancellationToken,
) -> Result<Vec<DeviceEvent>> {
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=plan.max_retries {
        debug!(attempt, max = plan.max_retries, "Starting device");
        match start_once(device, plan.settle_delay, cancel).await {
            Ok(events) => {
                reset.attempt_count = 0;
                info!(attempt, port = device.port(), "Device started and responding");
                return Ok(events);
            }
            Err(AcceptorError::SessionClosed) => {
                let _ = device.close().await;
                return Err(AcceptorError::SessionClosed);
            }
            Err(e) => {
                reset.attempt_count += 1;
                warn!(attempt, max = plan.max_retries, error = %e, "Device start attempt failed");
                last_error = e.to_string();
                let _ = device.close().await;

                if attempt < plan.max_retries {
                    let delay = backoff_delay(plan.base_delay, attempt);
                    debug!(delay_ms = delay.as_millis() as u64, "Backing off before next start attempt");
                    if sleep_or_cancel(delay, cancel).await {
                        return Err(AcceptorError::SessionClosed);
                    }
                }
            }
        }
    }

    error!(attempts = plan.max_retries, last_error = %last_error, "Device failed to start");
    Err(AcceptorError::DeviceStartFailed {
        attempts: plan.max_retries,
        last_error,
    })
}

async fn start_once(
    device: &mut Device,
    settle: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<DeviceEvent>> {
    device.open().await?;
    device.enable().await?;
    if sleep_or_cancel(settle, cancel).await {
        return Err(AcceptorError::SessionClosed);
    }
    device.poll().await
}

// ---------------------------------------------------------------------------
// Episodes
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum EpisodeOutcome {
    /// Cool-down active or an episode already running.
    Skipped,
    /// Device is back; carries the verifying POLL's events.
    Recovered(Vec<DeviceEvent>),
    /// Retries exhausted; the transport is closed.
    Failed(AcceptorError),
    /// The session stopped mid-episode.
    Cancelled,
}

pub struct RecoveryController {
    state: ResetState,
    startup: StartupPolicy,
    policy: RecoveryPolicy,
}

impl RecoveryController {
    pub fn new(config: &AcceptorConfig) -> Self {
        Self {
            state: ResetState::default(),
            startup: config.startup.clone(),
            policy: config.recovery.clone(),
        }
    }

    pub fn state(&self) -> &ResetState {
        &self.state
    }

    /// Initial bring-up.
    pub async fn start(
        &mut self,
        device: &mut Device,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceEvent>> {
        let plan = StartPlan::initial(&self.startup);
        initialize_and_start(device, &plan, &mut self.state, cancel).await
    }

    /// Handle a SLAVE_RESET observed by the poll loop.
    pub async fn run_episode(
        &mut self,
        device: &mut Device,
        cancel: &CancellationToken,
    ) -> EpisodeOutcome {
        let now = Instant::now();
        if !self.state.try_begin(now, self.policy.cooldown()) {
            let since_ms = self
                .state
                .last_reset_started
                .map(|last| now.duration_since(last).as_millis() as u64);
            info!(
                in_progress = self.state.in_progress,
                since_last_ms = ?since_ms,
                "Reset recovery skipped"
            );
            return EpisodeOutcome::Skipped;
        }

        warn!(attempt = self.state.attempt_count, "Device reset detected, recovering");
        if let Err(e) = device.disable().await {
            debug!(error = %e, "Disable before reset recovery failed");
        }
        let _ = device.close().await;

        let delay = stabilization_delay(&self.policy, self.state.attempt_count);
        info!(delay_ms = delay.as_millis() as u64, "Waiting for device to stabilise");
        if sleep_or_cancel(delay, cancel).await {
            self.state.finish(false);
            return EpisodeOutcome::Cancelled;
        }

        let plan = StartPlan::after_reset(&self.startup, &self.policy);
        let outcome = match initialize_and_start(device, &plan, &mut self.state, cancel).await {
            Ok(events) => EpisodeOutcome::Recovered(events),
            Err(AcceptorError::SessionClosed) => EpisodeOutcome::Cancelled,
            Err(e) => EpisodeOutcome::Failed(e),
        };
        let recovered = matches!(outcome, EpisodeOutcome::Recovered(_));
        self.state.finish(recovered);
        if recovered {
            info!("Device recovered from reset");
        }
        outcome
    }
}

// ===========================================================================
// Tests
// ===========================================================================
