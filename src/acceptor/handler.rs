//! Event dispatch table.
//!
//! `handle_event` is synchronous and side-effect free apart from the
//! transaction state it is handed: it never talks to the device. Anything the
//! device has to do in response (re-enable, reset recovery) comes back as a
//! `DeviceAction` for the session sequencer to carry out once the whole poll
//! batch has been dispatched.

use tracing::{error, info, warn};

use super::denomination::{Denomination, DenominationCatalog};
use super::event::{DeviceEvent, EventName, Severity};
use super::ledger::Ledger;

/// Follow-up the sequencer must run against the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    /// The acceptor reset itself; run a recovery episode.
    BeginRecovery,
    /// The acceptor dropped to disabled; send ENABLE.
    ReEnable,
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub severity: Severity,
    /// Set for CREDIT_NOTE only.
    pub denomination: Option<Denomination>,
    pub action: Option<DeviceAction>,
}

impl Dispatch {
    fn info() -> Self {
        Self::with_severity(Severity::Info)
    }

    fn with_severity(severity: Severity) -> Self {
        Self {
            severity,
            denomination: None,
            action: None,
        }
    }
}

/// Money-relevant state owned by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionState {
    pub ledger: Ledger,
    /// Channel of the note currently in the transport path, if any.
    pub current_note_channel: Option<u8>,
}

impl TransactionState {
    pub fn new(catalog: &DenominationCatalog) -> Self {
        Self {
            ledger: Ledger::for_catalog(catalog),
            current_note_channel: None,
        }
    }
}

/// Apply one event to the transaction state.
pub fn handle_event(
    catalog: &DenominationCatalog,
    state: &mut TransactionState,
    event: &DeviceEvent,
) -> Dispatch {
    match event.name {
        EventName::SlaveReset => {
            warn!("The device has reset itself");
            Dispatch {
                action: Some(DeviceAction::BeginRecovery),
                ..Dispatch::with_severity(Severity::Warning)
            }
        }
        EventName::Disabled => {
            warn!("Device is disabled, re-enabling");
            Dispatch {
                action: Some(DeviceAction::ReEnable),
                ..Dispatch::with_severity(Severity::Warning)
            }
        }
        EventName::ReadNote => {
            state.current_note_channel = event.channel;
            info!(channel = ?event.channel, "Note being read");
            Dispatch::info()
        }
        EventName::CreditNote => {
            let channel = event.channel.unwrap_or(0);
            let denomination = catalog.resolve(channel).clone();
            if denomination.is_unknown() {
                warn!(channel, "Credit on a channel outside the catalog");
            }
            state.ledger.credit(&denomination);
            state.current_note_channel = None;
            info!(
                channel,
                label = %denomination.label,
                face_value = denomination.face_value,
                "Note credited"
            );
            Dispatch {
                denomination: Some(denomination),
                ..Dispatch::info()
            }
        }
        EventName::NoteRejecting | EventName::NoteRejected => {
            warn!(event = %event.name, "Note rejected");
            Dispatch::with_severity(Severity::Warning)
        }
        EventName::FraudAttempt
        | EventName::StackerFull
        | EventName::CashBoxRemoved
        | EventName::CoinMechError
        | EventName::CoinMechJam
        | EventName::SafeJam
        | EventName::UnsafeJam
        | EventName::Error => {
            error!(
                event = %event.name,
                channel = ?event.channel,
                description = ?event.description,
                "Device alert"
            );
            Dispatch::with_severity(Severity::Alert)
        }
        EventName::NoteStacking
        | EventName::NoteStacked
        | EventName::NoteClearedFromFront
        | EventName::NoteClearedToCashbox
        | EventName::CashBoxReplaced
        | EventName::NoteStoredInPayout
        | EventName::NoteDispensing
        | EventName::NoteDispensed
        | EventName::NoteTransferredToStacker
        | EventName::Emptying
        | EventName::Emptied
        | EventName::SmartEmptying
        | EventName::SmartEmptied
        | EventName::Initialising
        | EventName::BarcodeTicketValidated
        | EventName::BarcodeTicketAcknowledge => {
            info!(event = %event.name, description = ?event.description, "Device event");
            Dispatch::info()
        }
        EventName::NotePathOpen
        | EventName::ChannelDisable
        | EventName::Jammed
        | EventName::Halted => {
            warn!(event = %event.name, description = ?event.description, "Device event");
            Dispatch::with_severity(Severity::Warning)
        }
        EventName::Unknown => {
            warn!(description = ?event.description, raw = ?event.raw_data, "Unhandled device event");
            Dispatch::with_severity(Severity::Warning)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::denomination::NoteSpec;

    fn catalog() -> DenominationCatalog {
        DenominationCatalog::from_specs(&[NoteSpec::new(500, "5 EUR"), NoteSpec::new(1_000, "10 EUR")])
    }

    #[test]
    fn test_scenario_three_credits() {
        let catalog = catalog();
        let mut state = TransactionState::new(&catalog);
        for ch in [1u8, 2, 1] {
            handle_event(&catalog, &mut state, &DeviceEvent::on_channel(EventName::CreditNote, ch));
        }
        let snap = state.ledger.snapshot();
        assert_eq!(snap.count_of("5 EUR"), 2);
        assert_eq!(snap.count_of("10 EUR"), 1);
        assert_eq!(snap.total_value, 2_000);
    }

    #[test]
    fn test_read_then_credit_tracks_note_in_transit() {
        let catalog = catalog();
        let mut state = TransactionState::new(&catalog);
        let d = handle_event(&catalog, &mut state, &DeviceEvent::on_channel(EventName::ReadNote, 2));
        assert_eq!(state.current_note_channel, Some(2));
        assert_eq!(state.ledger.total_value(), 0);
        assert!(d.denomination.is_none());

        let d = handle_event(&catalog, &mut state, &DeviceEvent::on_channel(EventName::CreditNote, 2));
        assert_eq!(state.current_note_channel, None);
        assert_eq!(d.denomination.unwrap().label, "10 EUR");
        assert_eq!(state.ledger.total_value(), 1_000);
    }

    #[test]
    fn test_credit_out_of_range_resolves_unknown() {
        let catalog = catalog();
        let mut state = TransactionState::new(&catalog);
        let d = handle_event(&catalog, &mut state, &DeviceEvent::on_channel(EventName::CreditNote, 12));
        assert!(d.denomination.unwrap().is_unknown());
        assert_eq!(state.ledger.total_value(), 0);

        // credit without a channel byte behaves the same
        let d = handle_event(&catalog, &mut state, &DeviceEvent::new(EventName::CreditNote));
        assert!(d.denomination.unwrap().is_unknown());
    }

    #[test]
    fn test_actions() {
        let catalog = catalog();
        let mut state = TransactionState::new(&catalog);
        let d = handle_event(&catalog, &mut state, &DeviceEvent::new(EventName::SlaveReset));
        assert_eq!(d.action, Some(DeviceAction::BeginRecovery));
        let d = handle_event(&catalog, &mut state, &DeviceEvent::new(EventName::Disabled));
        assert_eq!(d.action, Some(DeviceAction::ReEnable));
        let d = handle_event(&catalog, &mut state, &DeviceEvent::new(EventName::NoteStacked));
        assert_eq!(d.action, None);
    }

    #[test]
    fn test_alert_events_leave_ledger_alone() {
        let catalog = catalog();
        let mut state = TransactionState::new(&catalog);
        for name in [
            EventName::FraudAttempt,
            EventName::StackerFull,
            EventName::CashBoxRemoved,
            EventName::CoinMechError,
            EventName::CoinMechJam,
            EventName::SafeJam,
            EventName::UnsafeJam,
            EventName::Error,
        ] {
            let d = handle_event(&catalog, &mut state, &DeviceEvent::new(name));
            assert_eq!(d.severity, Severity::Alert, "{name}");
            assert_eq!(d.action, None);
        }
        assert_eq!(state.ledger.total_value(), 0);
    }

    #[test]
    fn test_rejections_and_unknown_are_warnings() {
        let catalog = catalog();
        let mut state = TransactionState::new(&catalog);
        for name in [EventName::NoteRejecting, EventName::NoteRejected, EventName::Unknown] {
            let d = handle_event(&catalog, &mut state, &DeviceEvent::new(name));
            assert_eq!(d.severity, Severity::Warning);
        }
        assert_eq!(state.ledger.snapshot().notes_accepted(), 0);
    }
}
