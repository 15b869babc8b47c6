//! Device events decoded from POLL responses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Poll event tag.
///
/// Only a subset changes session state; the rest are carried through to the
/// notifier so downstream consumers see the full device history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventName {
    SlaveReset,
    Disabled,
    ReadNote,
    CreditNote,
    NoteRejecting,
    NoteRejected,
    NoteStacking,
    NoteStacked,
    NoteClearedFromFront,
    NoteClearedToCashbox,
    NotePathOpen,
    FraudAttempt,
    StackerFull,
    CashBoxRemoved,
    CashBoxReplaced,
    NoteStoredInPayout,
    NoteDispensing,
    NoteDispensed,
    NoteTransferredToStacker,
    Emptying,
    Emptied,
    SmartEmptying,
    SmartEmptied,
    Jammed,
    Halted,
    ChannelDisable,
    Initialising,
    CoinMechError,
    CoinMechJam,
    BarcodeTicketValidated,
    BarcodeTicketAcknowledge,
    SafeJam,
    UnsafeJam,
    /// Undecodable payload for a known event.
    Error,
    /// Event code this driver does not know.
    Unknown,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlaveReset => "SLAVE_RESET",
            Self::Disabled => "DISABLED",
            Self::ReadNote => "READ_NOTE",
            Self::CreditNote => "CREDIT_NOTE",
            Self::NoteRejecting => "NOTE_REJECTING",
            Self::NoteRejected => "NOTE_REJECTED",
            Self::NoteStacking => "NOTE_STACKING",
            Self::NoteStacked => "NOTE_STACKED",
            Self::NoteClearedFromFront => "NOTE_CLEARED_FROM_FRONT",
            Self::NoteClearedToCashbox => "NOTE_CLEARED_TO_CASHBOX",
            Self::NotePathOpen => "NOTE_PATH_OPEN",
            Self::FraudAttempt => "FRAUD_ATTEMPT",
            Self::StackerFull => "STACKER_FULL",
            Self::CashBoxRemoved => "CASH_BOX_REMOVED",
            Self::CashBoxReplaced => "CASH_BOX_REPLACED",
            Self::NoteStoredInPayout => "NOTE_STORED_IN_PAYOUT",
            Self::NoteDispensing => "NOTE_DISPENSING",
            Self::NoteDispensed => "NOTE_DISPENSED",
            Self::NoteTransferredToStacker => "NOTE_TRANSFERRED_TO_STACKER",
            Self::Emptying => "EMPTYING",
            Self::Emptied => "EMPTIED",
            Self::SmartEmptying => "SMART_EMPTYING",
            Self::SmartEmptied => "SMART_EMPTIED",
            Self::Jammed => "JAMMED",
            Self::Halted => "HALTED",
            Self::ChannelDisable => "CHANNEL_DISABLE",
            Self::Initialising => "INITIALISING",
            Self::CoinMechError => "COIN_MECH_ERROR",
            Self::CoinMechJam => "COIN_MECH_JAM",
            Self::BarcodeTicketValidated => "BARCODE_TICKET_VALIDATED",
            Self::BarcodeTicketAcknowledge => "BARCODE_TICKET_ACKNOWLEDGE",
            Self::SafeJam => "SAFE_JAM",
            Self::UnsafeJam => "UNSAFE_JAM",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification severity attached to every dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    /// Needs staff attention (fraud, jams, cash box missing).
    Alert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub name: EventName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Vec<u8>>,
}

impl DeviceEvent {
    pub fn new(name: EventName) -> Self {
        Self {
            name,
            channel: None,
            description: None,
            raw_data: None,
        }
    }

    pub fn on_channel(name: EventName, channel: u8) -> Self {
        Self {
            channel: Some(channel),
            ..Self::new(name)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_raw_data(mut self, raw: Vec<u8>) -> Self {
        self.raw_data = Some(raw);
        self
    }
}
