//! Denomination catalog: hardware channel → face value and label.
//!
//! The acceptor reports notes by channel number (1-based). The catalog is
//! immutable for the life of a session; an out-of-range channel resolves to
//! the `Unknown` denomination with a zero face value instead of failing.

use serde::{Deserialize, Serialize};

pub const UNKNOWN_LABEL: &str = "Unknown";

/// Configured note, before channel numbers are assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSpec {
    /// Face value in minor currency units (cents).
    pub value: u64,
    pub label: String,
}

impl NoteSpec {
    pub fn new(value: u64, label: impl Into<String>) -> Self {
        Self {
            value,
            label: label.into(),
        }
    }

    /// Channel layout of the stock EUR dataset.
    pub fn euro_notes() -> Vec<NoteSpec> {
        [
            (500, "5 EUR"),
            (1_000, "10 EUR"),
            (2_000, "20 EUR"),
            (5_000, "50 EUR"),
            (10_000, "100 EUR"),
            (20_000, "200 EUR"),
            (50_000, "500 EUR"),
        ]
        .into_iter()
        .map(|(value, label)| NoteSpec::new(value, label))
        .collect()
    }
}

/// A note denomination bound to its hardware channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Denomination {
    pub channel: u8,
    /// Minor units.
    pub face_value: u64,
    pub label: String,
}

impl Denomination {
    pub fn is_unknown(&self) -> bool {
        self.face_value == 0 && self.label == UNKNOWN_LABEL
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenominationCatalog {
    notes: Vec<Denomination>,
    unknown: Denomination,
}

impl DenominationCatalog {
    /// Build a catalog from notes listed in channel order.
    pub fn from_specs(specs: &[NoteSpec]) -> Self {
        let notes = specs
            .iter()
            .take(u8::MAX as usize)
            .enumerate()
            .map(|(idx, spec)| Denomination {
                channel: (idx + 1) as u8,
                face_value: spec.value,
                label: spec.label.clone(),
            })
            .collect();

        Self {
            notes,
            unknown: Denomination {
                channel: 0,
                face_value: 0,
                label: UNKNOWN_LABEL.to_string(),
            },
        }
    }

    pub fn euro() -> Self {
        Self::from_specs(&NoteSpec::euro_notes())
    }

    /// Resolve a hardware channel. Never fails: channel 0 and channels past
    /// the end of the catalog map to `Unknown`.
    pub fn resolve(&self, channel: u8) -> &Denomination {
        (channel as usize)
            .checked_sub(1)
            .and_then(|idx| self.notes.get(idx))
            .unwrap_or(&self.unknown)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Denomination> {
        self.notes.iter()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

impl Default for DenominationCatalog {
    fn default() -> Self {
        Self::euro()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
