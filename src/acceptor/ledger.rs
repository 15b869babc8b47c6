//! In-session tally of accepted notes.
//!
//! Notes are only ever added. `total_value` is kept in step with the entries
//! on every credit; `recomputed_total` exists so callers (and tests) can check
//! the invariant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::denomination::{Denomination, DenominationCatalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub count: u64,
    /// Minor units.
    pub face_value: u64,
}

impl LedgerEntry {
    pub fn value(&self) -> u64 {
        self.count.saturating_mul(self.face_value)
    }
}

/// Point-in-time copy of a ledger, returned on stop and sent with the final
/// notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub total_value: u64,
    pub entries: BTreeMap<String, LedgerEntry>,
}

impl LedgerSnapshot {
    pub fn count_of(&self, label: &str) -> u64 {
        self.entries.get(label).map(|e| e.count).unwrap_or(0)
    }

    pub fn notes_accepted(&self) -> u64 {
        self.entries.values().map(|e| e.count).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    entries: BTreeMap<String, LedgerEntry>,
    total_value: u64,
}

impl Ledger {
    /// Empty ledger with a zero entry for every catalog denomination.
    pub fn for_catalog(catalog: &DenominationCatalog) -> Self {
        let entries = catalog
            .iter()
            .map(|d| {
                (
                    d.label.clone(),
                    LedgerEntry {
                        count: 0,
                        face_value: d.face_value,
                    },
                )
            })
            .collect();
        Self {
            entries,
            total_value: 0,
        }
    }

    /// Count one accepted note. Returns the updated entry.
    ///
    /// An entry only ever holds one face value. If the label is already taken
    /// by a note of another value, the note is booked under a channel-qualified
    /// key instead of being credited at the wrong value.
    pub fn credit(&mut self, denomination: &Denomination) -> LedgerEntry {
        let key = match self.entries.get(&denomination.label) {
            Some(existing) if existing.face_value != denomination.face_value => {
                let key = format!("{} (channel {})", denomination.label, denomination.channel);
                warn!(
                    label = %denomination.label,
                    channel = denomination.channel,
                    face_value = denomination.face_value,
                    booked_face_value = existing.face_value,
                    key = %key,
                    "Ledger label clash, booking note separately"
                );
                key
            }
            _ => denomination.label.clone(),
        };
        let entry = self.entries.entry(key).or_insert(LedgerEntry {
            count: 0,
            face_value: denomination.face_value,
        });
        entry.count += 1;
        self.total_value = self.total_value.saturating_add(entry.face_value);

        info!(
            label = %denomination.label,
            count = entry.count,
            total_value = self.total_value,
            "Ledger credited"
        );
        *entry
    }

    pub fn total_value(&self) -> u64 {
        self.total_value
    }

    pub fn entry(&self, label: &str) -> Option<&LedgerEntry> {
        self.entries.get(label)
    }

    /// Σ count × face value, computed from scratch.
    pub fn recomputed_total(&self) -> u64 {
        self.entries
            .values()
            .fold(0u64, |acc, e| acc.saturating_add(e.value()))
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            total_value: self.total_value,
            entries: self.entries.clone(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
