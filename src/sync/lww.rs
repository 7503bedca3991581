// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last-writer-wins by `updated_at`.
//!
//! ```text
//! incoming.updated_at > existing  → Overwrite
//! incoming.updated_at < existing  → KeepExisting
//! equal, same content             → Skip
//! equal, different content        → pull: Overwrite iff existing is synced
//!                                   push: Overwrite (a pending local edit wins)
//! ```

use serde_json::Value;

use super::types::{record_int, record_text, SyncRecord};

/// Columns that describe replication state rather than row content.
const MARKER_ONLY: [&str; 2] = ["synced_at", "sync_status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer row arriving at the local store
    Pull,
    /// Local pending row arriving at the peer
    Push,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No row with this id on the receiving side.
    Insert,
    Overwrite,
    KeepExisting,
    /// Same version on both sides.
    Skip,
}

#[must_use]
pub fn decide(incoming: &SyncRecord, existing: Option<&SyncRecord>, direction: Direction) -> Decision {
    let Some(existing) = existing else {
        return Decision::Insert;
    };
    let theirs = record_int(incoming, "updated_at").unwrap_or(0);
    let ours = record_int(existing, "updated_at").unwrap_or(0);

    match theirs.cmp(&ours) {
        std::cmp::Ordering::Greater => Decision::Overwrite,
        std::cmp::Ordering::Less => Decision::KeepExisting,
        std::cmp::Ordering::Equal if same_content(incoming, existing) => Decision::Skip,
        std::cmp::Ordering::Equal => match direction {
            Direction::Pull if is_synced(existing) => Decision::Overwrite,
            Direction::Pull => Decision::KeepExisting,
            Direction::Push => Decision::Overwrite,
        },
    }
}

/// Write-time guard for a pulled row: `stored` is whatever the receiving
/// store holds when the write lands, which may be newer than the row the
/// decision was made on. The incoming row replaces it only if strictly
/// newer, or equally new while `stored` is already synced.
#[must_use]
pub fn supersedes(incoming: &SyncRecord, stored: &SyncRecord) -> bool {
    let theirs = record_int(incoming, "updated_at").unwrap_or(0);
    let ours = record_int(stored, "updated_at").unwrap_or(0);
    theirs > ours || (theirs == ours && is_synced(stored))
}

#[must_use]
pub fn is_synced(record: &SyncRecord) -> bool {
    record_text(record, "sync_status") == Some("synced")
}

/// Equal on every content column. A missing column counts as NULL, and
/// numbers compare by value so `100` and `100.0` match.
#[must_use]
pub fn same_content(a: &SyncRecord, b: &SyncRecord) -> bool {
    a.keys()
        .chain(b.keys())
        .filter(|k| !MARKER_ONLY.contains(&k.as_str()))
        .all(|k| values_equal(a.get(k).unwrap_or(&Value::Null), b.get(k).unwrap_or(&Value::Null)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}
