//! Core data model: the types named in the subscription key, handle,
//! offset, check-info and push-entry sections of the data model.

use std::fmt;

use crate::error::{TqError, TqResult};

/// Subscriptions are identified within a partition by a short opaque
/// byte string uniquely naming a `(topic, consumer-group)` pair. In
/// practice this is always human-readable text (`"topic/group"`), so we
/// store it as a boxed `str` rather than raw bytes.
pub const SUBKEY_MAX_LEN: usize = 192;

#[derive(Clone, Eq, PartialEq, Hash)]
pub struct SubKey(Box<str>);

impl SubKey {
    pub fn new(s: impl Into<String>) -> TqResult<Self> {
        let s = s.into();
        if s.is_empty() || s.len() > SUBKEY_MAX_LEN {
            return Err(TqError::Decode(format!(
                "subkey length {} out of bounds (1..={SUBKEY_MAX_LEN})",
                s.len()
            )));
        }
        Ok(Self(s.into_boxed_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubKey({:?})", self.0)
    }
}

impl fmt::Display for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sentinel for "no consumer owns this handle yet".
pub const NO_CONSUMER: i64 = -1;

/// The execution variant a subscription was created with.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum SubType {
    Column,
    Table,
    Db,
}

/// A resume position. `Log` offsets are totally ordered among themselves;
/// every other variant is only comparable to itself (and even then,
/// trivially).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum Offset {
    Log(i64),
    SnapshotData { uid: i64, ts: i64 },
    SnapshotMeta { uid: i64 },
    ResetEarliest,
    ResetLatest,
    ResetNone,
}

impl Offset {
    pub fn version(&self) -> Option<i64> {
        match self {
            Offset::Log(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_reset_hint(&self) -> bool {
        matches!(self, Offset::ResetEarliest | Offset::ResetLatest | Offset::ResetNone)
    }

    /// §3: "a ≤ b iff both are LOG and a.version ≤ b.version"; offsets
    /// of differing or non-LOG kinds are not comparable under this rule.
    pub fn log_le(&self, other: &Offset) -> bool {
        matches!((self, other), (Offset::Log(a), Offset::Log(b)) if a <= b)
    }
}

/// Per-topic list of columns forbidden from schema change (component B).
#[derive(Clone, Debug)]
pub struct CheckInfo {
    pub topic: String,
    pub table_uid: i64,
    pub forbidden_column_ids: Vec<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subkey_rejects_empty_and_oversized() {
        assert!(SubKey::new("").is_err());
        assert!(SubKey::new("a".repeat(SUBKEY_MAX_LEN + 1)).is_err());
        assert!(SubKey::new("topic/group").is_ok());
    }

    #[test]
    fn log_offsets_compare_by_version() {
        assert!(Offset::Log(1).log_le(&Offset::Log(2)));
        assert!(Offset::Log(2).log_le(&Offset::Log(2)));
        assert!(!Offset::Log(3).log_le(&Offset::Log(2)));
    }

    #[test]
    fn non_log_offsets_are_never_log_comparable() {
        assert!(!Offset::SnapshotData { uid: 0, ts: 0 }.log_le(&Offset::Log(2)));
        assert!(!Offset::Log(2).log_le(&Offset::SnapshotData { uid: 0, ts: 0 }));
    }
}
