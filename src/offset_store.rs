//! Component A: the durable `subkey → offset` map (§4.A).
//!
//! A write-through cache over `meta`'s persisted offset table. The only
//! place an incoming offset is mutated rather than copied verbatim is
//! the commit-boundary bump rule (§9 design note iv): a committed `LOG`
//! offset that is exactly one behind the write transaction's own
//! version is advanced by one, because that transaction has, by the
//! time the commit lands here, already been applied to the WAL.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::collab::Meta;
use crate::data::{Offset, SubKey};
use crate::error::TqResult;

pub struct OffsetStore {
    cache: RwLock<HashMap<SubKey, Offset>>,
    meta: Arc<dyn Meta>,
}

impl OffsetStore {
    pub fn new(meta: Arc<dyn Meta>) -> Self {
        Self { cache: RwLock::new(HashMap::new()), meta }
    }

    pub fn read(&self, subkey: &SubKey) -> Option<Offset> {
        self.cache.read().get(subkey).copied()
    }

    /// Overwrites the stored offset iff `offset` is strictly greater by
    /// the §3 ordering rule, or if nothing is stored yet, and persists
    /// the new value through `meta`. Always returns `Ok`; a stale write
    /// is a silent no-op, not an error (invariant 3 / testable property
    /// 1); a persistence failure is logged, not propagated, since the
    /// in-memory cache — the copy the poll engine actually reads from —
    /// is already correct.
    pub fn write(&self, subkey: &SubKey, offset: Offset) -> TqResult<()> {
        let mut cache = self.cache.write();
        // Monotonicity (§3) only constrains LOG-vs-LOG writes; a non-LOG
        // incoming offset, or a transition across offset kinds, always
        // takes effect.
        let stale = matches!(
            (cache.get(subkey), offset),
            (Some(Offset::Log(existing_v)), Offset::Log(new_v)) if new_v <= *existing_v
        );
        if !stale {
            cache.insert(subkey.clone(), offset);
            drop(cache);
            if let Err(e) = self.meta.save_offset(subkey, offset) {
                tracing::warn!(subkey = %subkey, error = %e, "offset write: failed to persist");
            }
        }
        Ok(())
    }

    /// Applies the commit-boundary bump rule, then writes.
    ///
    /// `commit_sversion` is the write transaction's own WAL version. If
    /// the incoming committed offset is `LOG(v)` with `v + 1 ==
    /// commit_sversion`, it is bumped to `LOG(v + 1)` before the
    /// monotonicity check in [`Self::write`] runs.
    pub fn commit(&self, subkey: &SubKey, mut offset: Offset, commit_sversion: i64) -> TqResult<()> {
        if let Offset::Log(v) = offset {
            if v + 1 == commit_sversion {
                offset = Offset::Log(v + 1);
            }
        }
        self.write(subkey, offset)
    }

    /// Removes from the cache and asks `meta` to drop the persisted row.
    /// Per §4.A, a missing cache entry here is not an error — only
    /// logged — and a persistence failure is logged rather than
    /// propagated, matching `delete_handle`'s best-effort cleanup style.
    pub fn delete(&self, subkey: &SubKey) {
        if self.cache.write().remove(subkey).is_none() {
            tracing::debug!(subkey = %subkey, "offset delete: no cached entry");
        }
        if let Err(e) = self.meta.delete_offset(subkey) {
            tracing::warn!(subkey = %subkey, error = %e, "offset delete: failed to remove persisted row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::testutil::FakeMeta;

    fn k() -> SubKey {
        SubKey::new("topic/group").unwrap()
    }

    fn store() -> (OffsetStore, Arc<FakeMeta>) {
        let meta = FakeMeta::new();
        (OffsetStore::new(meta.clone()), meta)
    }

    #[test]
    fn write_is_monotone() {
        let (store, _meta) = store();
        store.write(&k(), Offset::Log(10)).unwrap();
        store.write(&k(), Offset::Log(5)).unwrap();
        assert_eq!(store.read(&k()), Some(Offset::Log(10)));
        store.write(&k(), Offset::Log(20)).unwrap();
        assert_eq!(store.read(&k()), Some(Offset::Log(20)));
    }

    #[test]
    fn write_persists_through_meta() {
        let (store, meta) = store();
        store.write(&k(), Offset::Log(10)).unwrap();
        assert_eq!(meta.offsets.lock().unwrap().get("topic/group"), Some(&Offset::Log(10)));
        // A stale write is not re-persisted past the monotone value.
        store.write(&k(), Offset::Log(1)).unwrap();
        assert_eq!(meta.offsets.lock().unwrap().get("topic/group"), Some(&Offset::Log(10)));
    }

    #[test]
    fn commit_bumps_at_boundary() {
        let (store, _meta) = store();
        // sversion 42 means this write touched version 42; a commit of
        // LOG(41) should bump to LOG(42).
        store.commit(&k(), Offset::Log(41), 42).unwrap();
        assert_eq!(store.read(&k()), Some(Offset::Log(42)));
    }

    #[test]
    fn commit_does_not_bump_off_boundary() {
        let (store, _meta) = store();
        store.commit(&k(), Offset::Log(30), 42).unwrap();
        assert_eq!(store.read(&k()), Some(Offset::Log(30)));
    }

    #[test]
    fn delete_missing_is_not_an_error() {
        let (store, _meta) = store();
        store.delete(&k());
    }

    #[test]
    fn delete_removes_persisted_row() {
        let (store, meta) = store();
        store.write(&k(), Offset::Log(10)).unwrap();
        store.delete(&k());
        assert_eq!(store.read(&k()), None);
        assert!(meta.offsets.lock().unwrap().get("topic/group").is_none());
    }

    #[test]
    fn non_log_offsets_always_overwrite() {
        let (store, _meta) = store();
        store.write(&k(), Offset::SnapshotData { uid: 1, ts: 2 }).unwrap();
        store.write(&k(), Offset::SnapshotMeta { uid: 9 }).unwrap();
        assert_eq!(store.read(&k()), Some(Offset::SnapshotMeta { uid: 9 }));
    }
}
