//! Component C: the handle registry (§4.C), and the shared `pushLock`
//! latch that also guards component D (§5 "Locking discipline").
//!
//! The registry and the push-wait table are modeled as one
//! `RwLock`-guarded structure rather than two independently-locked maps,
//! because the spec requires them to serialize against each other and
//! against the `COLUMN` poll's scan-then-park decision as a single
//! critical section — matching `spacetimedb-core`'s pattern of folding
//! related maps into one `SubscriptionManager` behind one lock
//! (`crates/core/src/subscription/module_subscription_manager.rs`).

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::collab::{ExecPipeline, ExecSpec, Meta, QExec, Wal, WalReader, WalRefHandle};
use crate::data::{Offset, SubKey, SubType, NO_CONSUMER};
use crate::error::{TqError, TqResult};
use crate::push_wait::PushEntry;

/// Releases its WAL ref exactly once, on drop.
pub struct WalRefGuard {
    wal: Arc<dyn Wal>,
    ref_id: u64,
    version: i64,
}

impl WalRefGuard {
    pub fn new(wal: Arc<dyn Wal>, handle: WalRefHandle) -> Self {
        Self { wal, ref_id: handle.ref_id, version: handle.version }
    }

    pub fn version(&self) -> i64 {
        self.version
    }
}

impl Drop for WalRefGuard {
    fn drop(&mut self) {
        self.wal.close_ref(self.ref_id);
    }
}

/// One subscription's execution state (§3 "Handle").
pub struct Handle {
    pub subkey: SubKey,
    consumer_id: AtomicI64,
    epoch: AtomicI32,
    pub sub_type: SubType,
    pub fetch_meta: bool,
    pub snapshot_ver: i64,
    wal_ref: parking_lot::Mutex<WalRefGuard>,
    pub wal_reader: parking_lot::Mutex<Option<Box<dyn WalReader>>>,
    pub exec: parking_lot::Mutex<Box<dyn ExecPipeline>>,
}

impl Handle {
    pub fn consumer_id(&self) -> i64 {
        self.consumer_id.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> i32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Epoch CAS loop (§4.E step 1): never decreases. A single atomic
    /// `fetch_max` rather than a literal compare-and-swap loop — the
    /// loop in the original is a portability artifact (§9).
    pub fn advance_epoch_towards(&self, req_epoch: i32) {
        self.epoch.fetch_max(req_epoch, Ordering::AcqRel);
    }

    fn reset_epoch_and_bump(&self) {
        self.epoch.store(0, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn set_consumer(&self, consumer_id: i64) {
        self.consumer_id.store(consumer_id, Ordering::Release);
    }

    pub fn wal_ref_version(&self) -> i64 {
        self.wal_ref.lock().version()
    }

    /// Replaces the handle's WAL ref, releasing the old pin (via
    /// `WalRefGuard::drop`) once the new one is installed. Used by
    /// offset commit to advance the ref to the newly-committed version
    /// (SPEC_FULL §3, "offset commit ... also calls walRefVer").
    pub fn advance_wal_ref(&self, new_ref: WalRefGuard) {
        *self.wal_ref.lock() = new_ref;
    }
}

struct Inner {
    handles: hashbrown::HashMap<SubKey, Arc<Handle>>,
    push_wait: hashbrown::HashMap<SubKey, PushEntry>,
}

/// Outcome of [`HandleRegistry::column_scan_and_park_if_caught_up`].
pub enum ColumnPollOutcome {
    Respond { blocks: Vec<crate::collab::DataBlock>, rsp_offset: Offset, rpc: Box<dyn crate::collab::RpcHandle> },
    Parked,
}

pub struct HandleRegistry {
    inner: RwLock<Inner>,
    wal: Arc<dyn Wal>,
    qexec: Arc<dyn QExec>,
    meta: Arc<dyn Meta>,
    wal_reader_capacity: usize,
}

/// Everything needed to create or rebalance a handle (`SUBSCRIBE`, §4.C).
pub struct SubscribeReq<'a> {
    pub subkey: SubKey,
    pub new_consumer_id: i64,
    pub old_consumer_id: i64,
    pub sub_type: SubType,
    pub with_meta: bool,
    pub qmsg: &'a [u8],
    pub suid: Option<i64>,
}

impl HandleRegistry {
    pub fn new(
        wal: Arc<dyn Wal>,
        qexec: Arc<dyn QExec>,
        meta: Arc<dyn Meta>,
        wal_reader_capacity: usize,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                handles: hashbrown::HashMap::new(),
                push_wait: hashbrown::HashMap::new(),
            }),
            wal,
            qexec,
            meta,
            wal_reader_capacity,
        }
    }

    pub fn get(&self, subkey: &SubKey) -> Option<Arc<Handle>> {
        self.inner.read().handles.get(subkey).cloned()
    }

    /// `SUBSCRIBE` (§4.C): create on first sight, rebalance thereafter.
    pub fn subscribe(&self, req: SubscribeReq<'_>) -> TqResult<Arc<Handle>> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.handles.get(&req.subkey).cloned() {
            // Rebalance: epoch resets to exactly 0 then bumps to 1, the
            // new owner installs, and a COLUMN pipeline is torn down so
            // the next poll rebuilds it fresh.
            existing.reset_epoch_and_bump();
            existing.set_consumer(req.new_consumer_id);
            if matches!(existing.sub_type, SubType::Column) {
                existing.exec.lock().close_tsdb_reader();
            }
            self.persist(&existing)?;
            return Ok(existing);
        }

        if req.new_consumer_id == NO_CONSUMER {
            return Err(TqError::Decode("subscribe with no consumer on a fresh subkey".into()));
        }

        let wal_ref = WalRefGuard::new(self.wal.clone(), self.wal.ref_committed_ver()?);
        let snapshot_ver = wal_ref.version();

        let (exec, wal_reader) = match req.sub_type {
            SubType::Column => {
                let exec = self.qexec.compile(ExecSpec::Column { qmsg: req.qmsg }, snapshot_ver)?;
                (exec, None)
            }
            SubType::Db => {
                let mut reader = self.wal.open_reader();
                reader.set_capacity(self.wal_reader_capacity);
                let exec =
                    self.qexec.compile(ExecSpec::Db { filter_out_table_uids: vec![] }, snapshot_ver)?;
                (exec, Some(reader))
            }
            SubType::Table => {
                let mut reader = self.wal.open_reader();
                reader.set_capacity(self.wal_reader_capacity);
                let suid = req.suid.ok_or_else(|| {
                    TqError::Decode("TABLE subscribe missing suid".into())
                })?;
                let exec = self.qexec.compile(
                    ExecSpec::Table { suid, child_table_uids: vec![] },
                    snapshot_ver,
                )?;
                (exec, Some(reader))
            }
        };

        let handle = Arc::new(Handle {
            subkey: req.subkey.clone(),
            consumer_id: AtomicI64::new(req.new_consumer_id),
            epoch: AtomicI32::new(0),
            sub_type: req.sub_type,
            fetch_meta: req.with_meta,
            snapshot_ver,
            wal_ref: parking_lot::Mutex::new(wal_ref),
            wal_reader: parking_lot::Mutex::new(wal_reader),
            exec: parking_lot::Mutex::new(exec),
        });

        inner.handles.insert(req.subkey.clone(), handle.clone());
        drop(inner);
        self.persist(&handle)?;
        Ok(handle)
    }

    /// `DELETE_SUB` (§4.C unsubscribe). Each step is best-effort: a
    /// missing row never fails the RPC, matching `tqProcessDeleteSubReq`
    /// removing the push-wait entry *before* the handle is freed.
    pub fn unsubscribe(&self, subkey: &SubKey) {
        let mut inner = self.inner.write();
        if inner.push_wait.remove(subkey).is_none() {
            tracing::debug!(subkey = %subkey, "unsubscribe: no parked push entry");
        }
        let removed = inner.handles.remove(subkey);
        drop(inner);

        if removed.is_none() {
            tracing::warn!(subkey = %subkey, "unsubscribe: no such handle");
        }
        // `removed`'s WalRefGuard drops here, releasing the WAL ref.
        if let Err(e) = self.meta.delete_handle(subkey) {
            tracing::warn!(subkey = %subkey, error = %e, "unsubscribe: failed to delete persisted handle");
        }
    }

    pub fn insert_push_entry(&self, subkey: SubKey, entry: PushEntry) {
        let mut inner = self.inner.write();
        inner.push_wait.insert(subkey, entry);
    }

    pub fn take_push_entry(&self, subkey: &SubKey) -> Option<PushEntry> {
        self.inner.write().push_wait.remove(subkey)
    }

    pub fn has_push_entry(&self, subkey: &SubKey) -> bool {
        self.inner.read().push_wait.contains_key(subkey)
    }

    /// `COLUMN` poll variant (§4.E step 3): scan and the park decision
    /// happen under one hold of the write latch, so a concurrent
    /// rebalance or unsubscribe cannot interleave between "found
    /// nothing new" and "parked".
    ///
    pub fn column_scan_and_park_if_caught_up(
        &self,
        handle: &Handle,
        from: Offset,
        rpc: Box<dyn crate::collab::RpcHandle>,
        envelope: crate::collab::ResponseEnvelope,
    ) -> TqResult<ColumnPollOutcome> {
        let mut inner = self.inner.write();
        let (blocks, new_offset) = handle.exec.lock().scan_data(from)?;

        let caught_up = blocks.is_empty() && from.log_le(&new_offset) && new_offset.log_le(&from);
        if caught_up {
            inner
                .push_wait
                .insert(handle.subkey.clone(), PushEntry::new(rpc, envelope, new_offset));
            return Ok(ColumnPollOutcome::Parked);
        }
        Ok(ColumnPollOutcome::Respond { blocks, rsp_offset: new_offset, rpc })
    }

    fn persist(&self, handle: &Handle) -> TqResult<()> {
        // The persisted snapshot is opaque to this crate's scope (no
        // generated codec is specified); a minimal marker is enough to
        // exercise the save/delete contract against `meta`.
        let marker = format!("{}:{}:{}", handle.consumer_id(), handle.epoch(), handle.snapshot_ver);
        self.meta.save_handle(&handle.subkey, marker.as_bytes())
    }
}
