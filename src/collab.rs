//! Traits describing the collaborators the core calls into: `wal`,
//! `qexec`, `rpc`, `meta`, `stream`. These are out of scope for this
//! crate (per spec.md §1) — it only depends on the interface shape.
//! `testutil` (behind `#[cfg(test)]`) provides in-memory fakes so the
//! core logic can be exercised without a real storage engine.

use bytes::Bytes;

use crate::data::{CheckInfo, Offset, SubKey};
use crate::error::TqResult;
use crate::stream_task::{RecoverStep2Req, StreamDataItem, StreamTaskSnapshot};

/// One record read from the WAL: either a row-submit batch or a
/// metadata message (schema change, etc).
#[derive(Clone, Debug)]
pub enum WalRecord {
    Submit { version: i64, payload: Bytes },
    Meta { version: i64, msg_type: u16, payload: Bytes },
}

impl WalRecord {
    pub fn version(&self) -> i64 {
        match self {
            WalRecord::Submit { version, .. } | WalRecord::Meta { version, .. } => *version,
        }
    }
}

/// A version-ref handle, as returned by the pin operations. Carries no
/// behavior of its own; the owner is responsible for calling
/// [`Wal::close_ref`] exactly once (see [`crate::handle::WalRefGuard`]).
#[derive(Clone, Copy, Debug)]
pub struct WalRefHandle {
    pub ref_id: u64,
    pub version: i64,
}

/// A cursor into the WAL, used by `TABLE`/`DB` subscriptions.
pub trait WalReader: Send {
    fn set_capacity(&mut self, bytes: usize);
    fn fetch_log(&mut self, version: i64) -> TqResult<WalRecord>;
}

/// The write-ahead log collaborator (§6).
pub trait Wal: Send + Sync {
    fn ref_committed_ver(&self) -> TqResult<WalRefHandle>;
    fn ref_first_ver(&self) -> TqResult<WalRefHandle>;
    fn ref_ver(&self, version: i64) -> TqResult<WalRefHandle>;
    fn close_ref(&self, ref_id: u64);
    fn open_reader(&self) -> Box<dyn WalReader>;
    fn get_last_ver(&self) -> i64;
    fn get_committed_ver(&self) -> i64;
}

/// A scanned data block, opaque to the core beyond being a unit of
/// response payload.
#[derive(Clone, Debug)]
pub struct DataBlock(pub Bytes);

/// A metadata record forwarded to a `fetchMeta` consumer.
#[derive(Clone, Debug)]
pub struct MetaRecord {
    pub msg_type: u16,
    pub payload: Bytes,
}

/// The per-handle compiled execution pipeline (§4.C "exec"). Built once
/// at subscribe time by [`QExec`]; `COLUMN` pipelines may be torn down
/// and rebuilt across a rebalance.
pub trait ExecPipeline: Send {
    /// `COLUMN` variant: run the compiled query from `from`, returning
    /// any blocks produced and the position to resume from next time.
    fn scan_data(&mut self, from: Offset) -> TqResult<(Vec<DataBlock>, Offset)>;

    /// `DB`/`TABLE` variant, snapshot phase: returns data and/or meta
    /// blocks plus the offset to continue from once the snapshot is
    /// exhausted.
    fn scan_taosx(&mut self, from: Offset) -> TqResult<TaosxScanResult>;

    /// `DB`/`TABLE` variant, WAL phase: process one submit record.
    fn scan_submit(&mut self, record: &WalRecord) -> TqResult<Vec<DataBlock>>;

    /// Release any tsdb reader held by this pipeline (called across a
    /// `COLUMN` rebalance so the next poll rebuilds it).
    fn close_tsdb_reader(&mut self);
}

pub struct TaosxScanResult {
    pub data: Vec<DataBlock>,
    pub meta: Option<MetaRecord>,
    pub rsp_offset: Offset,
}

/// Per-subscription request to build an execution pipeline at
/// subscribe time (§4.C).
pub enum ExecSpec<'a> {
    Column { qmsg: &'a [u8] },
    Db { filter_out_table_uids: Vec<i64> },
    Table { suid: i64, child_table_uids: Vec<i64> },
}

/// The query/execution engine collaborator (§6).
pub trait QExec: Send + Sync {
    fn compile(&self, spec: ExecSpec<'_>, snapshot_ver: i64) -> TqResult<Box<dyn ExecPipeline>>;
}

/// A reply sink for exactly one poll RPC. Consumed on send so the
/// "answered exactly once" invariant (§3 invariant 5) is enforceable at
/// the type level: once sent, the handle cannot be sent again.
pub trait RpcHandle: Send {
    fn send(self: Box<Self>, envelope: ResponseEnvelope, body: Bytes) -> TqResult<()>;
}

/// Shared header every poll response carries (§4.E step 4).
#[derive(Clone, Copy, Debug)]
pub struct ResponseEnvelope {
    pub msg_type: MqMsgType,
    pub epoch: i32,
    pub consumer_id: i64,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum MqMsgType {
    PollRsp,
    PollMetaRsp,
    TaosxRsp,
}

/// The RPC transport collaborator (§6): allocation plus send. Real
/// encoding of `Data`/`Taosx`/`Meta` response bodies happens one layer
/// up (see `poll_engine::encode_*`); this trait only models the
/// size-probe-then-allocate-then-send shape the original performs
/// (`tEncodeSize` -> `rpcMallocCont` -> encode in place -> `tmsgSendRsp`).
pub trait RpcAlloc: Send + Sync {
    fn malloc_cont(&self, size: usize) -> Vec<u8>;
}

/// The metadata store collaborator (§6): durable handles/offsets/check-infos.
pub trait Meta: Send + Sync {
    fn save_handle(&self, subkey: &SubKey, snapshot: &[u8]) -> TqResult<()>;
    fn delete_handle(&self, subkey: &SubKey) -> TqResult<()>;
    fn save_offset(&self, subkey: &SubKey, offset: crate::data::Offset) -> TqResult<()>;
    fn delete_offset(&self, subkey: &SubKey) -> TqResult<()>;
    fn save_check_info(&self, info: &CheckInfo) -> TqResult<()>;
    fn delete_check_info(&self, topic: &str) -> TqResult<()>;
    fn save_task(&self, task_id: u32, snapshot: &StreamTaskSnapshot) -> TqResult<()>;
    fn delete_task(&self, task_id: u32) -> TqResult<()>;
}

/// The stream-processing collaborator (§6): task codec, recovery steps
/// and dispatch hooks. The coordinator only drives ordering; the actual
/// work described here is implemented elsewhere.
pub trait StreamExt: Send + Sync {
    /// Sends a `TASK_CHECK_REQ` to a downstream task (possibly on
    /// another node); the matching `TASK_CHECK_RSP` arrives later as an
    /// ordinary inbound RPC handled by the coordinator directly.
    fn send_check_req(&self, upstream_task_id: u32, downstream_task_id: u32, downstream_node_id: i32) -> TqResult<()>;

    fn source_recover_scan_step1(&self, task_id: u32) -> TqResult<()>;
    fn source_recover_scan_step2(&self, task_id: u32, sversion: i64) -> TqResult<()>;
    fn build_source_recover2_req(&self, task_id: u32) -> TqResult<RecoverStep2Req>;
    fn restore_param(&self, task_id: u32) -> TqResult<()>;
    fn dispatch_recover_finish_req(&self, task_id: u32) -> TqResult<()>;
    fn task_input(&self, task_id: u32, item: StreamDataItem) -> TqResult<()>;
    fn task_input_fail(&self, task_id: u32);
    fn sched_exec(&self, task_id: u32) -> TqResult<()>;
    fn setup_trigger(&self, task_id: u32);
}

#[cfg(test)]
pub mod testutil {
    //! In-memory fakes for the collaborator traits, analogous to the
    //! teacher's `ClientConnectionSender::dummy()` / `TestDB::durable()`.

    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use hashbrown::HashMap;

    use super::*;

    #[derive(Default)]
    pub struct FakeWalState {
        pub records: Vec<WalRecord>,
        pub committed_ver: i64,
        pub first_ver: i64,
    }

    pub struct FakeWal {
        state: Arc<Mutex<FakeWalState>>,
        next_ref_id: AtomicU64,
    }

    impl FakeWal {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Arc::new(Mutex::new(FakeWalState::default())),
                next_ref_id: AtomicU64::new(1),
            })
        }

        pub fn push_submit(&self, payload: impl Into<Bytes>) -> i64 {
            let mut s = self.state.lock().unwrap();
            let ver = s.committed_ver + 1;
            s.records.push(WalRecord::Submit { version: ver, payload: payload.into() });
            s.committed_ver = ver;
            ver
        }

        pub fn push_meta(&self, msg_type: u16, payload: impl Into<Bytes>) -> i64 {
            let mut s = self.state.lock().unwrap();
            let ver = s.committed_ver + 1;
            s.records.push(WalRecord::Meta { version: ver, msg_type, payload: payload.into() });
            s.committed_ver = ver;
            ver
        }
    }

    impl Wal for FakeWal {
        fn ref_committed_ver(&self) -> TqResult<WalRefHandle> {
            let s = self.state.lock().unwrap();
            Ok(WalRefHandle {
                ref_id: self.next_ref_id.fetch_add(1, Ordering::Relaxed),
                version: s.committed_ver,
            })
        }

        fn ref_first_ver(&self) -> TqResult<WalRefHandle> {
            let s = self.state.lock().unwrap();
            Ok(WalRefHandle {
                ref_id: self.next_ref_id.fetch_add(1, Ordering::Relaxed),
                version: s.first_ver + 1,
            })
        }

        fn ref_ver(&self, version: i64) -> TqResult<WalRefHandle> {
            Ok(WalRefHandle { ref_id: self.next_ref_id.fetch_add(1, Ordering::Relaxed), version })
        }

        fn close_ref(&self, _ref_id: u64) {}

        fn open_reader(&self) -> Box<dyn WalReader> {
            Box::new(FakeWalReader { state: self.state.clone(), capacity: 0 })
        }

        fn get_last_ver(&self) -> i64 {
            self.state.lock().unwrap().committed_ver
        }

        fn get_committed_ver(&self) -> i64 {
            self.state.lock().unwrap().committed_ver
        }
    }

    struct FakeWalReader {
        state: Arc<Mutex<FakeWalState>>,
        capacity: usize,
    }

    impl WalReader for FakeWalReader {
        fn set_capacity(&mut self, bytes: usize) {
            self.capacity = bytes;
        }

        fn fetch_log(&mut self, version: i64) -> TqResult<WalRecord> {
            let s = self.state.lock().unwrap();
            s.records
                .iter()
                .find(|r| r.version() == version)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such wal version {version}").into())
        }
    }

    #[derive(Default)]
    pub struct FakeMeta {
        pub handles: Mutex<HashMap<String, Vec<u8>>>,
        pub offsets: Mutex<HashMap<String, crate::data::Offset>>,
        pub check_infos: Mutex<HashMap<String, ()>>,
        pub tasks: Mutex<HashMap<u32, StreamTaskSnapshot>>,
    }

    impl FakeMeta {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    impl Meta for FakeMeta {
        fn save_handle(&self, subkey: &SubKey, snapshot: &[u8]) -> TqResult<()> {
            self.handles.lock().unwrap().insert(subkey.as_str().to_owned(), snapshot.to_vec());
            Ok(())
        }

        fn delete_handle(&self, subkey: &SubKey) -> TqResult<()> {
            self.handles.lock().unwrap().remove(subkey.as_str());
            Ok(())
        }

        fn save_offset(&self, subkey: &SubKey, offset: crate::data::Offset) -> TqResult<()> {
            self.offsets.lock().unwrap().insert(subkey.as_str().to_owned(), offset);
            Ok(())
        }

        fn delete_offset(&self, subkey: &SubKey) -> TqResult<()> {
            self.offsets.lock().unwrap().remove(subkey.as_str());
            Ok(())
        }

        fn save_check_info(&self, info: &CheckInfo) -> TqResult<()> {
            self.check_infos.lock().unwrap().insert(info.topic.clone(), ());
            Ok(())
        }

        fn delete_check_info(&self, topic: &str) -> TqResult<()> {
            self.check_infos.lock().unwrap().remove(topic);
            Ok(())
        }

        fn save_task(&self, task_id: u32, snapshot: &StreamTaskSnapshot) -> TqResult<()> {
            self.tasks.lock().unwrap().insert(task_id, snapshot.clone());
            Ok(())
        }

        fn delete_task(&self, task_id: u32) -> TqResult<()> {
            self.tasks.lock().unwrap().remove(&task_id);
            Ok(())
        }
    }

    /// Records every response sent through it, for assertion in tests.
    #[derive(Default)]
    pub struct RecordingRpc {
        pub sent: Mutex<Vec<(ResponseEnvelope, Bytes)>>,
    }

    impl RecordingRpc {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    pub struct RecordingRpcHandle(pub Arc<RecordingRpc>);

    impl RpcHandle for RecordingRpcHandle {
        fn send(self: Box<Self>, envelope: ResponseEnvelope, body: Bytes) -> TqResult<()> {
            self.0.sent.lock().unwrap().push((envelope, body));
            Ok(())
        }
    }

    pub struct FakeExecPipeline {
        pub scripted_data: Vec<(Vec<DataBlock>, Offset)>,
    }

    impl ExecPipeline for FakeExecPipeline {
        fn scan_data(&mut self, _from: Offset) -> TqResult<(Vec<DataBlock>, Offset)> {
            if self.scripted_data.is_empty() {
                return Ok((vec![], Offset::Log(0)));
            }
            Ok(self.scripted_data.remove(0))
        }

        fn scan_taosx(&mut self, from: Offset) -> TqResult<TaosxScanResult> {
            Ok(TaosxScanResult { data: vec![], meta: None, rsp_offset: from })
        }

        fn scan_submit(&mut self, record: &WalRecord) -> TqResult<Vec<DataBlock>> {
            match record {
                WalRecord::Submit { payload, .. } => Ok(vec![DataBlock(payload.clone())]),
                WalRecord::Meta { .. } => Ok(vec![]),
            }
        }

        fn close_tsdb_reader(&mut self) {}
    }

    pub struct FakeQExec;

    impl QExec for FakeQExec {
        fn compile(&self, _spec: ExecSpec<'_>, _snapshot_ver: i64) -> TqResult<Box<dyn ExecPipeline>> {
            Ok(Box::new(FakeExecPipeline { scripted_data: vec![] }))
        }
    }

    #[derive(Default)]
    pub struct FakeStream {
        pub inputs: Mutex<HashMap<u32, Vec<StreamDataItem>>>,
        pub failed: Mutex<Vec<u32>>,
        pub recover_finished: Mutex<Vec<u32>>,
        pub checks_sent: Mutex<Vec<u32>>,
        next_seq: AtomicI64,
    }

    impl FakeStream {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    impl StreamExt for FakeStream {
        fn send_check_req(&self, _upstream_task_id: u32, downstream_task_id: u32, _downstream_node_id: i32) -> TqResult<()> {
            self.checks_sent.lock().unwrap().push(downstream_task_id);
            Ok(())
        }

        fn source_recover_scan_step1(&self, _task_id: u32) -> TqResult<()> {
            Ok(())
        }

        fn source_recover_scan_step2(&self, _task_id: u32, _sversion: i64) -> TqResult<()> {
            Ok(())
        }

        fn build_source_recover2_req(&self, task_id: u32) -> TqResult<RecoverStep2Req> {
            Ok(RecoverStep2Req { task_id, seq: self.next_seq.fetch_add(1, Ordering::Relaxed) })
        }

        fn restore_param(&self, _task_id: u32) -> TqResult<()> {
            Ok(())
        }

        fn dispatch_recover_finish_req(&self, task_id: u32) -> TqResult<()> {
            self.recover_finished.lock().unwrap().push(task_id);
            Ok(())
        }

        fn task_input(&self, task_id: u32, item: StreamDataItem) -> TqResult<()> {
            self.inputs.lock().unwrap().entry(task_id).or_default().push(item);
            Ok(())
        }

        fn task_input_fail(&self, task_id: u32) {
            self.failed.lock().unwrap().push(task_id);
        }

        fn sched_exec(&self, _task_id: u32) -> TqResult<()> {
            Ok(())
        }

        fn setup_trigger(&self, _task_id: u32) {}
    }
}
