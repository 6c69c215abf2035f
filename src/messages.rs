//! Wire message types for the RPCs the core handles (§6). Encoding is
//! left to the caller's codec; these are the decoded, typed shapes the
//! core logic operates on.

use bytes::Bytes;

use crate::collab::{DataBlock, MetaRecord, MqMsgType};
use crate::data::{Offset, SubType};

/// `POLL` (in).
#[derive(Clone, Debug)]
pub struct PollReq {
    pub consumer_id: i64,
    pub epoch: i32,
    pub subkey: String,
    /// Always a concrete type (§3); absence of a prior commit is
    /// expressed by one of the `Reset*` variants, not by `Option`.
    pub req_offset: Offset,
    pub use_snapshot: bool,
}

/// `POLL_RSP` (out) — the `COLUMN`-variant and WAL-submit-variant response.
#[derive(Clone, Debug)]
pub struct DataRsp {
    pub rsp_offset: Offset,
    pub blocks: Vec<DataBlock>,
}

/// `TAOSX_RSP` (out) — snapshot-phase response for `DB`/`TABLE`.
#[derive(Clone, Debug)]
pub struct TaosxRsp {
    pub rsp_offset: Offset,
    pub data: Vec<DataBlock>,
}

/// `POLL_META_RSP` (out).
#[derive(Clone, Debug)]
pub struct MetaRsp {
    pub rsp_offset: Offset,
    pub record: MetaRecord,
}

/// The three response bodies a poll can produce, tagged the way
/// [`MqMsgType`] tags the shared envelope.
#[derive(Clone, Debug)]
pub enum PollRspBody {
    Data(DataRsp),
    Meta(MetaRsp),
    Taosx(TaosxRsp),
}

impl PollRspBody {
    pub fn msg_type(&self) -> MqMsgType {
        match self {
            PollRspBody::Data(_) => MqMsgType::PollRsp,
            PollRspBody::Meta(_) => MqMsgType::PollMetaRsp,
            PollRspBody::Taosx(_) => MqMsgType::TaosxRsp,
        }
    }

    pub fn rsp_offset(&self) -> Offset {
        match self {
            PollRspBody::Data(r) => r.rsp_offset,
            PollRspBody::Meta(r) => r.rsp_offset,
            PollRspBody::Taosx(r) => r.rsp_offset,
        }
    }
}

/// `OFFSET_COMMIT` (in).
#[derive(Clone, Debug)]
pub struct OffsetCommitReq {
    pub subkey: String,
    pub offset: Offset,
    /// The write transaction's own version; used by the boundary-bump
    /// rule in §4.A. Supplied explicitly rather than inferred, since the
    /// core has no independent notion of "the current write version".
    pub commit_sversion: i64,
}

/// `SUBSCRIBE` (in) — create-or-rebalance a handle.
#[derive(Clone, Debug)]
pub struct SubscribeReq {
    pub subkey: String,
    pub vg_id: i32,
    pub new_consumer_id: i64,
    pub old_consumer_id: i64,
    pub sub_type: SubType,
    pub with_meta: bool,
    pub qmsg: Bytes,
    pub suid: Option<i64>,
}

/// `DELETE_SUB` (in).
#[derive(Clone, Debug)]
pub struct DeleteSubReq {
    pub subkey: String,
}

/// `ADD_CHECK_INFO` (in).
#[derive(Clone, Debug)]
pub struct AddCheckInfoReq {
    pub topic: String,
    pub table_uid: i64,
    pub forbidden_column_ids: Vec<i32>,
}

/// `DEL_CHECK_INFO` (in).
#[derive(Clone, Debug)]
pub struct DelCheckInfoReq {
    pub topic: String,
}

/// `TASK_DEPLOY` (in).
#[derive(Clone, Debug)]
pub struct TaskDeployReq {
    pub task_id: u32,
    pub level: crate::stream_task::TaskLevel,
    pub fill_history: bool,
    pub downstream_task_ids: Vec<u32>,
    pub downstream_node_ids: Vec<i32>,
}

/// `TASK_DROP` (in).
#[derive(Clone, Debug)]
pub struct TaskDropReq {
    pub task_id: u32,
}

/// `TASK_CHECK_REQ` (out, sent to a downstream).
#[derive(Clone, Debug)]
pub struct TaskCheckReq {
    pub upstream_task_id: u32,
    pub downstream_task_id: u32,
}

/// `TASK_CHECK_RSP` (in, from a downstream).
#[derive(Clone, Debug)]
pub struct TaskCheckRsp {
    pub upstream_task_id: u32,
    pub downstream_task_id: u32,
    /// `1` = downstream is ready (`NORMAL`), `0` = not ready.
    pub status: i32,
}

/// `TASK_RECOVER_STEP1` / `STEP2` / `FINISH` (in).
#[derive(Clone, Debug)]
pub struct TaskRecoverStep1Req {
    pub task_id: u32,
}

#[derive(Clone, Debug)]
pub struct TaskRecoverStep2Req {
    pub task_id: u32,
    pub seq: i64,
}

#[derive(Clone, Debug)]
pub struct TaskRecoverFinishReq {
    pub task_id: u32,
}

/// `TASK_RUN` (in).
#[derive(Clone, Debug)]
pub struct TaskRunReq {
    pub task_id: u32,
}

/// `TASK_DISPATCH_REQ` (in).
#[derive(Clone, Debug)]
pub struct TaskDispatchReq {
    pub upstream_task_id: u32,
    pub upstream_node_id: i32,
    pub downstream_task_id: u32,
}

/// `TASK_DISPATCH_RSP` (out).
#[derive(Clone, Copy, Debug)]
pub struct TaskDispatchRsp {
    pub upstream_task_id: u32,
    pub upstream_node_id: i32,
    pub downstream_node_id: i32,
    pub downstream_task_id: u32,
    pub input_status: InputStatus,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum InputStatus {
    Normal,
}

/// `TASK_RETRIEVE_REQ` / `RSP` (in/out).
#[derive(Clone, Debug)]
pub struct TaskRetrieveReq {
    pub task_id: u32,
}

#[derive(Clone, Debug)]
pub struct TaskRetrieveRsp {
    pub task_id: u32,
}
