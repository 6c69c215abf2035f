//! Component F: the stream-task registry and coordinator (§4.F).
//!
//! Tasks are acquire/release refcounted (§5, §8 testable property 7) so
//! a task being served by one RPC handler cannot be freed by a
//! concurrent drop; `acquire` returns `None` once a task has entered
//! `Dropping`, mirroring the teacher's guard-returning registries
//! (e.g. `module_subscription_manager.rs`'s ref-counted client/query
//! bookkeeping) generalized to task lifetime instead of query lifetime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::collab::{Meta, StreamExt};
use crate::error::{TqError, TqResult};
use crate::messages::{
    InputStatus, TaskCheckRsp, TaskDeployReq, TaskDispatchReq, TaskDispatchRsp, TaskRetrieveReq,
    TaskRetrieveRsp,
};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum TaskLevel {
    Source,
    Agg,
    Sink,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum TaskStatus {
    Inactive,
    WaitDownstream,
    RecoverScan1,
    RecoverScan2,
    Normal,
    Dropping,
}

#[derive(Clone, Debug)]
pub struct StreamTaskSnapshot {
    pub task_id: u32,
    pub level: TaskLevel,
    pub status: TaskStatus,
    pub fill_history: bool,
}

/// The fixed 6-column delete block (SPEC_FULL §3): `start_ts`, `end_ts`
/// and `uid` are always populated; the remaining three are left `None`
/// (NULL in the original).
#[derive(Clone, Debug)]
pub struct DeleteBlock {
    pub start_ts: i64,
    pub end_ts: i64,
    pub uid: i64,
    pub group_id: Option<i64>,
    pub calc_start_ts: Option<i64>,
    pub calc_end_ts: Option<i64>,
}

/// One unit of data fanned out to a source task's input queue.
/// `Bytes`/`Arc` give the reference-counted-block semantics invariant 6
/// asks for "for free": every clone increments a strong count, every
/// drop decrements it, and the backing allocation frees at zero.
#[derive(Clone, Debug)]
pub enum StreamDataItem {
    Submit(Bytes),
    Delete(Arc<DeleteBlock>),
    Dispatch(Bytes),
}

pub struct StreamTask {
    pub task_id: u32,
    pub level: TaskLevel,
    status: Mutex<TaskStatus>,
    fill_history: AtomicBool,
    pub downstream_task_ids: Vec<u32>,
    pub downstream_node_ids: Vec<i32>,
    refcnt: AtomicUsize,
    pending_checks: Mutex<usize>,
}

impl StreamTask {
    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, s: TaskStatus) {
        *self.status.lock().unwrap() = s;
    }

    pub fn fill_history(&self) -> bool {
        self.fill_history.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StreamTaskSnapshot {
        StreamTaskSnapshot {
            task_id: self.task_id,
            level: self.level,
            status: self.status(),
            fill_history: self.fill_history(),
        }
    }

    /// §8 testable property 8: tasks not ready to receive fan-out.
    fn skips_fan_out(&self) -> bool {
        matches!(self.status(), TaskStatus::WaitDownstream | TaskStatus::RecoverScan1)
    }
}

/// Returned by [`StreamCoordinator::acquire`]; releases the refcount on
/// drop (§5 "acquire/release refcounting").
pub struct TaskGuard {
    task: Arc<StreamTask>,
}

impl std::ops::Deref for TaskGuard {
    type Target = StreamTask;
    fn deref(&self) -> &StreamTask {
        &self.task
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.task.refcnt.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct StreamCoordinator {
    tasks: RwLock<HashMap<u32, Arc<StreamTask>>>,
    stream: Arc<dyn StreamExt>,
    meta: Arc<dyn Meta>,
    vg_id: i32,
}

impl StreamCoordinator {
    pub fn new(stream: Arc<dyn StreamExt>, meta: Arc<dyn Meta>, vg_id: i32) -> Self {
        Self { tasks: RwLock::new(HashMap::new()), stream, meta, vg_id }
    }

    /// `TASK_DEPLOY` (§4.F). Registers the task; if `fillHistory` is
    /// set, kicks off the recovery state machine with a check request
    /// to every downstream.
    pub fn deploy(&self, req: TaskDeployReq) -> TqResult<()> {
        let task = Arc::new(StreamTask {
            task_id: req.task_id,
            level: req.level,
            status: Mutex::new(TaskStatus::Inactive),
            fill_history: AtomicBool::new(req.fill_history),
            downstream_task_ids: req.downstream_task_ids.clone(),
            downstream_node_ids: req.downstream_node_ids.clone(),
            refcnt: AtomicUsize::new(0),
            pending_checks: Mutex::new(req.downstream_task_ids.len()),
        });

        self.tasks.write().insert(req.task_id, task.clone());
        self.meta.save_task(req.task_id, &task.snapshot())?;
        tracing::info!(task_id = req.task_id, level = ?req.level, fill_history = req.fill_history, "stream task deployed");

        if req.fill_history {
            if task.downstream_task_ids.is_empty() {
                // No downstream to wait on: proceed straight to recovery.
                return self.enter_recover_scan1(&task);
            }
            task.set_status(TaskStatus::WaitDownstream);
            for (&dst, &node) in task.downstream_task_ids.iter().zip(&task.downstream_node_ids) {
                if let Err(e) = self.stream.send_check_req(task.task_id, dst, node) {
                    tracing::warn!(task_id = task.task_id, downstream = dst, error = %e, "check-req send failed");
                }
            }
        }
        Ok(())
    }

    /// `TASK_DROP`. Terminal from any state; `acquire` rejects
    /// afterwards (§4.F state diagram "any state -> drop -> DROPPING").
    pub fn drop_task(&self, task_id: u32) {
        let task = self.tasks.write().remove(&task_id);
        match task {
            Some(task) => {
                task.set_status(TaskStatus::Dropping);
                if let Err(e) = self.meta.delete_task(task_id) {
                    tracing::warn!(task_id, error = %e, "drop: failed to delete persisted task");
                }
            }
            None => tracing::warn!(task_id, "drop: no such task"),
        }
    }

    /// Returns a live guard, or `None` if the task is unknown or
    /// `Dropping` (§8 testable property 7).
    pub fn acquire(&self, task_id: u32) -> Option<TaskGuard> {
        let task = self.tasks.read().get(&task_id)?.clone();
        if task.status() == TaskStatus::Dropping {
            return None;
        }
        task.refcnt.fetch_add(1, Ordering::AcqRel);
        Some(TaskGuard { task })
    }

    /// `TASK_CHECK_RSP` (in): one downstream's readiness answer.
    pub fn handle_check_rsp(&self, rsp: TaskCheckRsp) -> TqResult<()> {
        let task = self
            .tasks
            .read()
            .get(&rsp.upstream_task_id)
            .cloned()
            .ok_or(TqError::TaskNotFound(rsp.upstream_task_id))?;

        if rsp.status != 1 {
            tracing::warn!(task_id = task.task_id, downstream = rsp.downstream_task_id, "downstream not ready");
            return Err(TqError::DownstreamEjected(rsp.downstream_task_id));
        }

        let ready = {
            let mut pending = task.pending_checks.lock().unwrap();
            *pending = pending.saturating_sub(1);
            *pending == 0
        };
        if ready {
            self.enter_recover_scan1(&task)?;
        }
        Ok(())
    }

    fn enter_recover_scan1(&self, task: &Arc<StreamTask>) -> TqResult<()> {
        task.set_status(TaskStatus::RecoverScan1);
        self.stream.source_recover_scan_step1(task.task_id)?;
        self.enter_recover_scan2(task)
    }

    /// "dispatch step2 request to self via write-queue" (§4.F): modeled
    /// as a direct call rather than a literal self-addressed message,
    /// since there is no separate scheduler queue in this crate.
    fn enter_recover_scan2(&self, task: &Arc<StreamTask>) -> TqResult<()> {
        let req = self.stream.build_source_recover2_req(task.task_id)?;
        task.set_status(TaskStatus::RecoverScan2);
        self.stream.source_recover_scan_step2(task.task_id, req.seq)?;
        self.finish_recovery(task)
    }

    fn finish_recovery(&self, task: &Arc<StreamTask>) -> TqResult<()> {
        self.stream.restore_param(task.task_id)?;
        task.fill_history.store(false, Ordering::Release);
        task.set_status(TaskStatus::Normal);
        self.meta.save_task(task.task_id, &task.snapshot())?;
        tracing::info!(task_id = task.task_id, "stream task recovered, entering NORMAL");

        for &dst in &task.downstream_task_ids {
            if let Err(e) = self.stream.dispatch_recover_finish_req(dst) {
                tracing::warn!(task_id = task.task_id, downstream = dst, error = %e, "recover-finish dispatch failed");
            }
        }
        Ok(())
    }

    /// `TASK_RECOVER_FINISH` / `TASK_RETRIEVE_RSP` (SPEC_FULL §3): both
    /// are no-ops in the original, pure response drains.
    pub fn handle_recover_finish_rsp(&self, _task_id: u32) {}

    pub fn handle_retrieve_rsp(&self, _rsp: TaskRetrieveRsp) {}

    /// Writer-side entry point: `processSubmit` (§4.F).
    pub fn process_submit(&self, packed_submit: Bytes) {
        self.fan_out(|_task| StreamDataItem::Submit(packed_submit.clone()));
    }

    /// Writer-side entry point: `processDelete` (§4.F). Per SPEC_FULL
    /// §3, fans out identically to `processSubmit` (same status filter
    /// and refcount discipline), resolving the spec/original-source
    /// discrepancy in favor of the spec's explicit wording.
    pub fn process_delete(&self, block: DeleteBlock) {
        let block = Arc::new(block);
        self.fan_out(|_task| StreamDataItem::Delete(block.clone()));
    }

    fn fan_out(&self, mut make_item: impl FnMut(&StreamTask) -> StreamDataItem) {
        for task in self.tasks.read().values() {
            if task.level != TaskLevel::Source || task.skips_fan_out() {
                continue;
            }
            let item = make_item(task);
            match self.stream.task_input(task.task_id, item) {
                Ok(()) => {
                    if let Err(e) = self.stream.sched_exec(task.task_id) {
                        tracing::warn!(task_id = task.task_id, error = %e, "sched_exec failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = task.task_id, error = %e, "task_input failed");
                    self.stream.task_input_fail(task.task_id);
                }
            }
        }
    }

    /// `TASK_RUN` (in).
    pub fn handle_run_req(&self, task_id: u32) -> TqResult<()> {
        let guard = self.acquire(task_id).ok_or(TqError::TaskNotFound(task_id))?;
        let result = self.stream.sched_exec(guard.task_id);
        drop(guard);
        result
    }

    /// `TASK_DISPATCH_REQ` (in). A dispatch whose target task does not
    /// exist still produces a synthetic response with the upstream
    /// fields echoed and `inputStatus = NORMAL` (§4.F).
    pub fn handle_dispatch_req(&self, req: TaskDispatchReq, payload: Bytes) -> TaskDispatchRsp {
        if let Some(guard) = self.acquire(req.downstream_task_id) {
            if let Err(e) = self.stream.task_input(guard.task_id, StreamDataItem::Dispatch(payload)) {
                tracing::warn!(task_id = guard.task_id, error = %e, "dispatch: task_input failed");
                self.stream.task_input_fail(guard.task_id);
            } else if let Err(e) = self.stream.sched_exec(guard.task_id) {
                tracing::warn!(task_id = guard.task_id, error = %e, "dispatch: sched_exec failed");
            }
        } else {
            tracing::warn!(task_id = req.downstream_task_id, "dispatch: target task not found");
        }

        TaskDispatchRsp {
            upstream_task_id: req.upstream_task_id,
            upstream_node_id: req.upstream_node_id,
            downstream_node_id: self.vg_id,
            downstream_task_id: req.downstream_task_id,
            input_status: InputStatus::Normal,
        }
    }

    /// `TASK_RETRIEVE_REQ` (in).
    pub fn handle_retrieve_req(&self, req: TaskRetrieveReq) -> TqResult<()> {
        let guard = self.acquire(req.task_id).ok_or(TqError::TaskNotFound(req.task_id))?;
        self.stream.setup_trigger(guard.task_id);
        Ok(())
    }
}
