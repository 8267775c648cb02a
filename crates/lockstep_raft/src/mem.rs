//! In-process replicated log group.
//!
//! Backs tests, simulations, and embedded single-process deployments: one
//! shared ordered log, one handle per member, committed entries applied to
//! each member's state machine in log order. Fault injection covers the
//! transient errors a submission path must survive (`DroppedEntry`,
//! `CommitStatusUnknown`), and members can be paused to model lag and drive
//! snapshot transfer.
//!
//! Members are created first and attach their state machine afterwards,
//! because applications usually need the member handle to build the state
//! machine in the first place. A member without a state machine does not
//! apply anything yet.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    LogIndex, RaftError, RaftHandle, RaftStateMachine, ServerId, SnapshotDescriptor, SnapshotId,
    WaitType,
};

/// One member's applier progress and pause switch.
struct MemberState {
    id: ServerId,
    sm: StdMutex<Option<Arc<dyn RaftStateMachine>>>,
    paused: AtomicBool,
    /// Applied log length. The lock also serializes applies for this member.
    progress: Mutex<LogIndex>,
}

impl MemberState {
    fn state_machine(&self) -> Option<Arc<dyn RaftStateMachine>> {
        match self.sm.lock() {
            Ok(sm) => sm.clone(),
            Err(_) => None,
        }
    }
}

struct Shared {
    /// Committed entries, in commit order.
    log: Mutex<Vec<Bytes>>,
    members: RwLock<HashMap<ServerId, Arc<MemberState>>>,
    /// Scripted errors consumed by subsequent `add_entry` calls, in order.
    faults: StdMutex<VecDeque<RaftError>>,
}

/// Handle shared by tests to build members and steer the group.
#[derive(Clone)]
pub struct MemGroup {
    shared: Arc<Shared>,
}

impl MemGroup {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                log: Mutex::new(Vec::new()),
                members: RwLock::new(HashMap::new()),
                faults: StdMutex::new(VecDeque::new()),
            }),
        }
    }

    /// Register a member and return its log handle. The member does not
    /// apply entries until `register_state_machine` attaches one.
    pub fn add_member(&self, id: ServerId) -> MemRaft {
        let member = Arc::new(MemberState {
            id,
            sm: StdMutex::new(None),
            paused: AtomicBool::new(false),
            progress: Mutex::new(0),
        });
        if let Ok(mut members) = self.shared.members.write() {
            members.insert(id, member.clone());
        }
        MemRaft {
            shared: self.shared.clone(),
            member,
        }
    }

    pub fn register_state_machine(&self, id: ServerId, sm: Arc<dyn RaftStateMachine>) {
        if let Some(member) = self.member(id) {
            if let Ok(mut slot) = member.sm.lock() {
                *slot = Some(sm);
            }
        }
    }

    /// Script an error for the next `add_entry` call.
    ///
    /// `CommitStatusUnknown` still commits and applies the entry before the
    /// error is returned, modelling a leader that replicated the entry and
    /// then lost contact.
    pub fn inject_error(&self, err: RaftError) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.push_back(err);
        }
    }

    /// Stop applying committed entries on `id`. The member keeps lagging
    /// until `resume` or `install_snapshot`. Pause followers only; a paused
    /// proposer would break `WaitType::Applied`.
    pub fn pause(&self, id: ServerId) {
        if let Some(member) = self.member(id) {
            member.paused.store(true, Ordering::SeqCst);
        }
    }

    pub fn resume(&self, id: ServerId) {
        if let Some(member) = self.member(id) {
            member.paused.store(false, Ordering::SeqCst);
        }
    }

    /// Apply everything committed so far on `id`.
    pub async fn catch_up(&self, id: ServerId) -> Result<(), RaftError> {
        match self.member(id) {
            Some(member) => self.shared.catch_up_member(&member).await,
            None => Err(RaftError::Stopped),
        }
    }

    /// Drive a snapshot transfer into a lagging member: `to` adopts the
    /// current state of `from` and its applier skips the entries the
    /// snapshot already covers.
    pub async fn install_snapshot(&self, to: ServerId, from: ServerId) -> anyhow::Result<()> {
        let index = self.committed().await;
        self.install_snapshot_at(to, from, index).await
    }

    /// Snapshot transfer with an explicit descriptor index. The transfer
    /// hands over the peer's live state, which may be newer than `index`;
    /// entries after `index` still replay on `to`, and a conditional state
    /// machine is expected to no-op the ones the transferred state already
    /// covers.
    pub async fn install_snapshot_at(
        &self,
        to: ServerId,
        from: ServerId,
        index: LogIndex,
    ) -> anyhow::Result<()> {
        let member = self
            .member(to)
            .ok_or_else(|| anyhow::anyhow!("unknown member {to}"))?;
        let sm = member
            .state_machine()
            .ok_or_else(|| anyhow::anyhow!("member {to} has no state machine"))?;
        let descriptor = SnapshotDescriptor {
            index,
            id: SnapshotId(index),
        };
        sm.transfer_snapshot(from, descriptor).await?;
        let mut progress = member.progress.lock().await;
        if *progress < index {
            *progress = index;
        }
        member.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Number of committed entries.
    pub async fn committed(&self) -> LogIndex {
        self.shared.log.lock().await.len() as LogIndex
    }

    fn member(&self, id: ServerId) -> Option<Arc<MemberState>> {
        self.shared
            .members
            .read()
            .ok()
            .and_then(|members| members.get(&id).cloned())
    }
}

impl Default for MemGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn take_fault(&self) -> Option<RaftError> {
        match self.faults.lock() {
            Ok(mut faults) => faults.pop_front(),
            Err(_) => None,
        }
    }

    async fn commit(&self, payload: Bytes) -> LogIndex {
        let mut log = self.log.lock().await;
        log.push(payload);
        log.len() as LogIndex
    }

    fn member_list(&self) -> Vec<Arc<MemberState>> {
        match self.members.read() {
            Ok(members) => members.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Apply all committed entries the member has not seen yet, in order.
    async fn catch_up_member(&self, member: &Arc<MemberState>) -> Result<(), RaftError> {
        if member.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(sm) = member.state_machine() else {
            return Ok(());
        };
        let mut progress = member.progress.lock().await;
        loop {
            let pending: Vec<Bytes> = {
                let log = self.log.lock().await;
                if log.len() as LogIndex <= *progress {
                    return Ok(());
                }
                log[*progress as usize..].to_vec()
            };
            let count = pending.len() as LogIndex;
            if let Err(err) = sm.apply(pending).await {
                tracing::error!(member = member.id, error = ?err, "state machine apply failed");
                return Err(RaftError::Stopped);
            }
            *progress += count;
        }
    }

    async fn advance_all(&self) -> Result<(), RaftError> {
        for member in self.member_list() {
            self.catch_up_member(&member).await?;
        }
        Ok(())
    }
}

/// Per-member log handle.
pub struct MemRaft {
    shared: Arc<Shared>,
    member: Arc<MemberState>,
}

#[async_trait]
impl RaftHandle for MemRaft {
    fn id(&self) -> ServerId {
        self.member.id
    }

    async fn add_entry(
        &self,
        payload: Bytes,
        wait: WaitType,
        abort: &CancellationToken,
    ) -> Result<(), RaftError> {
        if abort.is_cancelled() {
            return Err(RaftError::Aborted);
        }

        if let Some(err) = self.shared.take_fault() {
            if matches!(err, RaftError::CommitStatusUnknown) {
                self.shared.commit(payload).await;
                self.shared.catch_up_member(&self.member).await?;
            }
            return Err(err);
        }

        self.shared.commit(payload).await;

        // Other members apply on their own schedule, like real followers;
        // only the submitting member's apply is awaited.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _ = shared.advance_all().await;
        });

        if matches!(wait, WaitType::Committed) {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = abort.cancelled() => Err(RaftError::Aborted),
            res = self.shared.catch_up_member(&self.member) => res,
        }
    }

    async fn read_barrier(&self, abort: &CancellationToken) -> Result<(), RaftError> {
        tokio::select! {
            biased;
            _ = abort.cancelled() => Err(RaftError::Aborted),
            res = self.shared.catch_up_member(&self.member) => res,
        }
    }
}
