//! Proposal path for group 0 changes.
//!
//! Changes execute in log order on every node, but proposers construct their
//! mutations from local state that may lag the log. The defense is a chain
//! of state IDs in the history table: every command names the state it was
//! built against (`prev_state_id`), and apply skips the command when the
//! history has moved past that state. The proposer then observes that its
//! `new_state_id` never reached the history and reports a concurrent
//! modification for the caller to retry.
//!
//! Two per-node semaphores shape the proposal path:
//!
//! - The **operation** semaphore serializes local proposers. Concurrent
//!   proposals from one node would mostly cancel each other through the
//!   state-ID check, so serializing them locally is a liveness measure, not
//!   a safety one.
//! - The **apply** semaphore is shared with the state machine. Holding it
//!   while reading guarantees the guard never observes a half-applied
//!   command; it is released just before the command is handed to the log so
//!   the local applier can make progress.
//!
//! Lock order is operation, then read barrier, then apply. The barrier may
//! need the applier to run (which takes the apply semaphore), so taking the
//! apply permit first would deadlock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use lockstep_raft::{RaftError, RaftHandle, WaitType};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::command::{encode_command, Change, Command, KvQuery, QueryResult, SchemaChange};
use crate::history::History;
use crate::state_id::StateId;
use crate::storage::TableStore;

/// Errors surfaced by the proposal path.
#[derive(Debug, thiserror::Error)]
pub enum Group0Error {
    /// The command applied globally but was a no-op here: another command
    /// slipped in between guard acquisition and apply. Retry the whole
    /// operation with a fresh guard.
    #[error("failed to apply group 0 change due to concurrent modification")]
    ConcurrentModification,
    #[error("operation aborted")]
    Aborted,
    #[error("group 0 internal error: {0}")]
    Internal(String),
    #[error("log error: {0}")]
    Raft(RaftError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

fn raft_to_group0(err: RaftError) -> Group0Error {
    match err {
        RaftError::Aborted => Group0Error::Aborted,
        other => Group0Error::Raft(other),
    }
}

/// Configuration for the group 0 client.
#[derive(Clone, Debug)]
pub struct Group0Config {
    /// When disabled, guards carry no locks and submission is unavailable
    /// (legacy single-node schema path).
    pub enabled: bool,
    /// How long history entries stay reclaimable-from; recorded into every
    /// appended entry.
    pub history_gc_duration: Duration,
}

impl Default for Group0Config {
    fn default() -> Self {
        Self {
            enabled: true,
            history_gc_duration: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Token required to perform one group 0 operation.
///
/// Obtaining it means every previously finished group 0 change is visible on
/// this node, and nothing will be half-applied while it is held. Dropping it
/// releases whatever permits it still owns.
#[derive(Debug)]
pub struct Group0Guard {
    // Drop order: apply permit before operation permit (declaration order).
    apply_permit: Option<OwnedSemaphorePermit>,
    operation_permit: Option<OwnedSemaphorePermit>,
    observed_state_id: StateId,
    new_state_id: StateId,
    client_tag: u64,
}

impl Group0Guard {
    /// Last state ID the history held when the guard was taken.
    pub fn observed_state_id(&self) -> StateId {
        self.observed_state_id
    }

    /// Pre-allocated state ID for the change performed under this guard.
    pub fn new_state_id(&self) -> StateId {
        self.new_state_id
    }

    /// Use this timestamp for every mutation created under the guard.
    pub fn write_timestamp(&self) -> i64 {
        self.new_state_id.micros()
    }

    fn release_apply(&mut self) {
        self.apply_permit.take();
    }
}

/// Post point for group 0 commands; one per node.
///
/// Shares its apply semaphore and result side-channel with the state
/// machine, so a deployment builds exactly one client and hands it to both
/// the proposal side and the applier.
pub struct Group0Client {
    raft: Arc<dyn RaftHandle>,
    history: History,
    operation_sem: Arc<Semaphore>,
    apply_sem: Arc<Semaphore>,
    enabled: bool,
    history_gc_duration: StdMutex<Duration>,
    results: StdMutex<HashMap<StateId, QueryResult>>,
    creator_addr: SocketAddr,
    /// Distinguishes guards issued by this client from guards issued by
    /// another instance (a misuse the type system cannot catch).
    tag: u64,
}

impl Group0Client {
    pub fn new(
        raft: Arc<dyn RaftHandle>,
        store: Arc<dyn TableStore>,
        creator_addr: SocketAddr,
        config: Group0Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            raft,
            history: History::new(store),
            operation_sem: Arc::new(Semaphore::new(1)),
            apply_sem: Arc::new(Semaphore::new(1)),
            enabled: config.enabled,
            history_gc_duration: StdMutex::new(config.history_gc_duration),
            results: StdMutex::new(HashMap::new()),
            creator_addr,
            tag: rand::random(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub(crate) fn apply_semaphore(&self) -> &Arc<Semaphore> {
        &self.apply_sem
    }

    /// Test hook: the operation semaphore, for asserting mutual exclusion.
    pub fn operation_semaphore(&self) -> &Arc<Semaphore> {
        &self.operation_sem
    }

    /// Test hook: shrink the GC horizon recorded into new history entries.
    pub fn set_history_gc_duration(&self, duration: Duration) {
        if let Ok(mut gc) = self.history_gc_duration.lock() {
            *gc = duration;
        }
    }

    fn history_gc_duration(&self) -> Duration {
        match self.history_gc_duration.lock() {
            Ok(gc) => *gc,
            Err(_) => Duration::from_secs(7 * 24 * 3600),
        }
    }

    /// Start one group 0 operation.
    ///
    /// Returns a guard holding the operation and apply permits, the observed
    /// last state ID, and a fresh state ID strictly greater than it. When
    /// the core is disabled the guard owns no permits and observes the zero
    /// state.
    pub async fn start_operation(
        &self,
        abort: &CancellationToken,
    ) -> Result<Group0Guard, Group0Error> {
        if !self.enabled {
            return Ok(Group0Guard {
                apply_permit: None,
                operation_permit: None,
                observed_state_id: StateId::ZERO,
                new_state_id: StateId::generate_after(StateId::ZERO),
                client_tag: self.tag,
            });
        }

        let operation_permit = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(Group0Error::Aborted),
            permit = self.operation_sem.clone().acquire_owned() => {
                permit.map_err(|_| Group0Error::Internal("operation semaphore closed".into()))?
            }
        };

        // The permits drop and the error propagates if the barrier fails.
        self.raft.read_barrier(abort).await.map_err(raft_to_group0)?;

        // Take the apply permit only after the barrier: the barrier may need
        // the applier to run, and the applier takes this permit.
        let apply_permit = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(Group0Error::Aborted),
            permit = self.apply_sem.clone().acquire_owned() => {
                permit.map_err(|_| Group0Error::Internal("apply semaphore closed".into()))?
            }
        };

        let observed_state_id = self.history.last()?;
        let new_state_id = StateId::generate_after(observed_state_id);

        Ok(Group0Guard {
            apply_permit: Some(apply_permit),
            operation_permit: Some(operation_permit),
            observed_state_id,
            new_state_id,
            client_tag: self.tag,
        })
    }

    /// Build a guarded schema-change command. Apply will be conditional on
    /// the guard's observed state still being current.
    pub fn prepare_command(
        &self,
        change: SchemaChange,
        guard: &Group0Guard,
        description: &str,
    ) -> Command {
        Command {
            change: Change::Schema(change),
            history_append: self.history.append_mutation(
                guard.new_state_id(),
                description,
                self.history_gc_duration(),
            ),
            // The post-submission retry check relies on `prev_state_id`
            // being present for guarded commands.
            prev_state_id: Some(guard.observed_state_id()),
            new_state_id: guard.new_state_id(),
            creator_addr: self.creator_addr,
            creator_id: self.raft.id(),
        }
    }

    /// Build a k/v query command. Queries execute on the apply path against
    /// state that already reflects every earlier command, so they carry no
    /// `prev_state_id` and need no guard.
    pub fn prepare_kv_command(&self, query: KvQuery) -> Command {
        let new_state_id = StateId::generate_after(StateId::ZERO);
        Command {
            change: Change::Query(query),
            history_append: self.history.append_mutation(
                new_state_id,
                "",
                self.history_gc_duration(),
            ),
            prev_state_id: None,
            new_state_id,
            creator_addr: self.creator_addr,
            creator_id: self.raft.id(),
        }
    }

    /// Submit a guarded command and wait until it has applied locally.
    ///
    /// On success the command's state ID is in the history. If the command
    /// applied as a no-op instead, `ConcurrentModification` is returned and
    /// the caller decides whether to retry the whole operation.
    pub async fn add_entry(
        &self,
        command: Command,
        guard: Group0Guard,
        abort: &CancellationToken,
    ) -> Result<(), Group0Error> {
        if guard.client_tag != self.tag {
            return Err(Group0Error::Internal(
                "guard was issued by a different group 0 client".into(),
            ));
        }

        let new_state_id = command.new_state_id;
        let submit = {
            let mut guard = guard;
            let payload = Bytes::from(encode_command(&command));

            // Let this node's applier run this command (and earlier ones).
            guard.release_apply();

            self.submit_with_retry(payload, command.prev_state_id, new_state_id, abort)
                .await
            // The guard drops here, releasing the operation permit whatever
            // the outcome was.
        };
        submit?;

        if !self.history.contains(new_state_id)? {
            // The command applied but never reached the history: apply
            // skipped it after a state-ID mismatch.
            return Err(Group0Error::ConcurrentModification);
        }
        Ok(())
    }

    /// Submit an unguarded command: no locks, no barrier, unconditional
    /// apply. Only for operations that are globally idempotent.
    pub async fn add_entry_unguarded(
        &self,
        command: Command,
        abort: &CancellationToken,
    ) -> Result<(), Group0Error> {
        let payload = Bytes::from(encode_command(&command));
        self.submit_with_retry(payload, command.prev_state_id, command.new_state_id, abort)
            .await
    }

    async fn submit_with_retry(
        &self,
        payload: Bytes,
        prev_state_id: Option<StateId>,
        new_state_id: StateId,
        abort: &CancellationToken,
    ) -> Result<(), Group0Error> {
        loop {
            match self
                .raft
                .add_entry(payload.clone(), WaitType::Applied, abort)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err @ (RaftError::DroppedEntry | RaftError::CommitStatusUnknown)) => {
                    // Safe to resubmit: the prev-state-ID check makes apply
                    // idempotent, so only the first copy can take effect.
                    tracing::warn!(
                        error = %err,
                        prev_state_id = ?prev_state_id.map(|id| id.to_string()),
                        new_state_id = %new_state_id,
                        "add_entry returned a transient error; retrying the command"
                    );
                }
                Err(RaftError::NotALeader) => {
                    // Entry forwarding is enabled, so the log should never
                    // surface leadership to us.
                    tracing::error!(
                        "add_entry: unexpected not-a-leader error with forwarding enabled"
                    );
                    return Err(Group0Error::Internal(
                        "not a leader while entry forwarding is enabled".into(),
                    ));
                }
                Err(err) => return Err(raft_to_group0(err)),
            }
        }
    }

    /// Record a query result on the node that executed it (applier side).
    pub(crate) fn set_query_result(&self, id: StateId, result: QueryResult) {
        if let Ok(mut results) = self.results.lock() {
            results.insert(id, result);
        }
    }

    /// Fetch and remove the result of a locally proposed query. `None` means
    /// the command was skipped (or the result was already taken).
    pub fn take_query_result(&self, id: StateId) -> Option<QueryResult> {
        match self.results.lock() {
            Ok(mut results) => results.remove(&id),
            Err(_) => None,
        }
    }

    /// Drop a result that will never be fetched.
    pub fn remove_query_result(&self, id: StateId) {
        if let Ok(mut results) = self.results.lock() {
            results.remove(&id);
        }
    }
}
