//! Replicated-log interface consumed by the lockstep metadata core.
//!
//! These types are kept in a small, dependency-light crate because they are
//! the seam between the metadata core and whatever consensus engine drives
//! it. The core only needs ordered entry submission, a read barrier, and a
//! state-machine callback; leader election, log replication, and snapshot
//! mechanics stay behind this interface.

pub mod mem;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Logical identifier of a log member.
pub type ServerId = u64;
/// Position of an entry in the committed log.
pub type LogIndex = u64;

/// How long `add_entry` waits before returning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitType {
    /// Return once the entry is committed to the log.
    Committed,
    /// Return once the entry has been applied on the local state machine.
    Applied,
}

/// Errors surfaced by the log layer.
///
/// `DroppedEntry` and `CommitStatusUnknown` are transient: the entry may be
/// resubmitted, and idempotent state machines make the retry safe.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("entry dropped from the log before commit")]
    DroppedEntry,
    #[error("leader changed; commit status of the entry is unknown")]
    CommitStatusUnknown,
    #[error("not a leader and entry forwarding is unavailable")]
    NotALeader,
    #[error("operation aborted")]
    Aborted,
    #[error("log group is shut down")]
    Stopped,
}

/// Identifier of a snapshot at the log layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub u64);

/// Log-layer view of a snapshot: where it cuts the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub index: LogIndex,
    pub id: SnapshotId,
}

/// Handle to one member of a replicated log group.
///
/// Implementations forward entries to the current leader; `NotALeader` only
/// escapes when forwarding is broken, which callers treat as fatal.
#[async_trait]
pub trait RaftHandle: Send + Sync + 'static {
    /// Identifier of this member.
    fn id(&self) -> ServerId;

    /// Append an opaque payload to the log and wait per `wait`.
    async fn add_entry(
        &self,
        payload: Bytes,
        wait: WaitType,
        abort: &CancellationToken,
    ) -> Result<(), RaftError>;

    /// Return only after this member has applied every entry that was
    /// committed at the time of the call.
    async fn read_barrier(&self, abort: &CancellationToken) -> Result<(), RaftError>;
}

/// Application state machine driven by the log.
///
/// `apply` receives committed entries in log order. An error from `apply`
/// stops the applier for this member; the log layer does not skip entries.
#[async_trait]
pub trait RaftStateMachine: Send + Sync + 'static {
    async fn apply(&self, entries: Vec<Bytes>) -> anyhow::Result<()>;

    /// Adopt a remote snapshot while catching up a lagging member.
    async fn transfer_snapshot(
        &self,
        from: ServerId,
        descriptor: SnapshotDescriptor,
    ) -> anyhow::Result<()>;

    /// Cut a log snapshot. State machines whose state lives in persistent
    /// tables can treat this as a structural no-op.
    async fn take_snapshot(&self) -> anyhow::Result<SnapshotId> {
        Ok(SnapshotId(0))
    }

    async fn load_snapshot(&self, _id: SnapshotId) -> anyhow::Result<()> {
        Ok(())
    }

    fn drop_snapshot(&self, _id: SnapshotId) {}
}
