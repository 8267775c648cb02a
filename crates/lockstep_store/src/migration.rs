//! Snapshot-pull seam.
//!
//! Catching up a lagging member pulls the peer's schema mutations over the
//! migration-request RPC; the single history mutation capturing the peer's
//! current last state piggybacks on the same reply rather than getting a
//! dedicated message type.

use std::net::SocketAddr;

use async_trait::async_trait;
use lockstep_raft::ServerId;

use crate::storage::Mutation;

/// Reply to a group 0 snapshot pull.
#[derive(Clone, Debug)]
pub struct SnapshotPull {
    /// Address the mutations originate from; becomes the schema-merge origin.
    pub origin: SocketAddr,
    /// Schema mutations plus exactly one `system.group0_history` mutation.
    pub mutations: Vec<Mutation>,
}

#[async_trait]
pub trait MigrationRpc: Send + Sync + 'static {
    async fn pull_group0_snapshot(&self, from: ServerId) -> anyhow::Result<SnapshotPull>;
}
