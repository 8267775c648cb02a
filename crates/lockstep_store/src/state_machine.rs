//! Application of committed group 0 commands.
//!
//! Commands arrive in log order. Each one is admitted through the
//! prev-state-ID check, dispatched to the schema engine or the k/v engine,
//! and finally recorded in the history table. The history append is always
//! the last write: a crash in between leaves the history at the prior state,
//! so replay re-admits the command and both payload kinds reapply
//! idempotently (schema merges by construction, k/v writes because their
//! timestamps derive from the command's state ID).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use anyhow::Context;
use lockstep_raft::{RaftStateMachine, ServerId, SnapshotDescriptor};

use crate::client::Group0Client;
use crate::command::{decode_command, Change};
use crate::kv::execute_query;
use crate::migration::MigrationRpc;
use crate::schema::SchemaApplier;
use crate::storage::{Mutation, TableStore, HISTORY_TABLE};

/// Group 0 state machine; one per node, wired to the same client instance
/// the node proposes through.
pub struct Group0StateMachine {
    client: Arc<Group0Client>,
    store: Arc<dyn TableStore>,
    schema: Arc<dyn SchemaApplier>,
    migration: Arc<dyn MigrationRpc>,
}

impl Group0StateMachine {
    pub fn new(
        client: Arc<Group0Client>,
        store: Arc<dyn TableStore>,
        schema: Arc<dyn SchemaApplier>,
        migration: Arc<dyn MigrationRpc>,
    ) -> Self {
        Self {
            client,
            store,
            schema,
            migration,
        }
    }
}

/// Pull the history mutation out of a snapshot reply. A peer that speaks the
/// group 0 protocol always includes it, so absence is an internal error.
fn extract_history_mutation(mutations: &mut Vec<Mutation>) -> anyhow::Result<Mutation> {
    let position = mutations
        .iter()
        .position(|mutation| mutation.table == HISTORY_TABLE)
        .ok_or_else(|| anyhow::anyhow!("group 0 history mutation missing from snapshot pull"))?;
    Ok(mutations.remove(position))
}

#[async_trait]
impl RaftStateMachine for Group0StateMachine {
    async fn apply(&self, entries: Vec<Bytes>) -> anyhow::Result<()> {
        for entry in entries {
            let command = decode_command(&entry).context("decode group 0 command")?;
            tracing::trace!(
                prev_state_id = ?command.prev_state_id.map(|id| id.to_string()),
                new_state_id = %command.new_state_id,
                creator_id = command.creator_id,
                "applying group 0 command"
            );

            let _permit = self
                .client
                .apply_semaphore()
                .acquire()
                .await
                .map_err(|_| anyhow::anyhow!("apply semaphore closed"))?;

            if let Some(prev_state_id) = command.prev_state_id {
                let last = self.client.history().last()?;
                if prev_state_id != last {
                    // The command was built against obsolete state; skip it
                    // entirely. Nothing is written, including the history
                    // append, which is what the proposer's post-submission
                    // check looks for.
                    tracing::trace!(
                        prev_state_id = %prev_state_id,
                        last_state_id = %last,
                        "skipping group 0 command built against obsolete state"
                    );
                    continue;
                }
            }

            match command.change {
                Change::Schema(change) => {
                    self.schema
                        .merge_schema_from(command.creator_addr, change.mutations)
                        .await?;
                }
                Change::Query(ref query) => {
                    let result = execute_query(self.store.as_ref(), query, command.new_state_id)?;
                    self.client.set_query_result(command.new_state_id, result);
                }
            }

            // The history append must be the last write. A crash before it
            // leaves the prev-state-ID check passing, so the command
            // reapplies in full on replay.
            self.store.apply_mutations(&[command.history_append])?;
        }
        Ok(())
    }

    async fn transfer_snapshot(
        &self,
        from: ServerId,
        descriptor: SnapshotDescriptor,
    ) -> anyhow::Result<()> {
        // The transferred state may be newer than the snapshot's log index;
        // entries applied afterwards then no-op through the prev-state-ID
        // check instead of double-applying.
        tracing::debug!(from, index = descriptor.index, "starting group 0 snapshot transfer");

        let pull = self.migration.pull_group0_snapshot(from).await?;
        let mut mutations = pull.mutations;
        let history_mutation = extract_history_mutation(&mut mutations)?;

        let _permit = self
            .client
            .apply_semaphore()
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("apply semaphore closed"))?;

        self.schema.merge_schema_from(pull.origin, mutations).await?;
        self.store.apply_mutations(&[history_mutation])?;
        Ok(())
    }
}
