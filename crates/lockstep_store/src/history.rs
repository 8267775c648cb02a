//! The group 0 history table.
//!
//! `system.group0_history` is a single partition clustered by state ID: one
//! row per successfully applied command. The last row is what "current
//! state" means to a proposer. Appends travel through the command pipeline
//! as mutations; this module only builds them and reads the table back.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::state_id::StateId;
use crate::storage::{CellMutation, Mutation, RowMutation, TableStore, HISTORY_TABLE};

/// Fixed partition key of the single history partition.
const HISTORY_PARTITION: &[u8] = b"history";

const DESCRIPTION_COLUMN: &str = "description";
const GC_AFTER_COLUMN: &str = "gc_after";

/// Read/build access to the history table.
#[derive(Clone)]
pub struct History {
    store: Arc<dyn TableStore>,
}

impl History {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Build the mutation that records `id`. The caller persists it through
    /// the command pipeline; nothing is written here.
    pub fn append_mutation(&self, id: StateId, description: &str, gc_after: Duration) -> Mutation {
        let timestamp = id.micros();
        Mutation {
            table: HISTORY_TABLE,
            partition_key: HISTORY_PARTITION.to_vec(),
            rows: vec![RowMutation {
                clustering_key: id.to_bytes().to_vec(),
                cells: vec![
                    CellMutation {
                        column: DESCRIPTION_COLUMN.to_string(),
                        value: description.as_bytes().to_vec(),
                        timestamp,
                    },
                    CellMutation {
                        column: GC_AFTER_COLUMN.to_string(),
                        value: (gc_after.as_secs()).to_be_bytes().to_vec(),
                        timestamp,
                    },
                ],
            }],
        }
    }

    /// State ID of the most recent entry, or `StateId::ZERO` when the
    /// history is empty. Reflects every command applied on this node.
    pub fn last(&self) -> anyhow::Result<StateId> {
        let partition = self.store.read_partition(HISTORY_TABLE, HISTORY_PARTITION)?;
        let Some(partition) = partition else {
            return Ok(StateId::ZERO);
        };
        match partition.rows.keys().next_back() {
            Some(key) => decode_state_id_key(key),
            None => Ok(StateId::ZERO),
        }
    }

    pub fn contains(&self, id: StateId) -> anyhow::Result<bool> {
        let partition = self.store.read_partition(HISTORY_TABLE, HISTORY_PARTITION)?;
        Ok(partition
            .map(|p| p.rows.contains_key(id.to_bytes().as_slice()))
            .unwrap_or(false))
    }

    /// Mutation reproducing the newest history row, with its original
    /// timestamps. This is what a snapshot pull piggybacks onto the schema
    /// mutations; `None` when the history is empty.
    pub fn last_entry_mutation(&self) -> anyhow::Result<Option<Mutation>> {
        let Some(partition) = self.store.read_partition(HISTORY_TABLE, HISTORY_PARTITION)? else {
            return Ok(None);
        };
        let Some((key, row)) = partition.rows.iter().next_back() else {
            return Ok(None);
        };
        Ok(Some(Mutation {
            table: HISTORY_TABLE,
            partition_key: HISTORY_PARTITION.to_vec(),
            rows: vec![RowMutation {
                clustering_key: key.clone(),
                cells: row
                    .cells
                    .iter()
                    .map(|(column, cell)| CellMutation {
                        column: column.clone(),
                        value: cell.value.clone(),
                        timestamp: cell.timestamp,
                    })
                    .collect(),
            }],
        }))
    }

    /// Reclaim entries whose `gc_after` horizon has passed. The newest entry
    /// is never reclaimed, whatever its age. Returns the number of rows
    /// removed.
    pub fn gc(&self, now_micros: i64) -> anyhow::Result<usize> {
        let Some(partition) = self.store.read_partition(HISTORY_TABLE, HISTORY_PARTITION)? else {
            return Ok(0);
        };
        let Some(last_key) = partition.rows.keys().next_back().cloned() else {
            return Ok(0);
        };

        let mut removed = 0usize;
        for (key, row) in &partition.rows {
            if *key == last_key {
                continue;
            }
            let id = decode_state_id_key(key)?;
            let gc_after_secs = row
                .cells
                .get(GC_AFTER_COLUMN)
                .and_then(|cell| <[u8; 8]>::try_from(cell.value.as_slice()).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            let expires = id.micros().saturating_add((gc_after_secs as i64).saturating_mul(1_000_000));
            if expires <= now_micros {
                self.store.delete_row(HISTORY_TABLE, HISTORY_PARTITION, key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn decode_state_id_key(key: &[u8]) -> anyhow::Result<StateId> {
    let bytes: [u8; StateId::ENCODED_LEN] = key
        .try_into()
        .map_err(|_| anyhow::anyhow!("malformed history clustering key"))?;
    Ok(StateId::from_bytes(bytes))
}

/// Run history GC on an interval until the task is dropped with the runtime.
pub fn spawn_gc(history: History, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros()
                .min(i64::MAX as u128) as i64;
            match history.gc(now) {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::debug!(removed, "history gc reclaimed entries");
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "history gc failed");
                }
            }
        }
    });
}
