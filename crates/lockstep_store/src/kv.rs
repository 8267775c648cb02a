//! Execution of strongly-consistent k/v queries.
//!
//! Queries run on the apply path, so local reads already reflect every
//! command committed before this one. Write timestamps derive from the
//! executing command's state ID and stay strictly above whatever the cell
//! already carries, which keeps replay idempotent and timestamps monotonic
//! in log order.

use crate::command::{KvQuery, QueryResult};
use crate::state_id::StateId;
use crate::storage::{Cell, CellMutation, Mutation, RowMutation, TableStore, KV_STORE_TABLE};

const VALUE_COLUMN: &str = "value";

/// Execute one query against `system.group0_kv_store`.
pub fn execute_query(
    store: &dyn TableStore,
    query: &KvQuery,
    new_state_id: StateId,
) -> anyhow::Result<QueryResult> {
    match query {
        KvQuery::Select { key } => {
            let cell = read_value_cell(store, key)?;
            Ok(QueryResult::Select {
                value: cell.map(|cell| cell.value),
            })
        }
        KvQuery::Update {
            key,
            new_value,
            value_condition,
        } => {
            let existing = read_value_cell(store, key)?;
            match (existing, value_condition) {
                (Some(cell), Some(condition)) => {
                    let applied = cell.value == *condition;
                    if applied {
                        write_value(store, key, new_value, bump(new_state_id, cell.timestamp))?;
                    }
                    Ok(QueryResult::ConditionalUpdate {
                        applied,
                        previous_value: Some(cell.value),
                    })
                }
                // Conditional update against a missing partition is skipped.
                (None, Some(_)) => Ok(QueryResult::ConditionalUpdate {
                    applied: false,
                    previous_value: None,
                }),
                (Some(cell), None) => {
                    write_value(store, key, new_value, bump(new_state_id, cell.timestamp))?;
                    Ok(QueryResult::None)
                }
                (None, None) => {
                    write_value(store, key, new_value, new_state_id.micros())?;
                    Ok(QueryResult::None)
                }
            }
        }
    }
}

/// Timestamp strictly above the existing cell, never below the state ID's.
fn bump(new_state_id: StateId, existing_timestamp: i64) -> i64 {
    new_state_id.micros().max(existing_timestamp + 1)
}

fn read_value_cell(store: &dyn TableStore, key: &[u8]) -> anyhow::Result<Option<Cell>> {
    let Some(partition) = store.read_partition(KV_STORE_TABLE, key)? else {
        return Ok(None);
    };
    // Only one value per partition key is allowed in this version.
    anyhow::ensure!(
        partition.rows.len() == 1,
        "multiple rows stored for one kv key"
    );
    let Some(row) = partition.rows.get(&b""[..]) else {
        anyhow::bail!("kv row stored under a non-empty clustering key");
    };
    match row.cells.get(VALUE_COLUMN) {
        Some(cell) => Ok(Some(cell.clone())),
        None => anyhow::bail!("kv row missing the value cell"),
    }
}

fn write_value(
    store: &dyn TableStore,
    key: &[u8],
    value: &[u8],
    timestamp: i64,
) -> anyhow::Result<()> {
    store.apply_mutations(&[Mutation {
        table: KV_STORE_TABLE,
        partition_key: key.to_vec(),
        rows: vec![RowMutation {
            clustering_key: Vec::new(),
            cells: vec![CellMutation {
                column: VALUE_COLUMN.to_string(),
                value: value.to_vec(),
                timestamp,
            }],
        }],
    }])
}
