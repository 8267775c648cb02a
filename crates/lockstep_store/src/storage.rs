//! Local table access for group 0 state.
//!
//! Group 0 commands carry mutations against a small set of system tables;
//! this module provides the mutation model, the `TableStore` trait the rest
//! of the crate reads and writes through, an in-memory store for tests and
//! simulations, and a fjall-backed store for durable deployments.
//!
//! Cell writes are last-write-wins by timestamp. A replayed mutation carries
//! the same timestamps as the original, so reapplying it is a no-op; command
//! replay after a crash relies on this.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};

use crate::wire::{put_bytes, put_i64, put_u32, read_bytes, read_i64, read_u32};

pub const SYSTEM_KEYSPACE: &str = "system";
pub const GROUP0_HISTORY_TABLE: &str = "group0_history";
pub const GROUP0_KV_STORE_TABLE: &str = "group0_kv_store";

/// Identifies a table touched by group 0 mutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub u32);

/// `system.group0_history`.
pub const HISTORY_TABLE: TableId = TableId(1);
/// `system.group0_kv_store`.
pub const KV_STORE_TABLE: TableId = TableId(2);
/// Tables at or above this id belong to the external schema engine; the core
/// routes their mutations to the schema applier without interpreting them.
pub const SCHEMA_TABLE_BASE: TableId = TableId(0x100);

impl TableId {
    pub fn is_schema_table(&self) -> bool {
        *self >= SCHEMA_TABLE_BASE
    }
}

/// Resolve a `(keyspace, table)` pair to a table id.
pub fn find_table(keyspace: &str, name: &str) -> Option<TableId> {
    if keyspace != SYSTEM_KEYSPACE {
        return None;
    }
    match name {
        GROUP0_HISTORY_TABLE => Some(HISTORY_TABLE),
        GROUP0_KV_STORE_TABLE => Some(KV_STORE_TABLE),
        _ => None,
    }
}

/// One timestamped column write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellMutation {
    pub column: String,
    pub value: Vec<u8>,
    pub timestamp: i64,
}

/// Writes to one clustered row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowMutation {
    pub clustering_key: Vec<u8>,
    pub cells: Vec<CellMutation>,
}

/// Writes to one partition of one table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub table: TableId,
    pub partition_key: Vec<u8>,
    pub rows: Vec<RowMutation>,
}

/// Stored cell: value plus the write timestamp that won it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub value: Vec<u8>,
    pub timestamp: i64,
}

/// Stored row: column name to cell.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub cells: BTreeMap<String, Cell>,
}

/// Stored partition: clustering key to row, ordered by clustering key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub rows: BTreeMap<Vec<u8>, Row>,
}

/// Storage engine API used by the group 0 core.
///
/// `apply_mutations` merges cell-by-cell: a cell is replaced only when the
/// incoming timestamp is strictly greater than the stored one.
pub trait TableStore: Send + Sync + 'static {
    /// Read a whole partition; `None` when it does not exist.
    fn read_partition(&self, table: TableId, partition_key: &[u8])
        -> anyhow::Result<Option<Partition>>;

    fn apply_mutations(&self, mutations: &[Mutation]) -> anyhow::Result<()>;

    /// Remove one clustered row (history GC).
    fn delete_row(
        &self,
        table: TableId,
        partition_key: &[u8],
        clustering_key: &[u8],
    ) -> anyhow::Result<()>;
}

fn merge_row(row: &mut Row, cells: &[CellMutation]) {
    for cell in cells {
        match row.cells.get_mut(&cell.column) {
            Some(existing) if existing.timestamp >= cell.timestamp => {}
            Some(existing) => {
                existing.value = cell.value.clone();
                existing.timestamp = cell.timestamp;
            }
            None => {
                row.cells.insert(
                    cell.column.clone(),
                    Cell {
                        value: cell.value.clone(),
                        timestamp: cell.timestamp,
                    },
                );
            }
        }
    }
}

/// In-memory table store for tests and simulations.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<HashMap<(TableId, Vec<u8>), Partition>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableStore for MemStore {
    fn read_partition(
        &self,
        table: TableId,
        partition_key: &[u8],
    ) -> anyhow::Result<Option<Partition>> {
        let guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(_) => anyhow::bail!("table store lock poisoned"),
        };
        Ok(guard.get(&(table, partition_key.to_vec())).cloned())
    }

    fn apply_mutations(&self, mutations: &[Mutation]) -> anyhow::Result<()> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(_) => anyhow::bail!("table store lock poisoned"),
        };
        for mutation in mutations {
            let partition = guard
                .entry((mutation.table, mutation.partition_key.clone()))
                .or_default();
            for row_mut in &mutation.rows {
                let row = partition
                    .rows
                    .entry(row_mut.clustering_key.clone())
                    .or_default();
                merge_row(row, &row_mut.cells);
            }
        }
        Ok(())
    }

    fn delete_row(
        &self,
        table: TableId,
        partition_key: &[u8],
        clustering_key: &[u8],
    ) -> anyhow::Result<()> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(_) => anyhow::bail!("table store lock poisoned"),
        };
        if let Some(partition) = guard.get_mut(&(table, partition_key.to_vec())) {
            partition.rows.remove(clustering_key);
            if partition.rows.is_empty() {
                guard.remove(&(table, partition_key.to_vec()));
            }
        }
        Ok(())
    }
}

const STORE_FORMAT_VERSION: u32 = 1;

/// On-disk format marker, persisted as JSON in its own partition.
#[derive(Debug, Serialize, Deserialize)]
struct StoreManifest {
    format_version: u32,
}

/// Fjall-backed table store: one fjall partition per table, rows stored
/// under a `[pk_len][pk][ck]` composite key.
pub struct FjallStore {
    keyspace: Arc<Keyspace>,
    tables: RwLock<HashMap<TableId, PartitionHandle>>,
    write_lock: RwLock<()>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = Arc::new(fjall::Config::new(path.as_ref()).open()?);
        let manifest = keyspace.open_partition("manifest", PartitionCreateOptions::default())?;
        match manifest.get("format")? {
            Some(bytes) => {
                let parsed: StoreManifest =
                    serde_json::from_slice(&bytes).context("parse store manifest")?;
                anyhow::ensure!(
                    parsed.format_version == STORE_FORMAT_VERSION,
                    "unsupported store format version {}",
                    parsed.format_version
                );
            }
            None => {
                let manifest_bytes = serde_json::to_vec(&StoreManifest {
                    format_version: STORE_FORMAT_VERSION,
                })
                .context("serialize store manifest")?;
                manifest.insert("format", manifest_bytes)?;
            }
        }
        Ok(Self {
            keyspace,
            tables: RwLock::new(HashMap::new()),
            write_lock: RwLock::new(()),
        })
    }

    fn partition(&self, table: TableId) -> anyhow::Result<PartitionHandle> {
        if let Ok(tables) = self.tables.read() {
            if let Some(handle) = tables.get(&table) {
                return Ok(handle.clone());
            }
        }
        let name = format!("table_{}", table.0);
        let handle = self
            .keyspace
            .open_partition(&name, PartitionCreateOptions::default())?;
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(table, handle.clone());
        }
        Ok(handle)
    }
}

/// Composite key prefix covering every row of one partition.
fn encode_partition_prefix(partition_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + partition_key.len());
    put_bytes(&mut out, partition_key);
    out
}

fn encode_row_key(partition_key: &[u8], clustering_key: &[u8]) -> Vec<u8> {
    let mut out = encode_partition_prefix(partition_key);
    out.extend_from_slice(clustering_key);
    out
}

fn encode_row(row: &Row) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, row.cells.len() as u32);
    for (column, cell) in &row.cells {
        put_bytes(&mut out, column.as_bytes());
        put_i64(&mut out, cell.timestamp);
        put_bytes(&mut out, &cell.value);
    }
    out
}

fn decode_row(data: &[u8]) -> anyhow::Result<Row> {
    let mut offset = 0usize;
    let count = read_u32(data, &mut offset)? as usize;
    let mut row = Row::default();
    for _ in 0..count {
        let column = String::from_utf8(read_bytes(data, &mut offset)?)
            .map_err(|_| anyhow::anyhow!("invalid column name"))?;
        let timestamp = read_i64(data, &mut offset)?;
        let value = read_bytes(data, &mut offset)?;
        row.cells.insert(column, Cell { value, timestamp });
    }
    Ok(row)
}

impl TableStore for FjallStore {
    fn read_partition(
        &self,
        table: TableId,
        partition_key: &[u8],
    ) -> anyhow::Result<Option<Partition>> {
        let handle = self.partition(table)?;
        let prefix = encode_partition_prefix(partition_key);
        let mut partition = Partition::default();
        for item in handle.prefix(&prefix) {
            let (entry_key, entry_value) = item?;
            let clustering_key = entry_key[prefix.len()..].to_vec();
            let row = decode_row(&entry_value)?;
            partition.rows.insert(clustering_key, row);
        }
        if partition.rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(partition))
    }

    fn apply_mutations(&self, mutations: &[Mutation]) -> anyhow::Result<()> {
        let _guard = match self.write_lock.write() {
            Ok(guard) => guard,
            Err(_) => anyhow::bail!("table store lock poisoned"),
        };
        let mut batch = self.keyspace.batch();
        for mutation in mutations {
            let handle = self.partition(mutation.table)?;
            for row_mut in &mutation.rows {
                let row_key = encode_row_key(&mutation.partition_key, &row_mut.clustering_key);
                let mut row = match handle.get(&row_key)? {
                    Some(bytes) => decode_row(&bytes)?,
                    None => Row::default(),
                };
                merge_row(&mut row, &row_mut.cells);
                batch.insert(&handle, row_key, encode_row(&row));
            }
        }
        batch.commit()?;
        Ok(())
    }

    fn delete_row(
        &self,
        table: TableId,
        partition_key: &[u8],
        clustering_key: &[u8],
    ) -> anyhow::Result<()> {
        let _guard = match self.write_lock.write() {
            Ok(guard) => guard,
            Err(_) => anyhow::bail!("table store lock poisoned"),
        };
        let handle = self.partition(table)?;
        handle.remove(encode_row_key(partition_key, clustering_key))?;
        Ok(())
    }
}
