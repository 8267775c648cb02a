//! Group 0 command model and wire codec.
//!
//! A command is the opaque payload carried through the replicated log. The
//! encoding is a stable tagged format: every union writes one tag byte, so
//! newer versions can add variants without disturbing existing ones, and a
//! decoder that meets a tag it does not know reports an error instead of
//! misreading the buffer.

use std::net::SocketAddr;

use lockstep_raft::ServerId;

use crate::state_id::StateId;
use crate::storage::{CellMutation, Mutation, RowMutation, TableId};
use crate::wire::{
    put_bytes, put_i64, put_u32, put_u64, put_u8, read_bytes, read_i64, read_string, read_u32,
    read_u64, read_u8,
};

/// A batch of schema-table mutations produced by the external schema engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaChange {
    pub mutations: Vec<Mutation>,
}

/// Query against `system.group0_kv_store`. Keys and values are opaque bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvQuery {
    Select {
        key: Vec<u8>,
    },
    /// Unconditional upsert, or compare-and-set when `value_condition` is
    /// present.
    Update {
        key: Vec<u8>,
        new_value: Vec<u8>,
        value_condition: Option<Vec<u8>>,
    },
}

/// Result of executing a `KvQuery`, delivered through the result
/// side-channel on the node that applied the command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryResult {
    /// Unconditional update: nothing to report.
    None,
    Select {
        value: Option<Vec<u8>>,
    },
    ConditionalUpdate {
        applied: bool,
        previous_value: Option<Vec<u8>>,
    },
}

/// What a command changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Schema(SchemaChange),
    Query(KvQuery),
}

/// The unit carried through the replicated log.
///
/// When `prev_state_id` is present, apply is conditional: the command takes
/// effect only while the history's last entry still equals it. A successful
/// apply records `new_state_id` via `history_append` as its final write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub change: Change,
    pub history_append: Mutation,
    pub prev_state_id: Option<StateId>,
    pub new_state_id: StateId,
    pub creator_addr: SocketAddr,
    pub creator_id: ServerId,
}

const CHANGE_SCHEMA: u8 = 1;
const CHANGE_QUERY: u8 = 2;

const QUERY_SELECT: u8 = 1;
const QUERY_UPDATE: u8 = 2;

const PRESENT: u8 = 1;
const ABSENT: u8 = 0;

pub fn encode_command(command: &Command) -> Vec<u8> {
    let mut out = Vec::new();
    match &command.change {
        Change::Schema(change) => {
            put_u8(&mut out, CHANGE_SCHEMA);
            put_u32(&mut out, change.mutations.len() as u32);
            for mutation in &change.mutations {
                encode_mutation(&mut out, mutation);
            }
        }
        Change::Query(query) => {
            put_u8(&mut out, CHANGE_QUERY);
            encode_query(&mut out, query);
        }
    }
    encode_mutation(&mut out, &command.history_append);
    match command.prev_state_id {
        Some(id) => {
            put_u8(&mut out, PRESENT);
            out.extend_from_slice(&id.to_bytes());
        }
        None => put_u8(&mut out, ABSENT),
    }
    out.extend_from_slice(&command.new_state_id.to_bytes());
    put_bytes(&mut out, command.creator_addr.to_string().as_bytes());
    put_u64(&mut out, command.creator_id);
    out
}

pub fn decode_command(data: &[u8]) -> anyhow::Result<Command> {
    let mut offset = 0usize;
    let change = match read_u8(data, &mut offset)? {
        CHANGE_SCHEMA => {
            let count = read_u32(data, &mut offset)? as usize;
            let mut mutations = Vec::with_capacity(count);
            for _ in 0..count {
                mutations.push(decode_mutation(data, &mut offset)?);
            }
            Change::Schema(SchemaChange { mutations })
        }
        CHANGE_QUERY => Change::Query(decode_query(data, &mut offset)?),
        tag => anyhow::bail!("unknown change tag {tag}"),
    };
    let history_append = decode_mutation(data, &mut offset)?;
    let prev_state_id = match read_u8(data, &mut offset)? {
        ABSENT => None,
        PRESENT => Some(decode_state_id(data, &mut offset)?),
        tag => anyhow::bail!("unknown option tag {tag}"),
    };
    let new_state_id = decode_state_id(data, &mut offset)?;
    let creator_addr: SocketAddr = read_string(data, &mut offset)?
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid creator address"))?;
    let creator_id = read_u64(data, &mut offset)?;
    anyhow::ensure!(offset == data.len(), "trailing bytes after command");
    Ok(Command {
        change,
        history_append,
        prev_state_id,
        new_state_id,
        creator_addr,
        creator_id,
    })
}

fn encode_query(out: &mut Vec<u8>, query: &KvQuery) {
    match query {
        KvQuery::Select { key } => {
            put_u8(out, QUERY_SELECT);
            put_bytes(out, key);
        }
        KvQuery::Update {
            key,
            new_value,
            value_condition,
        } => {
            put_u8(out, QUERY_UPDATE);
            put_bytes(out, key);
            put_bytes(out, new_value);
            match value_condition {
                Some(condition) => {
                    put_u8(out, PRESENT);
                    put_bytes(out, condition);
                }
                None => put_u8(out, ABSENT),
            }
        }
    }
}

fn decode_query(data: &[u8], offset: &mut usize) -> anyhow::Result<KvQuery> {
    match read_u8(data, offset)? {
        QUERY_SELECT => Ok(KvQuery::Select {
            key: read_bytes(data, offset)?,
        }),
        QUERY_UPDATE => {
            let key = read_bytes(data, offset)?;
            let new_value = read_bytes(data, offset)?;
            let value_condition = match read_u8(data, offset)? {
                ABSENT => None,
                PRESENT => Some(read_bytes(data, offset)?),
                tag => anyhow::bail!("unknown option tag {tag}"),
            };
            Ok(KvQuery::Update {
                key,
                new_value,
                value_condition,
            })
        }
        tag => anyhow::bail!("unknown query tag {tag}"),
    }
}

fn encode_mutation(out: &mut Vec<u8>, mutation: &Mutation) {
    put_u32(out, mutation.table.0);
    put_bytes(out, &mutation.partition_key);
    put_u32(out, mutation.rows.len() as u32);
    for row in &mutation.rows {
        put_bytes(out, &row.clustering_key);
        put_u32(out, row.cells.len() as u32);
        for cell in &row.cells {
            put_bytes(out, cell.column.as_bytes());
            put_i64(out, cell.timestamp);
            put_bytes(out, &cell.value);
        }
    }
}

fn decode_mutation(data: &[u8], offset: &mut usize) -> anyhow::Result<Mutation> {
    let table = TableId(read_u32(data, offset)?);
    let partition_key = read_bytes(data, offset)?;
    let row_count = read_u32(data, offset)? as usize;
    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let clustering_key = read_bytes(data, offset)?;
        let cell_count = read_u32(data, offset)? as usize;
        let mut cells = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            let column = read_string(data, offset)?;
            let timestamp = read_i64(data, offset)?;
            let value = read_bytes(data, offset)?;
            cells.push(CellMutation {
                column,
                value,
                timestamp,
            });
        }
        rows.push(RowMutation {
            clustering_key,
            cells,
        });
    }
    Ok(Mutation {
        table,
        partition_key,
        rows,
    })
}

fn decode_state_id(data: &[u8], offset: &mut usize) -> anyhow::Result<StateId> {
    anyhow::ensure!(
        *offset + StateId::ENCODED_LEN <= data.len(),
        "short buffer reading state id"
    );
    let mut bytes = [0u8; StateId::ENCODED_LEN];
    bytes.copy_from_slice(&data[*offset..*offset + StateId::ENCODED_LEN]);
    *offset += StateId::ENCODED_LEN;
    Ok(StateId::from_bytes(bytes))
}
