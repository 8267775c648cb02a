//! Shared helpers for integration tests.
//!
//! Builds an in-process cluster: one shared log group, and per node a table
//! store, a group 0 client, and a state machine wired together the way a
//! real deployment wires them. Schema merges are recorded so tests can
//! assert exactly-once application, and the migration RPC is served straight
//! from the peers' local state.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use lockstep_raft::mem::MemGroup;
use lockstep_raft::ServerId;
use lockstep_store::client::{Group0Client, Group0Config};
use lockstep_store::command::{KvQuery, QueryResult, SchemaChange};
use lockstep_store::history::History;
use lockstep_store::migration::{MigrationRpc, SnapshotPull};
use lockstep_store::schema::SchemaApplier;
use lockstep_store::state_machine::Group0StateMachine;
use lockstep_store::storage::{CellMutation, MemStore, Mutation, RowMutation, TableId, TableStore};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Table id used for test schema mutations; anything in the schema range
/// works, the core does not interpret these.
pub const TEST_SCHEMA_TABLE: TableId = lockstep_store::storage::SCHEMA_TABLE_BASE;

/// Schema applier that records merged batches and writes them to the store.
pub struct RecordingSchemaApplier {
    store: Arc<MemStore>,
    merged: StdMutex<Vec<Mutation>>,
    merges: StdMutex<usize>,
}

impl RecordingSchemaApplier {
    pub fn new(store: Arc<MemStore>) -> Self {
        Self {
            store,
            merged: StdMutex::new(Vec::new()),
            merges: StdMutex::new(0),
        }
    }

    /// Number of merge calls that reached this node.
    pub fn merge_count(&self) -> usize {
        *self.merges.lock().unwrap()
    }

    /// Every schema mutation merged on this node, in apply order.
    pub fn merged_mutations(&self) -> Vec<Mutation> {
        self.merged.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaApplier for RecordingSchemaApplier {
    async fn merge_schema_from(
        &self,
        _origin: SocketAddr,
        mutations: Vec<Mutation>,
    ) -> anyhow::Result<()> {
        *self.merges.lock().unwrap() += 1;
        self.merged.lock().unwrap().extend(mutations.iter().cloned());
        self.store.apply_mutations(&mutations)
    }
}

struct Peer {
    addr: SocketAddr,
    schema: Arc<RecordingSchemaApplier>,
    history: History,
}

/// Migration RPC served from the peers' in-process state.
pub struct ClusterMigration {
    peers: StdMutex<HashMap<ServerId, Peer>>,
}

impl ClusterMigration {
    fn new() -> Self {
        Self {
            peers: StdMutex::new(HashMap::new()),
        }
    }

    fn add_peer(
        &self,
        id: ServerId,
        addr: SocketAddr,
        schema: Arc<RecordingSchemaApplier>,
        history: History,
    ) {
        self.peers.lock().unwrap().insert(
            id,
            Peer {
                addr,
                schema,
                history,
            },
        );
    }
}

#[async_trait]
impl MigrationRpc for ClusterMigration {
    async fn pull_group0_snapshot(&self, from: ServerId) -> anyhow::Result<SnapshotPull> {
        let peers = self.peers.lock().unwrap();
        let peer = peers
            .get(&from)
            .ok_or_else(|| anyhow::anyhow!("unknown snapshot peer {from}"))?;
        let mut mutations = peer.schema.merged_mutations();
        let history_mutation = peer
            .history
            .last_entry_mutation()?
            .ok_or_else(|| anyhow::anyhow!("snapshot peer {from} has an empty history"))?;
        mutations.push(history_mutation);
        Ok(SnapshotPull {
            origin: peer.addr,
            mutations,
        })
    }
}

pub struct TestNode {
    pub id: ServerId,
    pub addr: SocketAddr,
    pub client: Arc<Group0Client>,
    pub store: Arc<MemStore>,
    pub schema: Arc<RecordingSchemaApplier>,
}

impl TestNode {
    pub fn history(&self) -> &History {
        self.client.history()
    }
}

pub struct TestCluster {
    pub group: MemGroup,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new(size: u64) -> Self {
        init_tracing();
        let group = MemGroup::new();
        let migration = Arc::new(ClusterMigration::new());
        let mut nodes = Vec::new();
        for id in 1..=size {
            let raft = Arc::new(group.add_member(id));
            let store = Arc::new(MemStore::new());
            let addr: SocketAddr = format!("127.0.0.{id}:7000").parse().unwrap();
            let client = Group0Client::new(
                raft,
                store.clone(),
                addr,
                Group0Config::default(),
            );
            let schema = Arc::new(RecordingSchemaApplier::new(store.clone()));
            let sm = Arc::new(Group0StateMachine::new(
                client.clone(),
                store.clone(),
                schema.clone(),
                migration.clone(),
            ));
            group.register_state_machine(id, sm);
            migration.add_peer(id, addr, schema.clone(), History::new(store.clone()));
            nodes.push(TestNode {
                id,
                addr,
                client,
                store,
                schema,
            });
        }
        Self { group, nodes }
    }

    pub fn node(&self, id: ServerId) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .unwrap_or_else(|| panic!("no test node {id}"))
    }
}

/// A schema change creating one table named `name`, timestamped for the
/// guard it travels under.
pub fn sample_schema_change(name: &str, timestamp: i64) -> SchemaChange {
    SchemaChange {
        mutations: vec![Mutation {
            table: TEST_SCHEMA_TABLE,
            partition_key: b"tables".to_vec(),
            rows: vec![RowMutation {
                clustering_key: name.as_bytes().to_vec(),
                cells: vec![CellMutation {
                    column: "definition".to_string(),
                    value: format!("create table {name}").into_bytes(),
                    timestamp,
                }],
            }],
        }],
    }
}

/// Run one guarded schema change end to end on `node`.
pub async fn perform_schema_change(node: &TestNode, name: &str) -> anyhow::Result<()> {
    let abort = CancellationToken::new();
    let guard = node.client.start_operation(&abort).await?;
    let change = sample_schema_change(name, guard.write_timestamp());
    let command = node.client.prepare_command(change, &guard, name);
    node.client.add_entry(command, guard, &abort).await?;
    Ok(())
}

/// Submit a k/v update through the log and fetch its result.
pub async fn kv_update(
    node: &TestNode,
    key: &[u8],
    value: &[u8],
    condition: Option<&[u8]>,
) -> QueryResult {
    let abort = CancellationToken::new();
    let command = node.client.prepare_kv_command(KvQuery::Update {
        key: key.to_vec(),
        new_value: value.to_vec(),
        value_condition: condition.map(|c| c.to_vec()),
    });
    let id = command.new_state_id;
    node.client
        .add_entry_unguarded(command, &abort)
        .await
        .expect("kv update submission failed");
    node.client
        .take_query_result(id)
        .expect("kv update produced no result")
}

/// Submit a k/v select through the log and fetch its result.
pub async fn kv_select(node: &TestNode, key: &[u8]) -> Option<Vec<u8>> {
    let abort = CancellationToken::new();
    let command = node
        .client
        .prepare_kv_command(KvQuery::Select { key: key.to_vec() });
    let id = command.new_state_id;
    node.client
        .add_entry_unguarded(command, &abort)
        .await
        .expect("kv select submission failed");
    match node.client.take_query_result(id) {
        Some(QueryResult::Select { value }) => value,
        other => panic!("unexpected select result {other:?}"),
    }
}
