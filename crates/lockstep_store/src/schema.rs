//! Schema-merge seam.
//!
//! The schema engine itself is external; the group 0 core only hands it
//! mutation batches in apply order, tagged with the address of the node that
//! created the change.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::storage::{Mutation, TableStore};

#[async_trait]
pub trait SchemaApplier: Send + Sync + 'static {
    /// Merge a batch of schema-table mutations originating at `origin`.
    async fn merge_schema_from(
        &self,
        origin: SocketAddr,
        mutations: Vec<Mutation>,
    ) -> anyhow::Result<()>;
}

/// Applier for embedded nodes and tests: writes schema mutations straight
/// into the local table store.
pub struct StoreSchemaApplier {
    store: Arc<dyn TableStore>,
}

impl StoreSchemaApplier {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SchemaApplier for StoreSchemaApplier {
    async fn merge_schema_from(
        &self,
        origin: SocketAddr,
        mutations: Vec<Mutation>,
    ) -> anyhow::Result<()> {
        tracing::trace!(%origin, count = mutations.len(), "merging schema mutations");
        self.store.apply_mutations(&mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CellMutation, MemStore, RowMutation, SCHEMA_TABLE_BASE};

    #[tokio::test]
    async fn store_applier_writes_mutations_through() {
        let store = Arc::new(MemStore::new());
        let applier = StoreSchemaApplier::new(store.clone());
        applier
            .merge_schema_from(
                "10.0.0.1:7000".parse().unwrap(),
                vec![Mutation {
                    table: SCHEMA_TABLE_BASE,
                    partition_key: b"tables".to_vec(),
                    rows: vec![RowMutation {
                        clustering_key: b"t".to_vec(),
                        cells: vec![CellMutation {
                            column: "definition".to_string(),
                            value: b"create".to_vec(),
                            timestamp: 1,
                        }],
                    }],
                }],
            )
            .await
            .unwrap();

        let partition = store
            .read_partition(SCHEMA_TABLE_BASE, b"tables")
            .unwrap()
            .unwrap();
        assert_eq!(partition.rows.len(), 1);
    }
}
