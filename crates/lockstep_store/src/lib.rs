//! Lockstep metadata core.
//!
//! Serializes cluster-wide metadata mutations (schema changes and a small
//! strongly-consistent k/v store) through a replicated log, so that every
//! node applies the same sequence of state changes in the same order even
//! when mutations are proposed concurrently from different nodes. The
//! linearization token is a monotonic state-ID chain recorded in the history
//! table; see `client` for the full discipline.

pub mod client;
pub mod command;
pub mod compiler;
pub mod history;
pub mod kv;
pub mod migration;
pub mod schema;
pub mod state_id;
pub mod state_machine;
pub mod storage;
mod wire;

pub use client::{Group0Client, Group0Config, Group0Error, Group0Guard};
pub use command::{Change, Command, KvQuery, QueryResult, SchemaChange};
pub use state_id::StateId;
pub use state_machine::Group0StateMachine;
