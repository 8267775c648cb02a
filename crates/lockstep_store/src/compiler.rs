//! Compilation of parsed statements into k/v queries.
//!
//! The CQL parser lives outside this crate; what arrives here is a small
//! statement model for selects and updates. Only a narrow shape is allowed
//! to travel through group 0: single-key reads of the `value` column and
//! single-assignment updates with at most one `IF value = ...` condition.
//! Everything else is rejected up front with an invalid-request error, and
//! keys and values use UTF-8 text semantics in this version.

use crate::command::KvQuery;
use crate::storage::{find_table, KV_STORE_TABLE};

const KEY_COLUMN: &str = "key";
const VALUE_COLUMN: &str = "value";

/// Comparison operator in a relation or condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Gt,
    In,
}

/// One `column <op> constant` term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    pub column: String,
    pub op: Operator,
    pub value: String,
}

impl Relation {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: Operator::Eq,
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualifiedName {
    pub keyspace: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
        }
    }

    fn is_kv_store(&self) -> bool {
        find_table(&self.keyspace, &self.name) == Some(KV_STORE_TABLE)
    }
}

/// `SELECT <selectors> FROM <table> WHERE <where_clause>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectStatement {
    pub table: QualifiedName,
    pub selectors: Vec<String>,
    pub where_clause: Vec<Relation>,
}

/// `UPDATE <table> SET <assignments> WHERE <where_clause> [IF <conditions>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateStatement {
    pub table: QualifiedName,
    pub assignments: Vec<(String, String)>,
    pub where_clause: Vec<Relation>,
    pub if_conditions: Vec<Relation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Statement {
    Select(SelectStatement),
    Update(UpdateStatement),
}

/// Invalid-request error for statements outside the supported subset.
#[derive(Debug, thiserror::Error)]
#[error("currently unsupported operation on group0_kv_store: {detail}")]
pub struct UnsupportedQueryError {
    detail: String,
}

impl UnsupportedQueryError {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Whether a statement should be routed through group 0 at all.
///
/// A select without a partition-key restriction is a full-table scan and is
/// served by the regular read path, not linearized. Restrictions on other
/// columns do not count; only a restriction on `key` routes the select here.
pub fn targets_kv_store(statement: &Statement) -> bool {
    match statement {
        Statement::Select(select) => {
            select.table.is_kv_store() && has_key_restriction(&select.where_clause)
        }
        Statement::Update(update) => update.table.is_kv_store(),
    }
}

fn has_key_restriction(where_clause: &[Relation]) -> bool {
    where_clause
        .iter()
        .any(|relation| relation.column == KEY_COLUMN)
}

/// Compile a statement into the query payload carried by a group 0 command.
pub fn compile(statement: &Statement) -> Result<KvQuery, UnsupportedQueryError> {
    match statement {
        Statement::Select(select) => compile_select(select),
        Statement::Update(update) => compile_update(update),
    }
}

fn compile_select(select: &SelectStatement) -> Result<KvQuery, UnsupportedQueryError> {
    if select.selectors.len() != 1 || select.selectors[0] != VALUE_COLUMN {
        return Err(UnsupportedQueryError::new("only 'value' selector is allowed"));
    }
    let key = partition_key(&select.where_clause)?;
    Ok(KvQuery::Select {
        key: key.into_bytes(),
    })
}

fn compile_update(update: &UpdateStatement) -> Result<KvQuery, UnsupportedQueryError> {
    let new_value = match update.assignments.as_slice() {
        [(column, value)] if column == VALUE_COLUMN => value.clone(),
        [(column, _)] => {
            return Err(UnsupportedQueryError::new(format!(
                "modification of column '{column}'"
            )));
        }
        other => {
            return Err(UnsupportedQueryError::new(format!(
                "{} modifications in one statement",
                other.len()
            )));
        }
    };

    let key = partition_key(&update.where_clause)?;
    let value_condition = match update.if_conditions.as_slice() {
        [] => None,
        [condition] => {
            if condition.column != VALUE_COLUMN || condition.op != Operator::Eq {
                return Err(UnsupportedQueryError::new(format!(
                    "condition on '{}' with {:?}",
                    condition.column, condition.op
                )));
            }
            Some(condition.value.clone().into_bytes())
        }
        other => {
            return Err(UnsupportedQueryError::new(format!(
                "{} conditions in one statement",
                other.len()
            )));
        }
    };

    Ok(KvQuery::Update {
        key: key.into_bytes(),
        new_value: new_value.into_bytes(),
        value_condition,
    })
}

/// The partition key must be restricted by exactly one equality on `key`.
fn partition_key(where_clause: &[Relation]) -> Result<String, UnsupportedQueryError> {
    match where_clause {
        [relation] if relation.column == KEY_COLUMN && relation.op == Operator::Eq => {
            Ok(relation.value.clone())
        }
        [relation] => Err(UnsupportedQueryError::new(format!(
            "key restriction on '{}' with {:?}",
            relation.column, relation.op
        ))),
        other => Err(UnsupportedQueryError::new(format!(
            "{} key restrictions",
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{GROUP0_KV_STORE_TABLE, SYSTEM_KEYSPACE};

    fn kv_table() -> QualifiedName {
        QualifiedName::new(SYSTEM_KEYSPACE, GROUP0_KV_STORE_TABLE)
    }

    fn select_value(where_clause: Vec<Relation>) -> Statement {
        Statement::Select(SelectStatement {
            table: kv_table(),
            selectors: vec![VALUE_COLUMN.to_string()],
            where_clause,
        })
    }

    #[test]
    fn select_by_key_compiles() {
        let statement = select_value(vec![Relation::eq("key", "k1")]);
        assert_eq!(
            compile(&statement).unwrap(),
            KvQuery::Select {
                key: b"k1".to_vec()
            }
        );
    }

    #[test]
    fn select_of_other_columns_is_rejected() {
        let statement = Statement::Select(SelectStatement {
            table: kv_table(),
            selectors: vec!["key".to_string(), "value".to_string()],
            where_clause: vec![Relation::eq("key", "k1")],
        });
        let err = compile(&statement).unwrap_err();
        assert!(err.to_string().contains("only 'value' selector"));
    }

    #[test]
    fn non_equality_key_restriction_is_rejected() {
        let statement = select_value(vec![Relation {
            column: "key".to_string(),
            op: Operator::Gt,
            value: "k1".to_string(),
        }]);
        assert!(compile(&statement).is_err());
    }

    #[test]
    fn unconditional_update_compiles() {
        let statement = Statement::Update(UpdateStatement {
            table: kv_table(),
            assignments: vec![("value".to_string(), "v1".to_string())],
            where_clause: vec![Relation::eq("key", "k1")],
            if_conditions: vec![],
        });
        assert_eq!(
            compile(&statement).unwrap(),
            KvQuery::Update {
                key: b"k1".to_vec(),
                new_value: b"v1".to_vec(),
                value_condition: None,
            }
        );
    }

    #[test]
    fn conditional_update_compiles() {
        let statement = Statement::Update(UpdateStatement {
            table: kv_table(),
            assignments: vec![("value".to_string(), "v1".to_string())],
            where_clause: vec![Relation::eq("key", "k1")],
            if_conditions: vec![Relation::eq("value", "v0")],
        });
        assert_eq!(
            compile(&statement).unwrap(),
            KvQuery::Update {
                key: b"k1".to_vec(),
                new_value: b"v1".to_vec(),
                value_condition: Some(b"v0".to_vec()),
            }
        );
    }

    #[test]
    fn multi_assignment_update_is_rejected() {
        let statement = Statement::Update(UpdateStatement {
            table: kv_table(),
            assignments: vec![
                ("value".to_string(), "v1".to_string()),
                ("other".to_string(), "x".to_string()),
            ],
            where_clause: vec![Relation::eq("key", "k1")],
            if_conditions: vec![],
        });
        assert!(compile(&statement).is_err());
    }

    #[test]
    fn multi_condition_update_is_rejected() {
        let statement = Statement::Update(UpdateStatement {
            table: kv_table(),
            assignments: vec![("value".to_string(), "v1".to_string())],
            where_clause: vec![Relation::eq("key", "k1")],
            if_conditions: vec![Relation::eq("value", "a"), Relation::eq("value", "b")],
        });
        assert!(compile(&statement).is_err());
    }

    #[test]
    fn non_equality_condition_is_rejected() {
        let statement = Statement::Update(UpdateStatement {
            table: kv_table(),
            assignments: vec![("value".to_string(), "v1".to_string())],
            where_clause: vec![Relation::eq("key", "k1")],
            if_conditions: vec![Relation {
                column: "value".to_string(),
                op: Operator::NotEq,
                value: "v0".to_string(),
            }],
        });
        assert!(compile(&statement).is_err());
    }

    #[test]
    fn routing_predicate_excludes_select_all_and_other_tables() {
        assert!(targets_kv_store(&select_value(vec![Relation::eq(
            "key", "k1"
        )])));
        // Full-table scans go through the regular read path.
        assert!(!targets_kv_store(&select_value(vec![])));
        // So do selects restricted only on non-key columns: without a
        // partition-key restriction they are scans, not routed (and not an
        // error at this layer).
        assert!(!targets_kv_store(&select_value(vec![Relation::eq(
            "value", "v1"
        )])));
        let other_table = Statement::Select(SelectStatement {
            table: QualifiedName::new("ks", "t"),
            selectors: vec![VALUE_COLUMN.to_string()],
            where_clause: vec![Relation::eq("key", "k1")],
        });
        assert!(!targets_kv_store(&other_table));

        let update = Statement::Update(UpdateStatement {
            table: kv_table(),
            assignments: vec![("value".to_string(), "v1".to_string())],
            where_clause: vec![Relation::eq("key", "k1")],
            if_conditions: vec![],
        });
        assert!(targets_kv_store(&update));
    }
}
