//! SQL update payload carried by transactions
//!
//! The node never parses SQL. It stores the statement, the rollback statement
//! supplied by the SQL proxy and the reference id of the row or table touched.
//! The only inspection done here is sniffing the leading keyword to decide
//! whether a base transaction is required.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::Hash;

/// Marker used as the key part of table-level references (`table:*`)
pub const TABLE_WILDCARD: &str = "*";

/// One mutating SQL statement plus its undo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlUpdate {
    /// `table:primary_key` or `table:*`
    pub reference_id: String,
    pub query: String,
    pub rollback_query: String,
    /// Transaction that last mutated `reference_id`, `None` for table creation
    pub base_tx: Option<Hash>,
}

/// Statement category derived from the leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    CreateTable,
    Insert,
    Update,
    Delete,
    DropTable,
    Other,
}

impl StatementKind {
    pub fn of_query(query: &str) -> Self {
        let mut words = query
            .split_whitespace()
            .map(|w| w.to_ascii_uppercase());
        match (words.next().as_deref(), words.next().as_deref()) {
            (Some("CREATE"), Some("TABLE")) => StatementKind::CreateTable,
            (Some("INSERT"), _) => StatementKind::Insert,
            (Some("UPDATE"), _) => StatementKind::Update,
            (Some("DELETE"), _) => StatementKind::Delete,
            (Some("DROP"), Some("TABLE")) => StatementKind::DropTable,
            _ => StatementKind::Other,
        }
    }

    /// Every statement except table creation must name a predecessor
    pub fn requires_base(self) -> bool {
        self != StatementKind::CreateTable
    }
}

impl SqlUpdate {
    pub fn new(reference_id: impl Into<String>, query: impl Into<String>, rollback_query: impl Into<String>) -> Self {
        Self {
            reference_id: reference_id.into(),
            query: query.into(),
            rollback_query: rollback_query.into(),
            base_tx: None,
        }
    }

    pub fn with_base(mut self, base: Option<Hash>) -> Self {
        self.base_tx = base;
        self
    }

    pub fn kind(&self) -> StatementKind {
        StatementKind::of_query(&self.query)
    }

    pub fn requires_base(&self) -> bool {
        self.kind().requires_base()
    }

    /// Table part of the reference id
    pub fn table(&self) -> &str {
        self.reference_id
            .split_once(':')
            .map(|(table, _)| table)
            .unwrap_or(&self.reference_id)
    }

    /// An insert may follow the table-level reference when the row has no history
    pub fn alt_reference_id(&self) -> Option<String> {
        (self.kind() == StatementKind::Insert)
            .then(|| format!("{}:{}", self.table(), TABLE_WILDCARD))
    }

    /// Bytes covered by the transaction id
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for part in [&self.reference_id, &self.query, &self.rollback_query] {
            bytes.extend_from_slice(&(part.len() as u32).to_le_bytes());
            bytes.extend_from_slice(part.as_bytes());
        }
        bytes.extend_from_slice(&self.base_tx.unwrap_or_default().0);
        bytes
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqlExecError {
    #[error("SQL execution failed: {0}")]
    Execution(String),
    #[error("SQL rollback failed: {0}")]
    Rollback(String),
    #[error("Query can not be described: {0}")]
    Describe(String),
}

/// What the SQL layer reports about a statement before it is executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlDescription {
    pub reference_id: String,
    pub rollback_query: String,
}

/// Capability supplied by the SQL interception layer
pub trait SqlExecutor: Send + Sync {
    /// Resolve the affected reference and the undo statement for a raw query
    fn describe(&self, query: &str) -> Result<SqlDescription, SqlExecError>;

    /// Apply the statement of a transaction to the local database
    fn execute(&self, update: &SqlUpdate) -> Result<(), SqlExecError>;

    /// Apply the rollback statement of a transaction
    fn rollback(&self, update: &SqlUpdate) -> Result<(), SqlExecError>;
}

/// Executor that only logs statements. Used when the node runs without a
/// database behind it.
#[derive(Debug, Default, Clone)]
pub struct TracingExecutor;

impl SqlExecutor for TracingExecutor {
    fn describe(&self, query: &str) -> Result<SqlDescription, SqlExecError> {
        Err(SqlExecError::Describe(format!(
            "no database attached, can not describe {query:?}"
        )))
    }

    fn execute(&self, update: &SqlUpdate) -> Result<(), SqlExecError> {
        info!(reference = %update.reference_id, query = %update.query, "execute SQL");
        Ok(())
    }

    fn rollback(&self, update: &SqlUpdate) -> Result<(), SqlExecError> {
        info!(reference = %update.reference_id, query = %update.rollback_query, "rollback SQL");
        Ok(())
    }
}

/// Event seen by a [`RecordingExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlEvent {
    Executed(String),
    RolledBack(String),
}

/// Executor that remembers the order of statements it was asked to run.
///
/// `describe` takes the table from the word after `UPDATE` or the query's third
/// word, and for row statements a trailing `id=<key>` as the row key.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    events: Mutex<Vec<SqlEvent>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SqlEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn record(&self, event: SqlEvent) {
        debug!(?event, "recorded SQL event");
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl SqlExecutor for RecordingExecutor {
    fn describe(&self, query: &str) -> Result<SqlDescription, SqlExecError> {
        let kind = StatementKind::of_query(query);
        let words: Vec<&str> = query.split_whitespace().collect();
        let table_word = if kind == StatementKind::Update { 1 } else { 2 };
        let table = words
            .get(table_word)
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SqlExecError::Describe(query.to_string()))?;
        let key = words
            .iter()
            .rev()
            .find_map(|w| w.strip_prefix("id="))
            .unwrap_or(TABLE_WILDCARD);
        let reference_id = match kind {
            StatementKind::CreateTable | StatementKind::DropTable => format!("{table}:{TABLE_WILDCARD}"),
            _ => format!("{table}:{key}"),
        };
        Ok(SqlDescription {
            reference_id,
            rollback_query: format!("UNDO {query}"),
        })
    }

    fn execute(&self, update: &SqlUpdate) -> Result<(), SqlExecError> {
        self.record(SqlEvent::Executed(update.query.clone()));
        Ok(())
    }

    fn rollback(&self, update: &SqlUpdate) -> Result<(), SqlExecError> {
        self.record(SqlEvent::RolledBack(update.query.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_kind_sniffing() {
        assert_eq!(StatementKind::of_query("create table t (id int)"), StatementKind::CreateTable);
        assert_eq!(StatementKind::of_query("  INSERT INTO t VALUES (1)"), StatementKind::Insert);
        assert_eq!(StatementKind::of_query("UPDATE t SET a=1"), StatementKind::Update);
        assert_eq!(StatementKind::of_query("delete from t"), StatementKind::Delete);
        assert_eq!(StatementKind::of_query("DROP TABLE t"), StatementKind::DropTable);
        assert_eq!(StatementKind::of_query("SELECT 1"), StatementKind::Other);
        assert!(!StatementKind::CreateTable.requires_base());
        assert!(StatementKind::Insert.requires_base());
    }

    #[test]
    fn test_alt_reference_only_for_insert() {
        let insert = SqlUpdate::new("t:5", "INSERT INTO t VALUES (5)", "DELETE FROM t WHERE id=5");
        assert_eq!(insert.table(), "t");
        assert_eq!(insert.alt_reference_id().as_deref(), Some("t:*"));

        let update = SqlUpdate::new("t:5", "UPDATE t SET a=2", "UPDATE t SET a=1");
        assert_eq!(update.alt_reference_id(), None);
    }

    #[test]
    fn test_base_changes_bytes() {
        let plain = SqlUpdate::new("t:1", "UPDATE t SET a=1", "UPDATE t SET a=0");
        let based = plain.clone().with_base(Some(crate::crypto::hash_bytes(b"base")));
        assert_ne!(plain.to_bytes(), based.to_bytes());
    }

    #[test]
    fn test_recording_executor_describe() {
        let exec = RecordingExecutor::new();
        let create = exec.describe("CREATE TABLE users (id int)").unwrap();
        assert_eq!(create.reference_id, "users:*");
        let insert = exec.describe("INSERT INTO users VALUES id=7").unwrap();
        assert_eq!(insert.reference_id, "users:7");
        let update = exec.describe("UPDATE users SET name='x' WHERE id=7").unwrap();
        assert_eq!(update.reference_id, "users:7");
        assert!(exec.describe("VACUUM").is_err());
    }

    #[test]
    fn test_recording_executor_keeps_order() {
        let exec = RecordingExecutor::new();
        let a = SqlUpdate::new("t:*", "CREATE TABLE t", "DROP TABLE t");
        exec.execute(&a).unwrap();
        exec.rollback(&a).unwrap();
        assert_eq!(
            exec.events(),
            vec![
                SqlEvent::Executed("CREATE TABLE t".into()),
                SqlEvent::RolledBack("CREATE TABLE t".into()),
            ]
        );
    }
}
