//! SQLite Execution Log
//!
//! One table per utility (`log_<id>`), provisioned on first dispatch with
//! `CREATE TABLE IF NOT EXISTS`. Columns that a newer parameter schema adds
//! are appended with `ALTER TABLE`; existing columns are never dropped.
//!
//! rusqlite is synchronous, so every statement runs on `spawn_blocking`
//! behind a shared `Arc<Mutex<Connection>>`. Provisioning runs in an
//! immediate transaction, so processes sharing one database file do not
//! race on adding columns.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_core::error::{AgentError, Result};
use agent_core::execlog::{ColumnType, ExecutionLog, ExecutionLogEntry, LogColumn, LogSchema};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Transaction, TransactionBehavior, params_from_iter};

const MEMORY_PATH: &str = ":memory:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the log database lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqliteLogConfig {
    pub path: PathBuf,
}

impl Default for SqliteLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("execution_log.db"),
        }
    }
}

impl SqliteLogConfig {
    pub fn memory() -> Self {
        Self {
            path: PathBuf::from(MEMORY_PATH),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `EXECUTION_LOG_PATH`, `:memory:` for a throwaway database
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        lookup("EXECUTION_LOG_PATH")
            .filter(|p| !p.trim().is_empty())
            .map_or_else(Self::default, |path| Self {
                path: PathBuf::from(path),
            })
    }
}

fn store_error(e: impl std::fmt::Display) -> AgentError {
    AgentError::LogStore(e.to_string())
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text | ColumnType::Json => "TEXT",
        ColumnType::Numeric => "NUMERIC",
        ColumnType::Boolean => "INTEGER",
    }
}

/// Bind a JSON argument according to its column's storage type
fn sql_value(column: &LogColumn, value: &serde_json::Value) -> SqlValue {
    match (column.column_type, value) {
        (_, serde_json::Value::Null) => SqlValue::Null,
        (ColumnType::Text, serde_json::Value::String(s)) => SqlValue::Text(s.clone()),
        (ColumnType::Numeric, v) => v
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| v.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        (ColumnType::Boolean, v) => v
            .as_bool()
            .map_or(SqlValue::Null, |b| SqlValue::Integer(i64::from(b))),
        (ColumnType::Text | ColumnType::Json, v) => SqlValue::Text(v.to_string()),
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn create_table_sql(schema: &LogSchema) -> String {
    let mut columns = vec![
        "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "\"created_at\" TEXT NOT NULL".to_string(),
        "\"updated_at\" TEXT NOT NULL".to_string(),
        "\"result\" TEXT NOT NULL".to_string(),
        "\"params\" TEXT NOT NULL".to_string(),
        "\"success\" INTEGER NOT NULL".to_string(),
        "\"conversation_id\" TEXT NOT NULL".to_string(),
        "\"node_id\" TEXT NOT NULL".to_string(),
        "\"parent_node_id\" TEXT".to_string(),
    ];
    columns.extend(
        schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote(&c.name), sql_type(c.column_type))),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&schema.table),
        columns.join(", ")
    )
}

fn existing_columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    names.collect()
}

fn provision(conn: &Connection, schema: &LogSchema) -> rusqlite::Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute_batch(&create_table_sql(schema))?;

    let existing = existing_columns(&tx, &schema.table)?;
    for column in schema.columns.iter().filter(|c| !existing.contains(&c.name)) {
        tracing::info!(table = %schema.table, column = %column.name, "Adding log column");
        tx.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote(&schema.table),
            quote(&column.name),
            sql_type(column.column_type)
        ))?;
    }
    tx.commit()
}

fn insert(conn: &Connection, schema: &LogSchema, entry: &ExecutionLogEntry) -> rusqlite::Result<()> {
    let mut names = vec![
        "created_at",
        "updated_at",
        "result",
        "params",
        "success",
        "conversation_id",
        "node_id",
        "parent_node_id",
    ]
    .into_iter()
    .map(quote)
    .collect::<Vec<_>>();

    let mut values = vec![
        SqlValue::Text(entry.started_at.to_rfc3339()),
        SqlValue::Text(entry.finished_at.to_rfc3339()),
        SqlValue::Text(entry.result.to_string()),
        SqlValue::Text(entry.params.to_string()),
        SqlValue::Integer(i64::from(entry.success)),
        SqlValue::Text(entry.conversation_id.clone()),
        SqlValue::Text(entry.node_id.clone()),
        entry
            .parent_node_id
            .clone()
            .map_or(SqlValue::Null, SqlValue::Text),
    ];

    for (column, value) in schema.structured_values(&entry.params) {
        names.push(quote(&column.name));
        values.push(sql_value(column, value));
    }

    let placeholders = (1..=values.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote(&schema.table),
        names.join(", ")
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// SQLite-backed execution log
#[derive(Clone)]
pub struct SqliteExecutionLog {
    conn: Arc<Mutex<Connection>>,
    schemas: Arc<Mutex<HashMap<String, LogSchema>>>,
}

impl SqliteExecutionLog {
    pub fn open(config: &SqliteLogConfig) -> Result<Self> {
        tracing::info!(path = ?config.path, "Opening execution log");
        let conn = if config.path.as_os_str() == MEMORY_PATH {
            Connection::open_in_memory().map_err(store_error)?
        } else {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(store_error)?;
            }
            Connection::open(&config.path).map_err(store_error)?
        };
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(store_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(store_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            schemas: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// In-memory database for tests
    pub fn memory() -> Result<Self> {
        Self::open(&SqliteLogConfig::memory())
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&SqliteLogConfig {
            path: path.as_ref().to_path_buf(),
        })
    }

    async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(store_error)?
        .map_err(store_error)
    }

    /// Number of rows in a utility's log
    pub async fn count(&self, tool_id: &str) -> Result<u64> {
        let schema = self.schema(tool_id)?;
        let rows: i64 = self
            .with_connection(move |conn| {
                conn.query_row(
                    &format!("SELECT COUNT(*) FROM {}", quote(&schema.table)),
                    [],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(rows.unsigned_abs())
    }

    /// Column names of a provisioned log table, in table order
    pub async fn table_columns(&self, tool_id: &str) -> Result<Vec<String>> {
        let schema = self.schema(tool_id)?;
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(&schema.table)))?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            names.collect()
        })
        .await
    }

    /// Most recent rows, newest first, as JSON objects
    pub async fn recent(&self, tool_id: &str, limit: usize) -> Result<Vec<serde_json::Value>> {
        let schema = self.schema(tool_id)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM {} ORDER BY \"id\" DESC LIMIT ?1",
                quote(&schema.table)
            ))?;
            let names: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
            let rows = stmt.query_map([limit], |row| {
                let mut object = serde_json::Map::new();
                for (i, name) in names.iter().enumerate() {
                    let value = match row.get::<_, SqlValue>(i)? {
                        SqlValue::Null => serde_json::Value::Null,
                        SqlValue::Integer(n) => n.into(),
                        SqlValue::Real(f) => f.into(),
                        SqlValue::Text(s) => s.into(),
                        SqlValue::Blob(b) => serde_json::Value::from(b),
                    };
                    object.insert(name.clone(), value);
                }
                Ok(serde_json::Value::Object(object))
            })?;
            rows.collect()
        })
        .await
    }

    fn schema(&self, tool_id: &str) -> Result<LogSchema> {
        self.schemas
            .lock()
            .get(tool_id)
            .cloned()
            .ok_or_else(|| AgentError::LogStore(format!("no log for {tool_id}")))
    }
}

#[async_trait]
impl ExecutionLog for SqliteExecutionLog {
    async fn ensure_log(&self, tool_id: &str, parameters: &serde_json::Value) -> Result<LogSchema> {
        if let Ok(schema) = self.schema(tool_id) {
            return Ok(schema);
        }

        let derived = LogSchema::derive(tool_id, parameters)?;
        let schema = derived.clone();
        self.with_connection(move |conn| provision(conn, &schema))
            .await?;

        tracing::debug!(table = %derived.table, columns = derived.columns.len(), "Execution log ready");
        Ok(self
            .schemas
            .lock()
            .entry(tool_id.to_string())
            .or_insert(derived)
            .clone())
    }

    async fn append(&self, entry: ExecutionLogEntry) -> Result<()> {
        let schema = self.schema(&entry.tool_id)?;
        self.with_connection(move |conn| insert(conn, &schema, &entry))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn calc_parameters() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "expr": {"type": "string"},
                "precision": {"type": "integer"},
                "exact": {"type": "boolean"},
                "tags": {"type": "array"}
            },
            "required": ["expr"]
        })
    }

    fn entry(params: serde_json::Value, success: bool) -> ExecutionLogEntry {
        let now = Utc::now();
        ExecutionLogEntry {
            tool_id: "calc".into(),
            params,
            result: json!({"output": "4"}),
            success,
            conversation_id: "conv-1".into(),
            node_id: "node-2".into(),
            parent_node_id: Some("node-1".into()),
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn config_from_lookup() {
        let config = SqliteLogConfig::from_lookup(|_| None);
        assert_eq!(config, SqliteLogConfig::default());
        let config = SqliteLogConfig::from_lookup(|_| Some(":memory:".into()));
        assert_eq!(config, SqliteLogConfig::memory());
    }

    #[tokio::test]
    async fn provisions_typed_columns() {
        let log = SqliteExecutionLog::memory().unwrap();
        let schema = log.ensure_log("calc", &calc_parameters()).await.unwrap();
        assert_eq!(schema.table, "log_calc");

        let columns = log.table_columns("calc").await.unwrap();
        for fixed in ["id", "created_at", "updated_at", "result", "params", "success"] {
            assert!(columns.iter().any(|c| c == fixed), "missing {fixed}");
        }
        for derived in ["expr", "precision", "exact", "tags"] {
            assert!(columns.iter().any(|c| c == derived), "missing {derived}");
        }
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let log = SqliteExecutionLog::memory().unwrap();
        log.ensure_log("calc", &calc_parameters()).await.unwrap();
        log.ensure_log("calc", &calc_parameters()).await.unwrap();
        log.append(entry(json!({"expr": "2+2"}), true)).await.unwrap();
        assert_eq!(log.count("calc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn appends_structured_and_verbatim_values() {
        let log = SqliteExecutionLog::memory().unwrap();
        log.ensure_log("calc", &calc_parameters()).await.unwrap();

        log.append(entry(
            json!({"expr": "2+2", "precision": 3, "exact": true, "tags": ["a"], "junk": "x"}),
            true,
        ))
        .await
        .unwrap();
        log.append(entry(json!({"expr": "1/0"}), false)).await.unwrap();

        let rows = log.recent("calc", 10).await.unwrap();
        assert_eq!(rows.len(), 2);

        let failed = &rows[0];
        assert_eq!(failed["success"], json!(0));
        assert_eq!(failed["precision"], serde_json::Value::Null);

        let ok = &rows[1];
        assert_eq!(ok["expr"], json!("2+2"));
        assert_eq!(ok["precision"], json!(3));
        assert_eq!(ok["exact"], json!(1));
        assert_eq!(ok["tags"], json!("[\"a\"]"));
        assert_eq!(ok["parent_node_id"], json!("node-1"));
        let params: serde_json::Value =
            serde_json::from_str(ok["params"].as_str().unwrap()).unwrap();
        assert_eq!(params["junk"], json!("x"));
        assert!(ok.get("junk").is_none());
    }

    #[tokio::test]
    async fn hostile_identifiers_never_reach_sql() {
        let log = SqliteExecutionLog::memory().unwrap();
        let err = log
            .ensure_log("calc\"; DROP TABLE x; --", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidIdentifier(_)));

        let params = json!({"properties": {"a\" TEXT); --": {"type": "string"}}});
        assert!(log.ensure_log("calc", &params).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_callers_share_one_table() {
        const CALLERS: usize = 16;
        let log = SqliteExecutionLog::memory().unwrap();

        let tasks: Vec<_> = (0..CALLERS)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    log.ensure_log("calc", &calc_parameters()).await.unwrap();
                    log.append(entry(json!({ "expr": format!("{i}+1") }), true))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(log.count("calc").await.unwrap(), CALLERS as u64);
        let tables: i64 = log
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'log_calc'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stores_sharing_a_file_provision_once() {
        const CALLERS: usize = 8;
        let path = std::env::temp_dir().join(format!("execlog-{}.db", uuid::Uuid::new_v4()));
        let stores = [
            SqliteExecutionLog::open_path(&path).unwrap(),
            SqliteExecutionLog::open_path(&path).unwrap(),
        ];

        let tasks: Vec<_> = (0..CALLERS)
            .map(|i| {
                let log = stores[i % 2].clone();
                tokio::spawn(async move {
                    log.ensure_log("calc", &calc_parameters()).await.unwrap();
                    log.append(entry(json!({ "expr": "1+1" }), true)).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(stores[0].count("calc").await.unwrap(), CALLERS as u64);
        let mut columns = stores[1].table_columns("calc").await.unwrap();
        let total = columns.len();
        columns.sort();
        columns.dedup();
        assert_eq!(columns.len(), total);
        for derived in ["expr", "precision", "exact", "tags"] {
            assert!(columns.iter().any(|c| c == derived), "missing {derived}");
        }

        drop(stores);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn append_before_provisioning_fails() {
        let log = SqliteExecutionLog::memory().unwrap();
        let err = log.append(entry(json!({}), true)).await.unwrap_err();
        assert!(matches!(err, AgentError::LogStore(_)));
    }

    #[tokio::test]
    async fn reopened_table_gains_new_columns() {
        let path = std::env::temp_dir().join(format!("execlog-{}.db", uuid::Uuid::new_v4()));

        let first = SqliteExecutionLog::open_path(&path).unwrap();
        first
            .ensure_log("calc", &json!({"properties": {"expr": {"type": "string"}}}))
            .await
            .unwrap();
        drop(first);

        let second = SqliteExecutionLog::open_path(&path).unwrap();
        second.ensure_log("calc", &calc_parameters()).await.unwrap();
        let columns = second.table_columns("calc").await.unwrap();
        assert!(columns.iter().any(|c| c == "precision"));
        drop(second);

        let _ = std::fs::remove_file(&path);
    }
}
