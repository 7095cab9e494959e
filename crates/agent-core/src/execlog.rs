//! Execution Log
//!
//! Durable, append-only record of every dispatch, one log per utility id.
//! A log's structured columns are derived from the utility's parameter
//! schema; the full argument and result payloads are always kept verbatim.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Columns every log carries regardless of the utility's parameters
pub const FIXED_COLUMNS: [&str; 4] = ["id", "created_at", "updated_at", "result"];

/// Per-dispatch bookkeeping stored next to the fixed columns
pub const BOOKKEEPING_COLUMNS: [&str; 5] = [
    "params",
    "success",
    "conversation_id",
    "node_id",
    "parent_node_id",
];

/// Whether a parameter name would collide with a built-in column
pub fn is_reserved_column(name: &str) -> bool {
    FIXED_COLUMNS.contains(&name) || BOOKKEEPING_COLUMNS.contains(&name)
}

/// Reject anything that is not a plain identifier before it names a storage object
pub fn validate_identifier(candidate: &str) -> Result<&str> {
    if IDENTIFIER.is_match(candidate) {
        Ok(candidate)
    } else {
        Err(AgentError::InvalidIdentifier(candidate.to_string()))
    }
}

/// Storage type of a derived column
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Numeric,
    Boolean,
    Json,
}

impl ColumnType {
    /// Map a JSON-schema `type` onto a column type
    pub fn from_json_type(json_type: &str) -> Option<Self> {
        match json_type {
            "string" => Some(Self::Text),
            "integer" | "number" => Some(Self::Numeric),
            "boolean" => Some(Self::Boolean),
            "object" | "array" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Storage layout for one utility's log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSchema {
    pub tool_id: String,
    pub table: String,
    pub columns: Vec<LogColumn>,
}

impl LogSchema {
    /// Derive the layout from a utility's JSON-schema parameters.
    ///
    /// Properties without a mappable `type` get no column. Property names
    /// that are not plain identifiers, or that collide with a fixed column,
    /// are rejected.
    pub fn derive(tool_id: &str, parameters: &serde_json::Value) -> Result<Self> {
        let tool_id = validate_identifier(tool_id)?;
        let mut columns = Vec::new();

        if let Some(properties) = parameters.get("properties").and_then(|p| p.as_object()) {
            for (name, property) in properties {
                let name = validate_identifier(name)?;
                if is_reserved_column(name) {
                    return Err(AgentError::InvalidIdentifier(format!(
                        "{name} (reserved column)"
                    )));
                }
                let Some(column_type) = property
                    .get("type")
                    .and_then(|t| t.as_str())
                    .and_then(ColumnType::from_json_type)
                else {
                    continue;
                };
                columns.push(LogColumn {
                    name: name.to_string(),
                    column_type,
                });
            }
        }

        Ok(Self {
            tool_id: tool_id.to_string(),
            table: format!("log_{tool_id}"),
            columns,
        })
    }

    pub fn column(&self, name: &str) -> Option<&LogColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Argument values that have a column; unknown keys are left out
    pub fn structured_values<'a>(
        &'a self,
        params: &'a serde_json::Value,
    ) -> Vec<(&'a LogColumn, &'a serde_json::Value)> {
        let Some(object) = params.as_object() else {
            return Vec::new();
        };
        self.columns
            .iter()
            .filter_map(|column| object.get(&column.name).map(|value| (column, value)))
            .collect()
    }
}

/// One dispatch, successful or not
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub tool_id: String,
    pub params: serde_json::Value,
    pub result: serde_json::Value,
    pub success: bool,
    pub conversation_id: String,
    pub node_id: String,
    pub parent_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Execution log store trait
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    /// Provision the log for `tool_id` if it does not exist yet
    async fn ensure_log(&self, tool_id: &str, parameters: &serde_json::Value) -> Result<LogSchema>;

    /// Append one entry to an already provisioned log
    async fn append(&self, entry: ExecutionLogEntry) -> Result<()>;
}

/// A stored row: structured columns plus the verbatim entry
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub id: u64,
    pub columns: HashMap<String, serde_json::Value>,
    pub entry: ExecutionLogEntry,
}

#[derive(Default)]
struct MemoryLog {
    schema: Option<LogSchema>,
    records: Vec<LogRecord>,
}

/// In-memory execution log (for development/testing)
#[derive(Default)]
pub struct MemoryExecutionLog {
    logs: RwLock<HashMap<String, MemoryLog>>,
}

impl MemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self, tool_id: &str) -> Vec<LogRecord> {
        self.logs
            .read()
            .await
            .get(tool_id)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    pub async fn entries(&self, tool_id: &str) -> Vec<ExecutionLogEntry> {
        self.records(tool_id)
            .await
            .into_iter()
            .map(|r| r.entry)
            .collect()
    }

    pub async fn schema(&self, tool_id: &str) -> Option<LogSchema> {
        self.logs
            .read()
            .await
            .get(tool_id)
            .and_then(|log| log.schema.clone())
    }
}

#[async_trait]
impl ExecutionLog for MemoryExecutionLog {
    async fn ensure_log(&self, tool_id: &str, parameters: &serde_json::Value) -> Result<LogSchema> {
        let derived = LogSchema::derive(tool_id, parameters)?;
        let mut logs = self.logs.write().await;
        let log = logs.entry(tool_id.to_string()).or_default();
        Ok(log.schema.get_or_insert(derived).clone())
    }

    async fn append(&self, entry: ExecutionLogEntry) -> Result<()> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(&entry.tool_id)
            .ok_or_else(|| AgentError::LogStore(format!("no log for {}", entry.tool_id)))?;
        let schema = log
            .schema
            .as_ref()
            .ok_or_else(|| AgentError::LogStore(format!("no log for {}", entry.tool_id)))?;

        let columns = schema
            .structured_values(&entry.params)
            .into_iter()
            .map(|(column, value)| (column.name.clone(), value.clone()))
            .collect();

        let id = log.records.len() as u64 + 1;
        log.records.push(LogRecord { id, columns, entry });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(tool_id: &str, params: serde_json::Value) -> ExecutionLogEntry {
        let now = Utc::now();
        ExecutionLogEntry {
            tool_id: tool_id.into(),
            params,
            result: json!({"output": "ok"}),
            success: true,
            conversation_id: "c".into(),
            node_id: "n".into(),
            parent_node_id: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn identifiers_are_allow_listed() {
        assert!(validate_identifier("calc").is_ok());
        assert!(validate_identifier("_x9").is_ok());
        assert!(validate_identifier("9x").is_err());
        assert!(validate_identifier("a-b").is_err());
        assert!(validate_identifier("x; DROP TABLE y").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn schema_maps_json_types_to_columns() {
        let params = json!({
            "type": "object",
            "properties": {
                "expr": {"type": "string"},
                "count": {"type": "integer"},
                "ratio": {"type": "number"},
                "flag": {"type": "boolean"},
                "tags": {"type": "array"},
                "extra": {"type": "object"},
                "anything": {}
            }
        });

        let schema = LogSchema::derive("calc", &params).unwrap();

        assert_eq!(schema.table, "log_calc");
        assert_eq!(schema.column("expr").unwrap().column_type, ColumnType::Text);
        assert_eq!(schema.column("count").unwrap().column_type, ColumnType::Numeric);
        assert_eq!(schema.column("ratio").unwrap().column_type, ColumnType::Numeric);
        assert_eq!(schema.column("flag").unwrap().column_type, ColumnType::Boolean);
        assert_eq!(schema.column("tags").unwrap().column_type, ColumnType::Json);
        assert_eq!(schema.column("extra").unwrap().column_type, ColumnType::Json);
        assert!(schema.column("anything").is_none());
    }

    #[test]
    fn hostile_names_are_rejected() {
        assert!(LogSchema::derive("calc\"; --", &json!({})).is_err());
        let params = json!({"properties": {"a b": {"type": "string"}}});
        assert!(LogSchema::derive("calc", &params).is_err());
        let params = json!({"properties": {"result": {"type": "string"}}});
        assert!(LogSchema::derive("calc", &params).is_err());
        let params = json!({"properties": {"node_id": {"type": "string"}}});
        assert!(LogSchema::derive("calc", &params).is_err());
    }

    #[tokio::test]
    async fn unknown_keys_are_left_out_of_columns() {
        let log = MemoryExecutionLog::new();
        let params = json!({"properties": {"expr": {"type": "string"}}});
        log.ensure_log("calc", &params).await.unwrap();
        log.ensure_log("calc", &params).await.unwrap();

        log.append(entry("calc", json!({"expr": "2+2", "junk": 1})))
            .await
            .unwrap();

        let records = log.records("calc").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].columns.get("expr"), Some(&json!("2+2")));
        assert!(!records[0].columns.contains_key("junk"));
        assert_eq!(records[0].entry.params["junk"], json!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_callers_share_one_log() {
        const CALLERS: usize = 16;
        let log = std::sync::Arc::new(MemoryExecutionLog::new());
        let params = json!({"properties": {"expr": {"type": "string"}}});

        let tasks: Vec<_> = (0..CALLERS)
            .map(|i| {
                let log = log.clone();
                let params = params.clone();
                tokio::spawn(async move {
                    log.ensure_log("calc", &params).await.unwrap();
                    log.append(entry("calc", json!({ "expr": format!("{i}+1") })))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(log.logs.read().await.len(), 1);
        let schema = log.schema("calc").await.unwrap();
        assert_eq!(schema, LogSchema::derive("calc", &params).unwrap());

        let records = log.records("calc").await;
        assert_eq!(records.len(), CALLERS);
        let mut ids: Vec<_> = records.iter().map(|r| r.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), CALLERS);
    }

    #[tokio::test]
    async fn append_without_provisioning_fails() {
        let log = MemoryExecutionLog::new();
        assert!(log.append(entry("calc", json!({}))).await.is_err());
    }
}
