//! SQLite adapter over the app database.

use super::{
    AnalysisStatus, AnalysisStore, PluginRecord, PluginRecordStore, ToolAnalysis,
    DEFAULT_CONTAINER_PORT,
};
use crate::{Result, SandholdError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shape of the `server_config` JSON column.
#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    container_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerMeta {
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| SandholdError::Io(std::io::Error::other(e)))?
    }
}

/// Tables are owned by the app; create them only so a fresh install reads as empty.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS mcp_servers (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE,
          server_config TEXT NOT NULL,
          meta TEXT,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tool_analysis (
          mcp_server_id TEXT NOT NULL,
          tool_name TEXT NOT NULL,
          status TEXT NOT NULL,
          is_read INTEGER,
          is_write INTEGER,
          idempotent INTEGER,
          reversible INTEGER,
          analyzed_at TEXT NOT NULL,
          PRIMARY KEY (mcp_server_id, tool_name)
        );
        "#,
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PluginRecord> {
    let name: String = row.get(0)?;
    let server_config: String = row.get(1)?;
    let meta: Option<String> = row.get(2)?;

    let config: ServerConfig = serde_json::from_str(&server_config)
        .map_err(|e| to_sql_err(SandholdError::Json(e)))?;
    // Bad meta only costs us the display name
    let meta: ServerMeta = meta
        .and_then(|m| serde_json::from_str(&m).ok())
        .unwrap_or_default();

    Ok(PluginRecord {
        display_name: meta.display_name.unwrap_or_else(|| name.clone()),
        id: name,
        container_image: config.image,
        command: config.command,
        args: config.args,
        env: config.env,
        container_port: config.container_port.unwrap_or(DEFAULT_CONTAINER_PORT),
    })
}

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<ToolAnalysis> {
    let status: String = row.get(1)?;
    let analyzed_at: String = row.get(6)?;
    Ok(ToolAnalysis {
        tool_name: row.get(0)?,
        status: AnalysisStatus::parse(&status).ok_or_else(|| {
            to_sql_err(SandholdError::Config(format!(
                "unknown analysis status '{}'",
                status
            )))
        })?,
        is_read: row.get(2)?,
        is_write: row.get(3)?,
        idempotent: row.get(4)?,
        reversible: row.get(5)?,
        analyzed_at: parse_rfc3339(&analyzed_at).map_err(to_sql_err)?,
    })
}

#[async_trait]
impl PluginRecordStore for SqliteStore {
    async fn get_all(&self) -> Result<Vec<PluginRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, server_config, meta FROM mcp_servers ORDER BY id")?;
            let rows = stmt.query_map([], record_from_row)?;

            let mut out = Vec::new();
            for row in rows {
                match row {
                    Ok(record) => out.push(record),
                    Err(e) => tracing::warn!("skipping unreadable plugin record: {}", e),
                }
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl AnalysisStore for SqliteStore {
    async fn get_by_plugin_id(&self, plugin_id: &str) -> Result<Vec<ToolAnalysis>> {
        let plugin_id = plugin_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT tool_name, status, is_read, is_write, idempotent, reversible, analyzed_at
                FROM tool_analysis WHERE mcp_server_id = ?1
                "#,
            )?;
            let rows = stmt.query_map([&plugin_id], analysis_from_row)?;

            let mut out = Vec::new();
            for row in rows {
                match row {
                    Ok(analysis) => out.push(analysis),
                    Err(e) => tracing::warn!(
                        plugin_id = %plugin_id,
                        "skipping unreadable tool analysis: {}", e
                    ),
                }
            }
            Ok(out)
        })
        .await
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SandholdError::Config(format!("invalid timestamp '{}': {}", value, e)))
}

fn to_sql_err(err: SandholdError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}
