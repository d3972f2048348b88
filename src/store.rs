//! Durable, queryable log of captured [`MessageRecord`]s (C1).

use crate::error::{McpHawkError, Result};
use crate::record::{Direction, MessageRecord, Peer, RecordMetadata, TransportType};
use anyhow::Context;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Mutex;

/// A row of the `logs` table as it appears on disk, before being lifted
/// into a [`MessageRecord`].
struct Row {
    log_id: String,
    timestamp: DateTime<Utc>,
    src_ip: String,
    dst_ip: String,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    direction: String,
    message: String,
    transport_type: String,
    metadata: Option<String>,
    pid: Option<u32>,
}

impl Row {
    fn into_record(self) -> Result<MessageRecord> {
        let metadata = match self.metadata {
            Some(s) if !s.is_empty() => Some(
                serde_json::from_str::<RecordMetadata>(&s)
                    .map_err(|e| McpHawkError::MalformedRecord(e.to_string()))?,
            ),
            _ => None,
        };
        Ok(MessageRecord {
            log_id: self.log_id,
            timestamp: self.timestamp,
            src: Peer { ip: self.src_ip, port: self.src_port },
            dst: Peer { ip: self.dst_ip, port: self.dst_port },
            pid: self.pid,
            direction: Direction::parse(&self.direction),
            transport_type: TransportType::parse(&self.transport_type),
            message: self.message,
            metadata,
        })
    }
}

/// Filters shared by `search` and the analytics read paths.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub message_type: Option<String>,
    pub transport_type: Option<TransportType>,
    pub server_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// SQLite-backed append-only store for captured traffic.
///
/// A single [`Connection`] guarded by a mutex gives us the "single
/// logical writer, many concurrent readers" guarantee from the storage
/// contract without reaching for a connection pool the tool doesn't need.
pub struct MessageStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

const ENV_OVERRIDE: &str = "MCPHAWK_STORE_DB";

impl MessageStore {
    /// Open the default store, honoring `MCPHAWK_STORE_DB` if set.
    pub fn open_default() -> Result<Self> {
        if let Ok(override_path) = std::env::var(ENV_OVERRIDE) {
            return Self::open(override_path);
        }

        let proj_dirs = ProjectDirs::from("io", "mcphawk", "mcphawk")
            .ok_or_else(|| McpHawkError::StoreUnavailable("could not determine data directory".into()))?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .context("failed to create data directory")
            .map_err(|e| McpHawkError::StoreUnavailable(e.to_string()))?;

        Self::open(data_dir.join("mcphawk.db"))
    }

    /// Open (or create) the store at an explicit path.
    pub fn open<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .context("failed to create parent directory for store")
                .map_err(|e| McpHawkError::StoreUnavailable(e.to_string()))?;
        }

        let conn = Connection::open(&db_path)
            .context("failed to open sqlite database")
            .map_err(|e| McpHawkError::StoreUnavailable(e.to_string()))?;

        let store = Self { conn: Mutex::new(conn), db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                log_id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                src_ip TEXT NOT NULL,
                dst_ip TEXT NOT NULL,
                src_port INTEGER,
                dst_port INTEGER,
                direction TEXT NOT NULL,
                message TEXT NOT NULL,
                transport_type TEXT,
                metadata TEXT,
                pid INTEGER
            )",
            [],
        )
        .context("failed to create logs table")
        .map_err(|e| McpHawkError::Storage(e.to_string()))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp)",
            [],
        )
        .ok();

        self.migrate(&conn)?;
        Ok(())
    }

    /// Forward-only schema evolution: add any of the optional columns
    /// introduced after the original `logs` schema, and normalize the
    /// legacy `traffic_type` column to `unknown`.
    fn migrate(&self, conn: &Connection) -> Result<()> {
        let mut existing = std::collections::HashSet::new();
        {
            let mut stmt = conn
                .prepare("PRAGMA table_info(logs)")
                .map_err(|e| McpHawkError::Storage(e.to_string()))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(|e| McpHawkError::Storage(e.to_string()))?;
            for name in names.flatten() {
                existing.insert(name);
            }
        }

        for (col, ddl) in [
            ("transport_type", "ALTER TABLE logs ADD COLUMN transport_type TEXT"),
            ("metadata", "ALTER TABLE logs ADD COLUMN metadata TEXT"),
            ("pid", "ALTER TABLE logs ADD COLUMN pid INTEGER"),
        ] {
            if !existing.contains(col) {
                conn.execute(ddl, [])
                    .context("failed to migrate logs schema")
                    .map_err(|e| McpHawkError::Storage(e.to_string()))?;
            }
        }

        // Legacy `traffic_type` values (TCP/WS, TCP/Direct, ...) never map to
        // a first-class transport; normalize any stragglers to `unknown`.
        if existing.contains("traffic_type") {
            conn.execute(
                "UPDATE logs SET transport_type = 'unknown'
                 WHERE transport_type IS NULL AND traffic_type IS NOT NULL",
                [],
            )
            .ok();
        }

        Ok(())
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Append `record`. Fails with [`McpHawkError::DuplicateId`] if
    /// `log_id` already exists, and [`McpHawkError::MalformedRecord`] if
    /// the record fails validation.
    pub fn insert(&self, record: &MessageRecord) -> Result<()> {
        record
            .validate()
            .map_err(McpHawkError::MalformedRecord)?;

        let metadata_json = match &record.metadata {
            Some(m) if !m.is_empty() => Some(
                serde_json::to_string(m).map_err(|e| McpHawkError::Serialization(e))?,
            ),
            _ => None,
        };

        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO logs
                (log_id, timestamp, src_ip, dst_ip, src_port, dst_port, direction,
                 message, transport_type, metadata, pid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.log_id,
                record.timestamp.to_rfc3339(),
                record.src.ip,
                record.dst.ip,
                record.src.port,
                record.dst.port,
                record.direction.as_str(),
                record.message,
                record.transport_type.as_str(),
                metadata_json,
                record.pid,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(McpHawkError::DuplicateId(record.log_id.clone()).into())
            }
            Err(e) => Err(McpHawkError::Storage(e.to_string()).into()),
        }
    }

    /// Up to `limit` records, newest-first by `timestamp`.
    pub fn fetch_recent(&self, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY timestamp DESC LIMIT ?1", SELECT_COLUMNS))
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit as i64], row_mapper)
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    /// Stable pagination, newest-first by `log_id`.
    pub fn fetch_page(&self, limit: usize, offset: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "{} ORDER BY log_id DESC LIMIT ?1 OFFSET ?2",
                SELECT_COLUMNS
            ))
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_mapper)
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    /// Look up a single record by id.
    pub fn get_by_id(&self, log_id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("{} WHERE log_id = ?1", SELECT_COLUMNS))
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        let row = stmt
            .query_row(params![log_id], row_mapper)
            .optional()
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        row.map(Row::into_record).transpose()
    }

    /// Case-insensitive substring search against `message`, with optional
    /// filters, newest-first.
    pub fn search(
        &self,
        substring: &str,
        message_type: Option<&str>,
        transport_type: Option<TransportType>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut query = format!("{} WHERE message LIKE ?1 ESCAPE '\\'", SELECT_COLUMNS);
        let pattern = format!("%{}%", escape_like(substring));
        let mut bind_transport = None;
        if let Some(t) = transport_type {
            query.push_str(" AND transport_type = ?2");
            bind_transport = Some(t.as_str().to_string());
        }
        query.push_str(" ORDER BY timestamp DESC LIMIT ?3");

        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;

        let rows: Vec<MessageRecord> = if let Some(transport) = &bind_transport {
            let mapped = stmt
                .query_map(params![pattern, transport, limit as i64], row_mapper)
                .map_err(|e| McpHawkError::Storage(e.to_string()))?;
            collect_rows(mapped)?
        } else {
            let mapped = stmt
                .query_map(params![pattern, limit as i64], row_mapper)
                .map_err(|e| McpHawkError::Storage(e.to_string()))?;
            collect_rows(mapped)?
        };

        // message_type is derived, not stored, so filter in application code.
        if let Some(mt) = message_type {
            Ok(rows
                .into_iter()
                .filter(|r| r.message_type().as_str() == mt)
                .collect())
        } else {
            Ok(rows)
        }
    }

    /// Read-only scan surface consumed by the analytics engine. Returns
    /// records in `[start, end]` (inclusive), optionally filtered by
    /// transport and/or server name, in chronological order.
    pub fn aggregate(&self, filters: &QueryFilters) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut query = format!("{} WHERE 1=1", SELECT_COLUMNS);
        let mut bind_start = None;
        let mut bind_end = None;
        let mut bind_transport = None;
        let mut bind_server = None;

        if let Some(s) = filters.start_time {
            query.push_str(" AND timestamp >= ?");
            bind_start = Some(s.to_rfc3339());
        }
        if let Some(e) = filters.end_time {
            query.push_str(" AND timestamp <= ?");
            bind_end = Some(e.to_rfc3339());
        }
        if let Some(t) = filters.transport_type {
            query.push_str(" AND transport_type = ?");
            bind_transport = Some(t.as_str().to_string());
        }
        if let Some(name) = &filters.server_name {
            query.push_str(" AND metadata LIKE ?");
            bind_server = Some(format!("%\"server_name\":\"{}\"%", escape_like(name)));
        }
        query.push_str(" ORDER BY timestamp ASC");

        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(s) = bind_start {
            params_vec.push(Box::new(s));
        }
        if let Some(e) = bind_end {
            params_vec.push(Box::new(e));
        }
        if let Some(t) = bind_transport {
            params_vec.push(Box::new(t));
        }
        if let Some(s) = bind_server {
            params_vec.push(Box::new(s));
        }
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|b| b.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), row_mapper)
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    /// `(min_timestamp, max_timestamp)` over the whole store, used by the
    /// analytics engine to default an unbounded window.
    pub fn time_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let conn = self.conn.lock().unwrap();
        let row: (Option<String>, Option<String>) = conn
            .query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM logs",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;

        match row {
            (Some(min), Some(max)) => {
                let min = DateTime::parse_from_rfc3339(&min)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| McpHawkError::Storage(e.to_string()))?;
                let max = DateTime::parse_from_rfc3339(&max)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| McpHawkError::Storage(e.to_string()))?;
                Ok(Some((min, max)))
            }
            _ => Ok(None),
        }
    }

    /// Total record count.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM logs", [], |r| r.get(0))
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        Ok(count as usize)
    }

    /// Unique JSON-RPC methods seen, sorted.
    pub fn unique_methods(&self) -> Result<Vec<String>> {
        let records = self.aggregate(&QueryFilters::default())?;
        let mut methods: Vec<String> = records.into_iter().filter_map(|r| r.method()).collect();
        methods.sort();
        methods.dedup();
        Ok(methods)
    }

    /// Remove all records. Test-only.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM logs", [])
            .map_err(|e| McpHawkError::Storage(e.to_string()))?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str = "SELECT log_id, timestamp, src_ip, dst_ip, src_port, dst_port, \
     direction, message, transport_type, metadata, pid FROM logs";

fn row_mapper(row: &rusqlite::Row) -> rusqlite::Result<Row> {
    Ok(Row {
        log_id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&row.get::<_, String>(1)?)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        src_ip: row.get(2)?,
        dst_ip: row.get(3)?,
        src_port: row.get(4)?,
        dst_port: row.get(5)?,
        direction: row.get(6)?,
        message: row.get(7)?,
        transport_type: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        metadata: row.get(9)?,
        pid: row.get(10)?,
    })
}

fn collect_rows(
    rows: rusqlite::MappedRows<impl FnMut(&rusqlite::Row) -> rusqlite::Result<Row>>,
) -> Result<Vec<MessageRecord>> {
    let mut out = Vec::new();
    for row in rows {
        let row = row.map_err(|e| McpHawkError::Storage(e.to_string()))?;
        out.push(row.into_record()?);
    }
    Ok(out)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
