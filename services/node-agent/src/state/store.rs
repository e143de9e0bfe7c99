//! SQLite-backed snapshot store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use exile_id::InstanceId;
use exile_proto::InstanceStatus;
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from snapshot store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state store lock poisoned")]
    Poisoned,
}

/// Persisted form of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub region: String,
    pub version: String,
    pub start_time: Option<DateTime<Utc>>,
    pub path: PathBuf,
    pub player_count: u32,
    pub max_players: u32,
}

/// Whole-table snapshot persistence.
pub trait SnapshotStore: Send + Sync {
    /// Replaces the stored snapshot with `records`.
    fn save(&self, records: &[InstanceRecord]) -> Result<(), StateStoreError>;

    /// Returns the last saved snapshot.
    fn load(&self) -> Result<Vec<InstanceRecord>, StateStoreError>;
}

/// SQLite snapshot store.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StateStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                port INTEGER NOT NULL UNIQUE,
                pid INTEGER,
                status TEXT NOT NULL,
                region TEXT NOT NULL,
                version TEXT NOT NULL DEFAULT '',
                start_time TEXT,
                path TEXT NOT NULL,
                player_count INTEGER NOT NULL DEFAULT 0,
                max_players INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        debug!("Snapshot store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, records: &[InstanceRecord]) -> Result<(), StateStoreError> {
        let mut conn = self.conn.lock().map_err(|_| StateStoreError::Poisoned)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM instances", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO instances (instance_id, port, pid, status, region, version, start_time, path, player_count, max_players)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;
            for record in records {
                stmt.execute(params![
                    record.id.as_str(),
                    record.port,
                    record.pid,
                    record.status.as_str(),
                    record.region,
                    record.version,
                    record.start_time.map(|t| t.to_rfc3339()),
                    record.path.to_string_lossy(),
                    record.player_count,
                    record.max_players,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<InstanceRecord>, StateStoreError> {
        let conn = self.conn.lock().map_err(|_| StateStoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT instance_id, port, pid, status, region, version, start_time, path, player_count, max_players
             FROM instances ORDER BY port",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, Option<u32>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, u32>(8)?,
                    row.get::<_, u32>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, port, pid, status, region, version, start_time, path, players, max_players) in rows
        {
            let id = match InstanceId::parse(&id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "Skipping persisted instance with invalid id");
                    continue;
                }
            };
            records.push(InstanceRecord {
                id,
                port,
                pid,
                status: InstanceStatus::parse(&status).unwrap_or(InstanceStatus::Error),
                region,
                version,
                start_time: start_time
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|t| t.with_timezone(&Utc)),
                path: PathBuf::from(path),
                player_count: players,
                max_players,
            });
        }
        Ok(records)
    }
}
