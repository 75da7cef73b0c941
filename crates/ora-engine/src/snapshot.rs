use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use ora_core::error::{OraError, Result};
use ora_core::types::RunId;

use crate::run::RunSnapshot;

/// Summary row for listing stored snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub run_id: RunId,
    pub graph_id: String,
    pub taken_at: DateTime<Utc>,
}

/// Persistent run snapshots backed by SQLite. One row per run; a newer
/// snapshot replaces the previous one.
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> OraError + '_ {
    move |e| OraError::Database(format!("{}: {}", context, e))
}

impl SnapshotStore {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("Failed to open snapshot store"))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("Failed to open snapshot store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS snapshots (
                 run_id TEXT PRIMARY KEY,
                 graph_id TEXT NOT NULL,
                 taken_at TEXT NOT NULL,
                 snapshot_json TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_snapshots_graph
                 ON snapshots(graph_id, taken_at DESC);",
        )
        .map_err(db_err("Failed to initialize snapshot schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| OraError::Database(e.to_string()))
    }

    /// Store a snapshot, replacing any earlier one for the same run.
    pub fn save(&self, snapshot: &RunSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (run_id, graph_id, taken_at, snapshot_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.run_id.as_str(),
                snapshot.graph_id,
                snapshot.taken_at.to_rfc3339(),
                json,
            ],
        )
        .map_err(db_err("Failed to save snapshot"))?;
        Ok(())
    }

    pub fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM snapshots WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to load snapshot"))?;
        json.map(|j| serde_json::from_str(&j).map_err(OraError::from))
            .transpose()
    }

    /// Most recent snapshot taken for a graph, across runs.
    pub fn latest_for_graph(&self, graph_id: &str) -> Result<Option<RunSnapshot>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM snapshots
                 WHERE graph_id = ?1
                 ORDER BY taken_at DESC
                 LIMIT 1",
                params![graph_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to load snapshot"))?;
        json.map(|j| serde_json::from_str(&j).map_err(OraError::from))
            .transpose()
    }

    pub fn list(&self) -> Result<Vec<SnapshotEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT run_id, graph_id, taken_at FROM snapshots ORDER BY taken_at DESC")
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], |row| {
                let run_id: String = row.get(0)?;
                let ts: String = row.get(2)?;
                Ok(SnapshotEntry {
                    run_id: RunId(run_id),
                    graph_id: row.get(1)?,
                    taken_at: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(db_err("Failed to list snapshots"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("Failed to read snapshot row"))
    }

    /// Returns true if a snapshot was removed.
    pub fn delete(&self, run_id: &RunId) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM snapshots WHERE run_id = ?1",
                params![run_id.as_str()],
            )
            .map_err(db_err("Failed to delete snapshot"))?;
        Ok(deleted > 0)
    }
}
