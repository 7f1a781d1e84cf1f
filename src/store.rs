//! Durable record storage
//!
//! The controller is the only writer. Readers (CLI, status API) go through the
//! same trait and rely on SQLite's atomic insert for snapshot consistency.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use uuid::Uuid;

use crate::sensor::DetectionKind;
use crate::session::{EventRecord, StoredRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS recordings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL UNIQUE,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    wav_filepath TEXT NOT NULL UNIQUE,
    waveform_filepath TEXT,
    distance INTEGER,
    intensity INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recordings_timestamp ON recordings(timestamp DESC);
"#;

const COLUMNS: &str = concat!(
    "id, session_id, timestamp, kind, wav_filepath, ",
    "waveform_filepath, distance, intensity, duration_ms"
);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {0} not found")]
    NotFound(i64),
}

/// Persistence boundary for completed sessions.
pub trait EventStore: Send + Sync {
    /// Insert a record and return its id. Inserting the same session twice
    /// returns the existing id instead of a duplicate row.
    fn insert(&self, record: &EventRecord) -> Result<i64, StoreError>;

    fn get(&self, id: i64) -> Result<StoredRecord, StoreError>;

    /// Newest first.
    fn list_recent(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError>;

    /// Delete every record whose audio path starts with `prefix`. Returns the count removed.
    fn delete_by_path_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    fn count(&self) -> Result<u64, StoreError>;
}

/// SQLite-backed store with a connection per call.
pub struct SqliteEventStore {
    path: PathBuf,
}

impl SqliteEventStore {
    /// Open the database at `path`, creating it and its directory if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { path };
        store.conn()?.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        Ok(conn)
    }
}

impl EventStore for SqliteEventStore {
    fn insert(&self, record: &EventRecord) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let session_id = record.session_id.to_string();

        let inserted = conn.execute(
            "INSERT INTO recordings
                (session_id, timestamp, kind, wav_filepath, waveform_filepath,
                 distance, intensity, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(session_id) DO NOTHING",
            rusqlite::params![
                session_id,
                format_timestamp(record.timestamp),
                record.kind.as_str(),
                record.audio_path.to_string_lossy().into_owned(),
                record
                    .waveform_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                record.distance_km,
                record.intensity,
                record.duration_ms as i64,
            ],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM recordings WHERE session_id = ?1",
            [&session_id],
            |row| row.get(0),
        )?;

        if inserted == 0 {
            log::warn!(
                "Store: session {} already stored as record {}",
                record.session_id,
                id
            );
        }
        Ok(id)
    }

    fn get(&self, id: i64) -> Result<StoredRecord, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM recordings WHERE id = ?1", COLUMNS);
        conn.query_row(&sql, [id], map_row)
            .optional()?
            .ok_or(StoreError::NotFound(id))
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM recordings ORDER BY timestamp DESC, id DESC LIMIT ?1",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], map_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn delete_by_path_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        // substr instead of LIKE so '%' and '_' in paths match literally
        let removed = conn.execute(
            "DELETE FROM recordings WHERE substr(wav_filepath, 1, length(?1)) = ?1",
            [prefix],
        )?;
        Ok(removed)
    }

    fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM recordings", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let session_id: String = row.get(1)?;
    let session_id = Uuid::parse_str(&session_id).map_err(|e| conversion_error(1, e))?;

    let timestamp: String = row.get(2)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| conversion_error(2, e))?
        .with_timezone(&Utc);

    let kind: String = row.get(3)?;
    let kind = DetectionKind::parse(&kind).ok_or_else(|| {
        conversion_error(
            3,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown detection kind {:?}", kind),
            ),
        )
    })?;

    let duration_ms: i64 = row.get(8)?;

    Ok(StoredRecord {
        id: row.get(0)?,
        record: EventRecord {
            session_id,
            timestamp,
            kind,
            audio_path: PathBuf::from(row.get::<_, String>(4)?),
            waveform_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
            distance_km: row.get(6)?,
            intensity: row.get(7)?,
            duration_ms: duration_ms.max(0) as u64,
        },
    })
}
