//! Transcript persistence.
//!
//! Finished sessions hand a `TranscriptRecord` to a `TranscriptStore`. Writes
//! happen on a blocking task and their failures are only logged, so a broken
//! store never affects what the client sees.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::{Error, Result};

/// One question and its answer, as served to one client.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptRecord {
    pub timestamp: DateTime<Utc>,
    pub client_addr: String,
    pub prompt: String,
    pub response: String,
}

impl TranscriptRecord {
    pub fn new(client_addr: &str, prompt: &str, response: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            client_addr: client_addr.to_string(),
            prompt: prompt.to_string(),
            response: response.to_string(),
        }
    }
}

/// Destination for transcripts.
pub trait TranscriptStore: Send + Sync {
    fn record(&self, record: &TranscriptRecord) -> Result<()>;
}

/// Store used when persistence is turned off.
pub struct DisabledTranscripts;

impl TranscriptStore for DisabledTranscripts {
    fn record(&self, _record: &TranscriptRecord) -> Result<()> {
        Ok(())
    }
}

/// Hand `record` to `store` without waiting for the write.
pub fn spawn_record(store: Arc<dyn TranscriptStore>, record: TranscriptRecord) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = store.record(&record) {
            tracing::warn!(client = %record.client_addr, "Failed to record transcript: {}", e);
        }
    });
}

/// SQLite-backed transcript store.
pub struct SqliteTranscriptStore {
    conn: Mutex<Connection>,
}

impl SqliteTranscriptStore {
    pub fn new(database_url: &str) -> Result<Self> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        // Create parent directories if needed
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        }

        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transcripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                client_addr TEXT NOT NULL,
                prompt TEXT NOT NULL,
                response TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transcripts_timestamp ON transcripts(timestamp)",
            [],
        )?;

        tracing::info!("Transcript store initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent transcripts, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<TranscriptRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT timestamp, client_addr, prompt, response FROM transcripts
             ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let timestamp: String = row.get(0)?;
            Ok((
                timestamp,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (timestamp, client_addr, prompt, response) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
            records.push(TranscriptRecord {
                timestamp,
                client_addr,
                prompt,
                response,
            });
        }
        Ok(records)
    }
}

impl TranscriptStore for SqliteTranscriptStore {
    fn record(&self, record: &TranscriptRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;

        conn.execute(
            "INSERT INTO transcripts (timestamp, client_addr, prompt, response)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.timestamp.to_rfc3339(),
                record.client_addr,
                record.prompt,
                record.response,
            ],
        )?;

        Ok(())
    }
}
