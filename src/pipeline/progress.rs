//! Durable per-ticket stage status, backed by sqlite.
//!
//! Writes are idempotent upserts with sticky terminal statuses: once a
//! (ticket, stage) row is `completed` or `failed` it never regresses.
//! Readers are external pollers and the stage runner's idempotency guard.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::domain::{Stage, StageOutcome, StageStatus};
use crate::error::{FlowError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stage_outcomes (
    ticket_id    TEXT NOT NULL,
    batch_id     TEXT NOT NULL,
    stage        TEXT NOT NULL,
    status       TEXT NOT NULL,
    message      TEXT,
    error_detail TEXT,
    started_at   TEXT NOT NULL,
    completed_at TEXT,
    PRIMARY KEY (ticket_id, stage)
);
CREATE INDEX IF NOT EXISTS idx_stage_outcomes_batch ON stage_outcomes(batch_id);
";

#[derive(Clone)]
pub struct ProgressStore {
    conn: Arc<Mutex<Connection>>,
}

impl ProgressStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert one outcome. Terminal rows win: an `in_progress` write after
    /// `completed`/`failed` is silently ignored.
    pub async fn record(&self, outcome: StageOutcome) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            guard
                .execute(
                    "INSERT INTO stage_outcomes
                     (ticket_id, batch_id, stage, status, message, error_detail, started_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(ticket_id, stage) DO UPDATE SET
                         status = excluded.status,
                         message = excluded.message,
                         error_detail = excluded.error_detail,
                         started_at = excluded.started_at,
                         completed_at = excluded.completed_at
                     WHERE stage_outcomes.status NOT IN ('completed', 'failed')",
                    params![
                        outcome.ticket_id.to_string(),
                        outcome.batch_id.to_string(),
                        outcome.stage.as_str(),
                        outcome.status.as_str(),
                        outcome.message,
                        outcome.error_detail,
                        outcome.started_at.to_rfc3339(),
                        outcome.completed_at.map(|t| t.to_rfc3339()),
                    ],
                )
                .map(|_| ())
                .map_err(FlowError::from)
        })
        .await
        .map_err(|e| FlowError::Store(format!("record task failed: {e}")))?
    }

    pub async fn get(&self, ticket_id: Uuid, stage: Stage) -> Result<Option<StageOutcome>> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            guard
                .query_row(
                    "SELECT ticket_id, batch_id, stage, status, message, error_detail,
                            started_at, completed_at
                     FROM stage_outcomes WHERE ticket_id = ?1 AND stage = ?2",
                    params![ticket_id.to_string(), stage.as_str()],
                    row_to_outcome,
                )
                .optional()
                .map_err(FlowError::from)
        })
        .await
        .map_err(|e| FlowError::Store(format!("get task failed: {e}")))?
    }

    /// All outcomes of a batch, ordered for stable external polling.
    pub async fn by_batch(&self, batch_id: Uuid) -> Result<Vec<StageOutcome>> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let mut stmt = guard.prepare(
                "SELECT ticket_id, batch_id, stage, status, message, error_detail,
                        started_at, completed_at
                 FROM stage_outcomes WHERE batch_id = ?1
                 ORDER BY ticket_id, stage",
            )?;
            let rows = stmt.query_map(params![batch_id.to_string()], row_to_outcome)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(FlowError::from)
        })
        .await
        .map_err(|e| FlowError::Store(format!("query task failed: {e}")))?
    }
}

fn row_to_outcome(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageOutcome> {
    let ticket_id: String = row.get(0)?;
    let batch_id: String = row.get(1)?;
    let stage: String = row.get(2)?;
    let status: String = row.get(3)?;
    let started_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;

    Ok(StageOutcome {
        ticket_id: ticket_id.parse().unwrap_or_default(),
        batch_id: batch_id.parse().unwrap_or_default(),
        stage: Stage::parse(&stage).unwrap_or(Stage::Pipeline),
        status: StageStatus::parse(&status).unwrap_or(StageStatus::Pending),
        message: row.get(4)?,
        error_detail: row.get(5)?,
        started_at: parse_timestamp(&started_at),
        completed_at: completed_at.as_deref().map(parse_timestamp),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
