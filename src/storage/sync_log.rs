//! Operation log for sync/import/reindex/process runs

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::types::{OperationCounters, OperationKind, OperationLogEntry, OperationStatus};

fn entry_from_row(row: &Row) -> rusqlite::Result<OperationLogEntry> {
    let operation: String = row.get("operation")?;
    let status: String = row.get("status")?;
    Ok(OperationLogEntry {
        id: row.get("id")?,
        operation: operation.parse().unwrap_or(OperationKind::Sync),
        status: status.parse().unwrap_or(OperationStatus::Error),
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        counters: OperationCounters {
            messages_added: row.get("messages_added")?,
            duplicates_skipped: row.get("duplicates_skipped")?,
            chunks_added: row.get("chunks_added")?,
            chunks_embedded: row.get("chunks_embedded")?,
            noise_dropped: row.get("noise_dropped")?,
        },
        detail: row.get("detail")?,
    })
}

/// Open a log entry with `status = running`. Returns the entry id.
pub fn append_log(conn: &Connection, operation: OperationKind) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_log (operation, status) VALUES (?, 'running')",
        [operation.to_string()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Finalize a log entry with its terminal status and counters
pub fn update_log(
    conn: &Connection,
    id: i64,
    status: OperationStatus,
    counters: &OperationCounters,
    detail: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE sync_log SET
             status = ?,
             finished_at = datetime('now'),
             messages_added = ?,
             duplicates_skipped = ?,
             chunks_added = ?,
             chunks_embedded = ?,
             noise_dropped = ?,
             detail = ?
         WHERE id = ?",
        params![
            status.to_string(),
            counters.messages_added,
            counters.duplicates_skipped,
            counters.chunks_added,
            counters.chunks_embedded,
            counters.noise_dropped,
            detail,
            id,
        ],
    )?;
    Ok(())
}

/// Most recent log entries, newest first
pub fn tail_log(conn: &Connection, limit: usize) -> Result<Vec<OperationLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, operation, status, started_at, finished_at,
                messages_added, duplicates_skipped, chunks_added,
                chunks_embedded, noise_dropped, detail
         FROM sync_log ORDER BY id DESC LIMIT ?",
    )?;
    let rows = stmt.query_map([limit as i64], entry_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
