//! SQLite-backed admission store shared by several worker processes.
//!
//! Each claim runs in an `IMMEDIATE` transaction, which takes the database
//! write lock up front, so the ceiling check and the counter increments of
//! concurrent processes are serialized.

use super::store::{AdmissionStore, AdmissionTicket, ResetReport, StoreUsage};
use super::AdmissionError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS admission_tickets (
    ticket_id   TEXT PRIMARY KEY,
    provider_id TEXT NOT NULL,
    stream_id   TEXT NOT NULL,
    started_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_admission_tickets_started ON admission_tickets(started_at);

CREATE TABLE IF NOT EXISTS admission_counters (
    scope TEXT PRIMARY KEY,
    used  INTEGER NOT NULL DEFAULT 0
);
"#;

const GLOBAL_SCOPE: &str = "global";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn provider_scope(provider_id: &str) -> String {
    format!("provider:{}", provider_id)
}

/// Admission store in a SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AdmissionError> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.as_ref().display(), journal_mode = %mode, "Admission store opened");
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, AdmissionError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AdmissionError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn counter(tx: &Transaction<'_>, scope: &str) -> Result<u32, AdmissionError> {
    let used: Option<i64> = tx
        .query_row(
            "SELECT used FROM admission_counters WHERE scope = ?1",
            params![scope],
            |row| row.get(0),
        )
        .optional()?;
    Ok(used.unwrap_or(0).clamp(0, u32::MAX as i64) as u32)
}

fn adjust(tx: &Transaction<'_>, scope: &str, delta: i64) -> Result<(), AdmissionError> {
    tx.execute(
        "INSERT INTO admission_counters (scope, used) VALUES (?1, MAX(?2, 0))
         ON CONFLICT(scope) DO UPDATE SET used = MAX(used + ?2, 0)",
        params![scope, delta],
    )?;
    Ok(())
}

fn within(used: u32, ceiling: u32) -> bool {
    ceiling == 0 || used < ceiling
}

fn read_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdmissionTicket> {
    Ok(AdmissionTicket {
        ticket_id: row.get(0)?,
        provider_id: row.get(1)?,
        stream_id: row.get(2)?,
        started_at: row.get(3)?,
    })
}

fn remove_ticket(
    tx: &Transaction<'_>,
    ticket_id: &str,
) -> Result<Option<AdmissionTicket>, AdmissionError> {
    let ticket = tx
        .query_row(
            "SELECT ticket_id, provider_id, stream_id, started_at
             FROM admission_tickets WHERE ticket_id = ?1",
            params![ticket_id],
            read_ticket,
        )
        .optional()?;
    let Some(ticket) = ticket else {
        return Ok(None);
    };
    tx.execute(
        "DELETE FROM admission_tickets WHERE ticket_id = ?1",
        params![ticket_id],
    )?;
    adjust(tx, GLOBAL_SCOPE, -1)?;
    adjust(tx, &provider_scope(&ticket.provider_id), -1)?;
    Ok(Some(ticket))
}

impl AdmissionStore for SqliteStore {
    fn try_claim(
        &self,
        ticket: &AdmissionTicket,
        global_ceiling: u32,
        provider_ceiling: u32,
    ) -> Result<bool, AdmissionError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT ticket_id FROM admission_tickets WHERE ticket_id = ?1",
                params![ticket.ticket_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(AdmissionError::DuplicateTicket(ticket.ticket_id.clone()));
        }

        let provider_key = provider_scope(&ticket.provider_id);
        if !within(counter(&tx, GLOBAL_SCOPE)?, global_ceiling)
            || !within(counter(&tx, &provider_key)?, provider_ceiling)
        {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO admission_tickets (ticket_id, provider_id, stream_id, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                ticket.ticket_id,
                ticket.provider_id,
                ticket.stream_id,
                ticket.started_at
            ],
        )?;
        adjust(&tx, GLOBAL_SCOPE, 1)?;
        adjust(&tx, &provider_key, 1)?;
        tx.commit()?;
        Ok(true)
    }

    fn release(&self, ticket_id: &str) -> Result<Option<AdmissionTicket>, AdmissionError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = remove_ticket(&tx, ticket_id)?;
        tx.commit()?;
        Ok(removed)
    }

    fn usage(&self) -> Result<StoreUsage, AdmissionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT scope, used FROM admission_counters WHERE used > 0")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut usage = StoreUsage::default();
        for row in rows {
            let (scope, used) = row?;
            let used = used.clamp(0, u32::MAX as i64) as u32;
            if scope == GLOBAL_SCOPE {
                usage.global = used;
            } else if let Some(provider) = scope.strip_prefix("provider:") {
                usage.providers.insert(provider.to_string(), used);
            }
        }
        Ok(usage)
    }

    fn tickets(&self) -> Result<Vec<AdmissionTicket>, AdmissionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ticket_id, provider_id, stream_id, started_at
             FROM admission_tickets ORDER BY started_at",
        )?;
        let tickets = stmt
            .query_map([], read_ticket)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tickets)
    }

    fn reap_stale(&self, cutoff_ms: i64) -> Result<Vec<AdmissionTicket>, AdmissionError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT ticket_id FROM admission_tickets WHERE started_at < ?1")?;
            let ids = stmt
                .query_map(params![cutoff_ms], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut reaped = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(ticket) = remove_ticket(&tx, id)? {
                reaped.push(ticket);
            }
        }
        tx.commit()?;
        Ok(reaped)
    }

    fn reset(&self) -> Result<ResetReport, AdmissionError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let global_cleared = counter(&tx, GLOBAL_SCOPE)?;
        let tickets_removed = tx.execute("DELETE FROM admission_tickets", [])?;
        tx.execute("DELETE FROM admission_counters", [])?;
        tx.commit()?;
        Ok(ResetReport {
            tickets_removed,
            global_cleared,
        })
    }

    /// Claims wait up to the busy timeout for other processes' write locks.
    fn is_blocking(&self) -> bool {
        true
    }
}
