//! SQLite storage layer.
//!
//! Single source of truth for work records, dependency edges, unique-name
//! reservations and the event log. WAL mode for concurrent read access.
//! Every mutation the engine makes runs inside one transaction, so records,
//! edges and reservations always change together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;

const RECORD_COLUMNS: &str = "id, worker, state, input, output, constraints, backoff_kind, \
     backoff_base_ms, run_attempt_count, max_attempts, priority, interval_ms, flex_ms, \
     earliest_start, unique_name, tags, is_backed_off, last_error, created_at, updated_at, \
     finished_at";

const TERMINAL_STATES: &str = "('succeeded', 'failed', 'cancelled')";

/// Page size for [`AllRecords`].
const PAGE_SIZE: usize = 64;

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

/// Handle for performing storage operations within a transaction.
///
/// All methods delegate to the same SQL logic as `Storage`, but execute
/// against the transaction's connection. Either every operation commits
/// or none does. `now` is fixed when the transaction opens.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
    pub now: DateTime<Utc>,
}

impl TxContext<'_> {
    pub fn insert_record(&self, record: &WorkRecord) -> Result<()> {
        insert_record_on(self.tx, record)
    }

    pub fn get_record(&self, id: WorkId) -> Result<WorkRecord> {
        get_record_on(self.tx, id)
    }

    pub fn get_state(&self, id: WorkId) -> Result<State> {
        get_state_on(self.tx, id)
    }

    pub fn update_state(&self, id: WorkId, new_state: State, attempt_delta: i32) -> Result<State> {
        update_state_on(self.tx, id, new_state, attempt_delta, self.now)
    }

    pub fn set_earliest_start(
        &self,
        id: WorkId,
        earliest_start: Option<DateTime<Utc>>,
        is_backed_off: bool,
    ) -> Result<()> {
        set_earliest_start_on(self.tx, id, earliest_start, is_backed_off, self.now)
    }

    pub fn reset_attempts(&self, id: WorkId) -> Result<()> {
        self.tx.execute(
            "UPDATE work_records SET run_attempt_count = 0, updated_at = ?1 WHERE id = ?2",
            params![self.now.to_rfc3339(), id.0.to_string()],
        )?;
        Ok(())
    }

    pub fn set_output(&self, id: WorkId, output: &serde_json::Value) -> Result<()> {
        self.tx.execute(
            "UPDATE work_records SET output = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(output)?,
                self.now.to_rfc3339(),
                id.0.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn set_last_error(&self, id: WorkId, error: Option<&str>) -> Result<()> {
        self.tx.execute(
            "UPDATE work_records SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, self.now.to_rfc3339(), id.0.to_string()],
        )?;
        Ok(())
    }

    pub fn add_dependency(&self, prerequisite: WorkId, dependent: WorkId) -> Result<()> {
        add_dependency_on(self.tx, prerequisite, dependent)
    }

    pub fn prerequisites_of(&self, id: WorkId) -> Result<Vec<WorkId>> {
        prerequisites_of_on(self.tx, id)
    }

    pub fn dependents_of(&self, id: WorkId) -> Result<Vec<WorkId>> {
        dependents_of_on(self.tx, id)
    }

    /// Point `name` at `id`, the newest record admitted under it.
    pub fn reserve_unique_name(&self, name: &str, id: WorkId) -> Result<()> {
        self.tx.execute(
            "INSERT INTO unique_names (name, work_id) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET work_id = excluded.work_id",
            params![name, id.0.to_string()],
        )?;
        Ok(())
    }

    pub fn unique_name_holder(&self, name: &str) -> Result<Option<WorkId>> {
        unique_name_holder_on(self.tx, name)
    }

    pub fn active_by_unique_name(&self, name: &str) -> Result<Vec<WorkRecord>> {
        query_records_on(
            self.tx,
            &format!("unique_name = ?1 AND state NOT IN {TERMINAL_STATES}"),
            params![name],
        )
    }

    pub fn active_by_tag(&self, tag: &str) -> Result<Vec<WorkRecord>> {
        query_records_on(
            self.tx,
            &format!(
                "id IN (SELECT work_id FROM work_tags WHERE tag = ?1) AND state NOT IN {TERMINAL_STATES}"
            ),
            params![tag],
        )
    }

    pub fn active_records(&self) -> Result<Vec<WorkRecord>> {
        query_records_on(
            self.tx,
            &format!("state NOT IN {TERMINAL_STATES}"),
            params![],
        )
    }

    /// Terminal records finished before `cutoff` with no unfinished dependents.
    pub fn prunable(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkId>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT r.id, r.finished_at FROM work_records r
             WHERE r.state IN {TERMINAL_STATES} AND r.finished_at IS NOT NULL
             AND NOT EXISTS (
                 SELECT 1 FROM dependencies d JOIN work_records w ON w.id = d.dependent_id
                 WHERE d.prerequisite_id = r.id AND w.state NOT IN {TERMINAL_STATES}
             )"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    parse_id(row.get::<_, String>(0)?, 0)?,
                    parse_time(row.get::<_, String>(1)?, 1)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|(_, finished)| *finished < cutoff)
            .map(|(id, _)| id)
            .collect())
    }

    /// Delete a record. Its tags, edges and name reservation go with it.
    pub fn delete_record(&self, id: WorkId) -> Result<()> {
        self.tx.execute(
            "DELETE FROM work_records WHERE id = ?1",
            params![id.0.to_string()],
        )?;
        Ok(())
    }

    pub fn record_event(&self, kind: EventKind) -> Result<Event> {
        record_event_on(self.tx, kind, self.now)
    }
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut storage = Self {
            conn,
            clock: Arc::new(SystemClock),
        };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self {
            conn,
            clock: Arc::new(SystemClock),
        };
        storage.init()?;
        Ok(storage)
    }

    /// Use `clock` for every timestamp this store writes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key             TEXT PRIMARY KEY,
                value           TEXT NOT NULL
            );

            INSERT OR IGNORE INTO meta (key, value) VALUES ('heartbeat', '');

            CREATE TABLE IF NOT EXISTS work_records (
                id                  TEXT PRIMARY KEY,
                worker              TEXT NOT NULL,
                state               TEXT NOT NULL,
                input               TEXT NOT NULL DEFAULT 'null',
                output              TEXT,
                constraints         TEXT NOT NULL,
                backoff_kind        TEXT NOT NULL,
                backoff_base_ms     INTEGER NOT NULL,
                run_attempt_count   INTEGER NOT NULL DEFAULT 0,
                max_attempts        INTEGER,
                priority            INTEGER NOT NULL DEFAULT 0,
                interval_ms         INTEGER,
                flex_ms             INTEGER,
                earliest_start      TEXT,
                unique_name         TEXT,
                tags                TEXT NOT NULL DEFAULT '[]',
                is_backed_off       INTEGER NOT NULL DEFAULT 0,
                last_error          TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                finished_at         TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_state ON work_records(state);
            CREATE INDEX IF NOT EXISTS idx_unique_name ON work_records(unique_name)
                WHERE unique_name IS NOT NULL;

            CREATE TABLE IF NOT EXISTS work_tags (
                work_id     TEXT NOT NULL REFERENCES work_records(id) ON DELETE CASCADE,
                tag         TEXT NOT NULL,
                PRIMARY KEY (work_id, tag)
            );

            CREATE INDEX IF NOT EXISTS idx_tag ON work_tags(tag);

            CREATE TABLE IF NOT EXISTS dependencies (
                prerequisite_id TEXT NOT NULL REFERENCES work_records(id) ON DELETE CASCADE,
                dependent_id    TEXT NOT NULL REFERENCES work_records(id) ON DELETE CASCADE,
                PRIMARY KEY (prerequisite_id, dependent_id)
            );

            CREATE INDEX IF NOT EXISTS idx_dependent ON dependencies(dependent_id);

            CREATE TABLE IF NOT EXISTS unique_names (
                name        TEXT PRIMARY KEY,
                work_id     TEXT NOT NULL REFERENCES work_records(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT NOT NULL,
                kind        TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Probe the store with a real write. Used to resume after `StorageUnavailable`.
    pub fn health_check(&self) -> Result<()> {
        self.conn.execute(
            "UPDATE meta SET value = ?1 WHERE key = 'heartbeat'",
            params![self.clock.now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Reject every write from now on, as a failing disk would.
    #[cfg(test)]
    pub(crate) fn set_read_only(&self, read_only: bool) -> Result<()> {
        let pragma = if read_only {
            "PRAGMA query_only = ON;"
        } else {
            "PRAGMA query_only = OFF;"
        };
        self.conn.execute_batch(pragma)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let now = self.clock.now();
        let tx = self.conn.transaction()?;
        let mut ctx = TxContext { tx: &tx, now };
        let result = f(&mut ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Work Records
    // -----------------------------------------------------------------------

    /// Insert a new record with its tags.
    pub fn put(&mut self, record: &WorkRecord) -> Result<()> {
        self.with_transaction(|tx| tx.insert_record(record))
    }

    /// Get a record by ID.
    pub fn get(&self, id: WorkId) -> Result<WorkRecord> {
        get_record_on(&self.conn, id)
    }

    pub fn state_of(&self, id: WorkId) -> Result<State> {
        get_state_on(&self.conn, id)
    }

    /// Move a record to `new_state` and adjust its attempt count.
    /// Returns the previous state.
    pub fn update_state(&mut self, id: WorkId, new_state: State, attempt_delta: i32) -> Result<State> {
        self.with_transaction(|tx| tx.update_state(id, new_state, attempt_delta))
    }

    pub fn query_by_tag(&self, tag: &str) -> Result<Vec<WorkRecord>> {
        query_records_on(
            &self.conn,
            "id IN (SELECT work_id FROM work_tags WHERE tag = ?1)",
            params![tag],
        )
    }

    pub fn query_by_unique_name(&self, name: &str) -> Result<Vec<WorkRecord>> {
        query_records_on(&self.conn, "unique_name = ?1", params![name])
    }

    pub fn query_by_state(&self, state: State) -> Result<Vec<WorkRecord>> {
        query_records_on(&self.conn, "state = ?1", params![state.as_str()])
    }

    pub fn add_dependency(&mut self, prerequisite: WorkId, dependent: WorkId) -> Result<()> {
        add_dependency_on(&self.conn, prerequisite, dependent)
    }

    pub fn prerequisites_of(&self, id: WorkId) -> Result<Vec<WorkId>> {
        prerequisites_of_on(&self.conn, id)
    }

    pub fn dependents_of(&self, id: WorkId) -> Result<Vec<WorkId>> {
        dependents_of_on(&self.conn, id)
    }

    /// Every record, fetched lazily in pages. Call again to restart.
    pub fn all_records(&self) -> AllRecords<'_> {
        AllRecords {
            conn: &self.conn,
            after: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Record an event and return it with its sequence number.
    pub fn record_event(&mut self, kind: EventKind) -> Result<Event> {
        record_event_on(&self.conn, kind, self.clock.now())
    }

    /// Get events since a sequence number.
    pub fn get_events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, timestamp, kind FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let events = stmt
            .query_map(params![since_seq as i64], |row| {
                let kind_str: String = row.get(2)?;
                Ok(Event {
                    seq: row.get::<_, i64>(0)? as u64,
                    timestamp: row
                        .get::<_, String>(1)?
                        .parse()
                        .unwrap_or_else(|_| Utc::now()),
                    kind: serde_json::from_str(&kind_str)
                        .unwrap_or(EventKind::Unknown { raw: kind_str }),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

/// Lazy, finite sequence over every stored record, ordered by id.
pub struct AllRecords<'a> {
    conn: &'a Connection,
    after: Option<String>,
    page: std::vec::IntoIter<WorkRecord>,
    exhausted: bool,
}

impl Iterator for AllRecords<'_> {
    type Item = Result<WorkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.page.next() {
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }

        let records = match query_records_on(
            self.conn,
            "(?1 IS NULL OR id > ?1) ORDER BY id ASC LIMIT ?2",
            params![self.after, PAGE_SIZE as i64],
        ) {
            Ok(records) => records,
            Err(e) => {
                self.exhausted = true;
                return Some(Err(e));
            }
        };

        if records.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = records.last() {
            self.after = Some(last.id.0.to_string());
        }
        self.page = records.into_iter();
        self.page.next().map(Ok)
    }
}

// ---------------------------------------------------------------------------
// Inner functions accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn insert_record_on(conn: &Connection, record: &WorkRecord) -> Result<()> {
    let (interval_ms, flex_ms) = match record.schedule {
        Schedule::OneShot => (None, None),
        Schedule::Periodic { interval, flex } => {
            (Some(millis(interval)), flex.map(millis))
        }
    };

    conn.execute(
        &format!(
            "INSERT INTO work_records ({RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21)"
        ),
        params![
            record.id.0.to_string(),
            record.worker,
            record.state.as_str(),
            serde_json::to_string(&record.input)?,
            record
                .output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            serde_json::to_string(&record.constraints)?,
            record.backoff.kind.as_str(),
            millis(record.backoff.base_delay),
            record.run_attempt_count,
            record.max_attempts,
            record.priority,
            interval_ms,
            flex_ms,
            record.earliest_start.map(|t| t.to_rfc3339()),
            record.unique_name,
            serde_json::to_string(&record.tags)?,
            record.is_backed_off,
            record.last_error,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
            record.finished_at.map(|t| t.to_rfc3339()),
        ],
    )?;

    for tag in &record.tags {
        conn.execute(
            "INSERT OR IGNORE INTO work_tags (work_id, tag) VALUES (?1, ?2)",
            params![record.id.0.to_string(), tag],
        )?;
    }
    Ok(())
}

fn get_state_on(conn: &Connection, id: WorkId) -> Result<State> {
    let state_str: String = conn
        .query_row(
            "SELECT state FROM work_records WHERE id = ?1",
            params![id.0.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;

    state_str.parse().map_err(Error::Other)
}

fn get_record_on(conn: &Connection, id: WorkId) -> Result<WorkRecord> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM work_records WHERE id = ?1"),
        params![id.0.to_string()],
        row_to_record,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(id.to_string()))
}

fn query_records_on(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<WorkRecord>> {
    // Paged queries carry their own ORDER BY.
    let order = if filter.contains("ORDER BY") {
        ""
    } else {
        " ORDER BY priority DESC, created_at ASC"
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM work_records WHERE {filter}{order}"
    ))?;
    let records = stmt
        .query_map(params, row_to_record)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

fn update_state_on(
    conn: &Connection,
    id: WorkId,
    new_state: State,
    attempt_delta: i32,
    now: DateTime<Utc>,
) -> Result<State> {
    let old_state = get_state_on(conn, id)?;

    if !old_state.can_transition_to(new_state) {
        return Err(Error::InvalidTransition {
            from: old_state,
            to: new_state,
        });
    }

    let now = now.to_rfc3339();
    let finished_at = new_state.is_terminal().then(|| now.clone());

    conn.execute(
        "UPDATE work_records
         SET state = ?1, run_attempt_count = MAX(0, run_attempt_count + ?2),
             updated_at = ?3, finished_at = ?4
         WHERE id = ?5",
        params![
            new_state.as_str(),
            attempt_delta,
            now,
            finished_at,
            id.0.to_string()
        ],
    )?;

    Ok(old_state)
}

fn set_earliest_start_on(
    conn: &Connection,
    id: WorkId,
    earliest_start: Option<DateTime<Utc>>,
    is_backed_off: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE work_records SET earliest_start = ?1, is_backed_off = ?2, updated_at = ?3
         WHERE id = ?4",
        params![
            earliest_start.map(|t| t.to_rfc3339()),
            is_backed_off,
            now.to_rfc3339(),
            id.0.to_string()
        ],
    )?;
    Ok(())
}

fn add_dependency_on(conn: &Connection, prerequisite: WorkId, dependent: WorkId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO dependencies (prerequisite_id, dependent_id) VALUES (?1, ?2)",
        params![prerequisite.0.to_string(), dependent.0.to_string()],
    )?;
    Ok(())
}

fn prerequisites_of_on(conn: &Connection, id: WorkId) -> Result<Vec<WorkId>> {
    ids_on(
        conn,
        "SELECT prerequisite_id FROM dependencies WHERE dependent_id = ?1 ORDER BY prerequisite_id",
        id,
    )
}

fn dependents_of_on(conn: &Connection, id: WorkId) -> Result<Vec<WorkId>> {
    ids_on(
        conn,
        "SELECT dependent_id FROM dependencies WHERE prerequisite_id = ?1 ORDER BY dependent_id",
        id,
    )
}

fn ids_on(conn: &Connection, sql: &str, id: WorkId) -> Result<Vec<WorkId>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![id.0.to_string()], |row| {
            parse_id(row.get::<_, String>(0)?, 0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn unique_name_holder_on(conn: &Connection, name: &str) -> Result<Option<WorkId>> {
    conn.query_row(
        "SELECT work_id FROM unique_names WHERE name = ?1",
        params![name],
        |row| parse_id(row.get::<_, String>(0)?, 0),
    )
    .optional()
    .map_err(Error::from)
}

fn record_event_on(conn: &Connection, kind: EventKind, now: DateTime<Utc>) -> Result<Event> {
    conn.execute(
        "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
        params![now.to_rfc3339(), serde_json::to_string(&kind)?],
    )?;

    let seq = conn.last_insert_rowid();

    Ok(Event {
        seq: seq as u64,
        timestamp: now,
        kind,
    })
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<WorkRecord> {
    let interval_ms: Option<i64> = row.get(11)?;
    let flex_ms: Option<i64> = row.get(12)?;
    let schedule = match interval_ms {
        None => Schedule::OneShot,
        Some(ms) => Schedule::Periodic {
            interval: from_millis(ms),
            flex: flex_ms.map(from_millis),
        },
    };

    let tags: BTreeSet<String> = parse_json(row.get::<_, String>(15)?, 15)?;

    Ok(WorkRecord {
        id: parse_id(row.get::<_, String>(0)?, 0)?,
        worker: row.get(1)?,
        state: row
            .get::<_, String>(2)?
            .parse()
            .map_err(|e: String| conversion_error(2, e))?,
        input: parse_json(row.get::<_, String>(3)?, 3)?,
        output: row
            .get::<_, Option<String>>(4)?
            .map(|s| parse_json(s, 4))
            .transpose()?,
        constraints: parse_json(row.get::<_, String>(5)?, 5)?,
        backoff: BackoffPolicy {
            kind: row
                .get::<_, String>(6)?
                .parse()
                .map_err(|e: String| conversion_error(6, e))?,
            base_delay: from_millis(row.get(7)?),
        },
        run_attempt_count: row.get(8)?,
        max_attempts: row.get(9)?,
        priority: row.get(10)?,
        schedule,
        earliest_start: row
            .get::<_, Option<String>>(13)?
            .map(|s| parse_time(s, 13))
            .transpose()?,
        unique_name: row.get(14)?,
        tags,
        is_backed_off: row.get(16)?,
        last_error: row.get(17)?,
        created_at: parse_time(row.get::<_, String>(18)?, 18)?,
        updated_at: parse_time(row.get::<_, String>(19)?, 19)?,
        finished_at: row
            .get::<_, Option<String>>(20)?
            .map(|s| parse_time(s, 20))
            .transpose()?,
    })
}

fn parse_id(s: String, idx: usize) -> rusqlite::Result<WorkId> {
    s.parse()
        .map_err(|e: uuid::Error| conversion_error(idx, e.to_string()))
}

fn parse_time(s: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    s.parse()
        .map_err(|e: chrono::ParseError| conversion_error(idx, e.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: String, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e.to_string()))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(worker: &str, state: State) -> WorkRecord {
        let now = Utc::now();
        WorkRecord {
            id: WorkId::new(),
            worker: worker.to_string(),
            state,
            input: serde_json::json!({"n": 1}),
            output: None,
            constraints: Constraints::default().network(NetworkType::Unmetered),
            backoff: BackoffPolicy::linear(Duration::from_secs(30)),
            run_attempt_count: 0,
            max_attempts: Some(3),
            priority: 0,
            schedule: Schedule::OneShot,
            earliest_start: None,
            unique_name: None,
            tags: BTreeSet::from(["sync".to_string()]),
            is_backed_off: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[test]
    fn put_and_get_preserve_fields() {
        let mut storage = Storage::in_memory().unwrap();
        let mut rec = record("upload", State::Enqueued);
        rec.schedule = Schedule::Periodic {
            interval: Duration::from_secs(900),
            flex: Some(Duration::from_secs(300)),
        };
        storage.put(&rec).unwrap();

        let got = storage.get(rec.id).unwrap();
        assert_eq!(got.worker, "upload");
        assert_eq!(got.constraints, rec.constraints);
        assert_eq!(got.backoff, rec.backoff);
        assert_eq!(got.schedule, rec.schedule);
        assert_eq!(got.tags, rec.tags);
        assert_eq!(got.input, serde_json::json!({"n": 1}));
    }

    #[test]
    fn update_state_rejects_invalid_transition() {
        let mut storage = Storage::in_memory().unwrap();
        let rec = record("upload", State::Blocked);
        storage.put(&rec).unwrap();

        let err = storage
            .update_state(rec.id, State::Running, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(storage.state_of(rec.id).unwrap(), State::Blocked);
    }

    #[test]
    fn update_state_applies_attempt_delta_and_finish_time() {
        let mut storage = Storage::in_memory().unwrap();
        let rec = record("upload", State::Enqueued);
        storage.put(&rec).unwrap();

        storage.update_state(rec.id, State::Running, 0).unwrap();
        storage.update_state(rec.id, State::Enqueued, 1).unwrap();
        let got = storage.get(rec.id).unwrap();
        assert_eq!(got.run_attempt_count, 1);
        assert!(got.finished_at.is_none());

        storage.update_state(rec.id, State::Cancelled, 0).unwrap();
        assert!(storage.get(rec.id).unwrap().finished_at.is_some());
    }

    #[test]
    fn missing_record_is_not_found() {
        let storage = Storage::in_memory().unwrap();
        assert!(matches!(
            storage.get(WorkId::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn all_records_pages_through_everything() {
        let mut storage = Storage::in_memory().unwrap();
        let total = PAGE_SIZE * 2 + 5;
        for _ in 0..total {
            storage.put(&record("bulk", State::Enqueued)).unwrap();
        }

        let seen: Vec<WorkRecord> = storage
            .all_records()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(seen.len(), total);
        let distinct: BTreeSet<WorkId> = seen.iter().map(|r| r.id).collect();
        assert_eq!(distinct.len(), total);

        // Restartable
        assert_eq!(storage.all_records().count(), total);
    }

    #[test]
    fn health_check_fails_on_read_only_connection() {
        let storage = Storage::in_memory().unwrap();
        storage.health_check().unwrap();

        storage.conn.execute_batch("PRAGMA query_only = ON;").unwrap();
        assert!(storage.health_check().unwrap_err().is_storage());

        storage.conn.execute_batch("PRAGMA query_only = OFF;").unwrap();
        storage.health_check().unwrap();
    }

    #[test]
    fn deleting_a_record_drops_its_edges_and_tags() {
        let mut storage = Storage::in_memory().unwrap();
        let a = record("a", State::Succeeded);
        let b = record("b", State::Enqueued);
        storage.put(&a).unwrap();
        storage.put(&b).unwrap();
        storage.add_dependency(a.id, b.id).unwrap();

        storage
            .with_transaction(|tx| tx.delete_record(a.id))
            .unwrap();
        assert!(storage.prerequisites_of(b.id).unwrap().is_empty());
        assert_eq!(storage.query_by_tag("sync").unwrap().len(), 1);
    }

    #[test]
    fn events_since_returns_later_events_in_order() {
        let mut storage = Storage::in_memory().unwrap();
        let id = WorkId::new();
        let first = storage
            .record_event(EventKind::WorkUnblocked { id })
            .unwrap();
        storage
            .record_event(EventKind::WorkRunning { id, attempt: 1 })
            .unwrap();
        storage.record_event(EventKind::WorkSucceeded { id }).unwrap();

        let events = storage.get_events_since(first.seq).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].seq < events[1].seq);
        assert!(matches!(
            events[0].kind,
            EventKind::WorkRunning { attempt: 1, .. }
        ));
        assert!(matches!(events[1].kind, EventKind::WorkSucceeded { id: done } if done == id));
        assert!(
            storage
                .get_events_since(events[1].seq)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn history_outlives_pruned_records() {
        let mut storage = Storage::in_memory().unwrap();
        let done = record("sync", State::Succeeded);
        storage.put(&done).unwrap();
        storage
            .with_transaction(|tx| {
                tx.record_event(EventKind::WorkSucceeded { id: done.id })?;
                tx.delete_record(done.id)?;
                tx.record_event(EventKind::WorkPruned { count: 1 })
            })
            .unwrap();

        assert!(matches!(storage.get(done.id), Err(Error::NotFound(_))));
        let kinds: Vec<EventKind> = storage
            .get_events_since(0)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(matches!(
            kinds.as_slice(),
            [EventKind::WorkSucceeded { .. }, EventKind::WorkPruned { count: 1 }]
        ));
    }

    #[test]
    fn events_written_by_a_newer_build_read_back_raw() {
        let mut storage = Storage::in_memory().unwrap();
        let id = WorkId::new();
        storage.record_event(EventKind::WorkCancelled { id }).unwrap();
        let newer = format!(r#"{{"type":"work_paused","id":"{}"}}"#, id.0);
        storage
            .conn
            .execute(
                "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
                params![Utc::now().to_rfc3339(), newer],
            )
            .unwrap();
        storage.record_event(EventKind::WorkPruned { count: 0 }).unwrap();

        let events = storage.get_events_since(0).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].kind, EventKind::WorkCancelled { .. }));
        assert!(matches!(&events[1].kind, EventKind::Unknown { raw } if *raw == newer));
        assert!(matches!(events[2].kind, EventKind::WorkPruned { count: 0 }));
    }
}
