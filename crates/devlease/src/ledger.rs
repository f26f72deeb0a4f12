use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::error::{AdmissionError, LedgerError, StorageError};

/// Booking rules applied at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Longest single reservation.
    pub max_slot: TimeDelta,
    /// Most reserved time one holder may have in `quota_window`.
    pub quota: TimeDelta,
    /// Trailing window, measured from now, over which `quota` is summed.
    pub quota_window: TimeDelta,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            max_slot: TimeDelta::hours(4),
            quota: TimeDelta::hours(2),
            quota_window: TimeDelta::days(7),
        }
    }
}

/// A committed booking interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: i64,
    pub device_id: String,
    pub holder_id: String,
    pub holder_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Reservation {
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// A reservation that has not been admitted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub device_id: String,
    pub holder_id: String,
    pub holder_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS reservations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   TEXT NOT NULL,
    holder_id   TEXT NOT NULL,
    holder_name TEXT NOT NULL,
    start_ms    INTEGER NOT NULL,
    end_ms      INTEGER NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    CHECK (start_ms < end_ms)
);
CREATE INDEX IF NOT EXISTS idx_reservations_device ON reservations(device_id, start_ms);
CREATE INDEX IF NOT EXISTS idx_reservations_holder ON reservations(holder_id, start_ms);
CREATE TRIGGER IF NOT EXISTS reservations_no_overlap
BEFORE INSERT ON reservations
WHEN EXISTS (
    SELECT 1 FROM reservations
    WHERE device_id = NEW.device_id AND start_ms < NEW.end_ms AND end_ms > NEW.start_ms
)
BEGIN
    SELECT RAISE(ABORT, 'reservation overlaps an existing slot');
END;";

/// Synchronous SQLite side of the ledger. Every call holds the connection
/// mutex for its whole duration.
struct LedgerStore {
    conn: StdMutex<Connection>,
}

impl LedgerStore {
    fn open(conn: Connection) -> Result<Self, StorageError> {
        // Writers queue on the file lock instead of failing with SQLITE_BUSY
        // when several processes share one database.
        conn.busy_timeout(Duration::from_secs(5))?;
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!(error = %e, "could not enable WAL journal");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM reservations", [], |row| row.get(0))?;
        if count > 0 {
            info!(count, "loaded reservation ledger");
        }

        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn admit(
        &self,
        new: &NewReservation,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        // Stored at millisecond precision; admit exactly what will be persisted.
        let start = new.start.trunc_subsecs(3);
        let end = new.end.trunc_subsecs(3);
        let length = end - start;
        if length <= TimeDelta::zero() {
            return Err(AdmissionError::InvalidInterval.into());
        }
        if length > policy.max_slot {
            return Err(AdmissionError::DurationExceeded {
                max: policy.max_slot,
            }
            .into());
        }

        let mut conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        // IMMEDIATE takes the write lock up front, so the checks below and the
        // insert see one consistent snapshot even across processes.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;

        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();

        let conflict: Option<i64> = tx
            .query_row(
                "SELECT id FROM reservations
                 WHERE device_id = ?1 AND start_ms < ?3 AND end_ms > ?2
                 LIMIT 1",
                params![new.device_id, start_ms, end_ms],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?;
        if conflict.is_some() {
            return Err(AdmissionError::SlotConflict.into());
        }

        let window_start_ms = window_start(now, policy.quota_window).timestamp_millis();
        let used_ms: i64 = tx
            .query_row(
                "SELECT COALESCE(SUM(end_ms - start_ms), 0) FROM reservations
                 WHERE holder_id = ?1 AND start_ms > ?2",
                params![new.holder_id, window_start_ms],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        let used = TimeDelta::milliseconds(used_ms);
        if used + length > policy.quota {
            return Err(AdmissionError::QuotaExceeded {
                used,
                quota: policy.quota,
            }
            .into());
        }

        tx.execute(
            "INSERT INTO reservations (device_id, holder_id, holder_name, start_ms, end_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![new.device_id, new.holder_id, new.holder_name, start_ms, end_ms],
        )
        .map_err(StorageError::from)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(StorageError::from)?;

        Ok(Reservation {
            id,
            device_id: new.device_id.clone(),
            holder_id: new.holder_id.clone(),
            holder_name: new.holder_name.clone(),
            start,
            end,
        })
    }

    fn active_for(
        &self,
        device_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Reservation>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let row = conn
            .query_row(
                "SELECT id, device_id, holder_id, holder_name, start_ms, end_ms
                 FROM reservations
                 WHERE device_id = ?1 AND start_ms <= ?2 AND end_ms > ?2
                 ORDER BY start_ms
                 LIMIT 1",
                params![device_id, as_of.timestamp_millis()],
                raw_row,
            )
            .optional()?;
        row.map(RawRow::into_reservation).transpose()
    }

    fn list_since(&self, ended_after: DateTime<Utc>) -> Result<Vec<Reservation>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, holder_id, holder_name, start_ms, end_ms
             FROM reservations
             WHERE end_ms > ?1
             ORDER BY start_ms, id",
        )?;
        let rows = stmt.query_map(params![ended_after.timestamp_millis()], raw_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_reservation()?);
        }
        Ok(out)
    }
}

/// `now - window`, clamped to the earliest representable instant.
fn window_start(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

struct RawRow {
    id: i64,
    device_id: String,
    holder_id: String,
    holder_name: String,
    start_ms: i64,
    end_ms: i64,
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        device_id: row.get(1)?,
        holder_id: row.get(2)?,
        holder_name: row.get(3)?,
        start_ms: row.get(4)?,
        end_ms: row.get(5)?,
    })
}

impl RawRow {
    fn into_reservation(self) -> Result<Reservation, StorageError> {
        let start = DateTime::from_timestamp_millis(self.start_ms)
            .ok_or_else(|| StorageError::Corrupt(format!("reservation {} start", self.id)))?;
        let end = DateTime::from_timestamp_millis(self.end_ms)
            .ok_or_else(|| StorageError::Corrupt(format!("reservation {} end", self.id)))?;
        Ok(Reservation {
            id: self.id,
            device_id: self.device_id,
            holder_id: self.holder_id,
            holder_name: self.holder_name,
            start,
            end,
        })
    }
}

/// Persistent store of reservations with admission-checked creation.
///
/// SQLite I/O runs on `spawn_blocking` so the async runtime never blocks on
/// the database. The ledger is the only writer of the reservations table.
pub struct ReservationLedger {
    store: Arc<LedgerStore>,
    policy: BookingPolicy,
}

impl ReservationLedger {
    pub fn open(path: &Path, policy: BookingPolicy) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened reservation database");
        Ok(Self {
            store: Arc::new(LedgerStore::open(conn)?),
            policy,
        })
    }

    pub fn open_in_memory(policy: BookingPolicy) -> Result<Self, StorageError> {
        Ok(Self {
            store: Arc::new(LedgerStore::open(Connection::open_in_memory()?)?),
            policy,
        })
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    /// Check the booking rules and insert the reservation atomically.
    pub async fn admit_and_create(&self, new: NewReservation) -> Result<Reservation, LedgerError> {
        self.admit_and_create_at(new, Utc::now()).await
    }

    /// Like [`Self::admit_and_create`] with an explicit "now" for the quota window.
    pub async fn admit_and_create_at(
        &self,
        new: NewReservation,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        let store = self.store.clone();
        let policy = self.policy;
        tokio::task::spawn_blocking(move || store.admit(&new, &policy, now))
            .await
            .map_err(StorageError::from)?
    }

    /// The reservation whose interval contains `as_of` on `device_id`, if any.
    pub async fn active_for(
        &self,
        device_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Reservation>, StorageError> {
        let store = self.store.clone();
        let device_id = device_id.to_string();
        tokio::task::spawn_blocking(move || store.active_for(&device_id, as_of)).await?
    }

    /// Reservations that ended within `window` before now or later, ordered by start.
    pub async fn list_recent(&self, window: TimeDelta) -> Result<Vec<Reservation>, StorageError> {
        self.list_recent_at(window, Utc::now()).await
    }

    pub async fn list_recent_at(
        &self,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StorageError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list_since(window_start(now, window))).await?
    }
}
