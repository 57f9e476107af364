//! SQLite-backed stream store.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use super::{
    Delivery, DueRule, GroupInfo, GroupStart, InvalidStreamId, PendingEntry, StreamEntry,
    StreamError, StreamId, StreamInfo,
};
use crate::clock::{Clock, SystemClock};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stream_heads(
  name TEXT PRIMARY KEY,
  last_ms INTEGER NOT NULL DEFAULT 0,
  last_seq INTEGER NOT NULL DEFAULT 0,
  entries_added INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS stream_entries(
  stream TEXT NOT NULL,
  ms INTEGER NOT NULL,
  seq INTEGER NOT NULL,
  body TEXT NOT NULL,
  PRIMARY KEY(stream, ms, seq)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS stream_groups(
  stream TEXT NOT NULL,
  name TEXT NOT NULL,
  cursor_ms INTEGER NOT NULL,
  cursor_seq INTEGER NOT NULL,
  PRIMARY KEY(stream, name)
);

CREATE TABLE IF NOT EXISTS stream_pending(
  stream TEXT NOT NULL,
  grp TEXT NOT NULL,
  ms INTEGER NOT NULL,
  seq INTEGER NOT NULL,
  consumer TEXT NOT NULL,
  delivered_at INTEGER NOT NULL,
  delivery_count INTEGER NOT NULL,
  PRIMARY KEY(stream, grp, ms, seq)
) WITHOUT ROWID;
"#;

/// Tunables for a [`StreamStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum entries a single stream may hold before `append` fails.
    pub max_entries: Option<u64>,
    /// How often a blocked reader re-checks the database for appends made by other processes.
    pub poll_interval: Duration,
    /// How long a statement waits on a lock held by another connection.
    pub busy_timeout: Duration,
    /// Time source for ids and idle computations.
    pub clock: Arc<dyn Clock>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_entries: None,
            poll_interval: Duration::from_millis(100),
            busy_timeout: Duration::from_secs(5),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Handle to a store holding any number of named streams.
///
/// Cloning is cheap; all clones share one connection and one wake-up signal.
#[derive(Clone)]
pub struct StreamStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    appended: Condvar,
    closed: AtomicBool,
    options: StoreOptions,
    location: String,
}

impl fmt::Debug for StreamStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStore")
            .field("location", &self.inner.location)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl StreamStore {
    /// Opens (creating if needed) a store file.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StreamError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn, options, path.display().to_string())?;
        info!(location = %store.inner.location, "opened stream store");
        Ok(store)
    }

    /// Opens a private in-memory store.
    pub fn in_memory(options: StoreOptions) -> Result<Self, StreamError> {
        Self::from_connection(Connection::open_in_memory()?, options, ":memory:".to_string())
    }

    fn from_connection(
        conn: Connection,
        options: StoreOptions,
        location: String,
    ) -> Result<Self, StreamError> {
        conn.busy_timeout(options.busy_timeout)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                appended: Condvar::new(),
                closed: AtomicBool::new(false),
                options,
                location,
            }),
        })
    }

    /// Returns a handle to the named stream. The stream is created lazily.
    pub fn stream(&self, name: impl Into<String>) -> Stream {
        Stream {
            store: self.clone(),
            name: name.into(),
        }
    }

    /// Names of every stream that has been appended to or has a group.
    pub fn stream_names(&self) -> Result<Vec<String>, StreamError> {
        self.ensure_open()?;
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM stream_heads ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Current time according to the store clock.
    pub fn now_ms(&self) -> u64 {
        self.inner.options.clock.now_ms()
    }

    /// Where the store lives (file path or `:memory:`).
    pub fn location(&self) -> &str {
        &self.inner.location
    }

    /// Closes the handle: blocked readers return and later calls fail with [`StreamError::Closed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!(location = %self.inner.location, "closing stream store");
            self.inner.appended.notify_all();
        }
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    fn write<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        self.ensure_open()?;
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = op(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn snapshot<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        self.ensure_open()?;
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        op(&tx)
    }
}

/// Handle to one named stream within a [`StreamStore`].
#[derive(Debug, Clone)]
pub struct Stream {
    store: StreamStore,
    name: String,
}

impl Stream {
    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store this stream belongs to.
    pub fn store(&self) -> &StreamStore {
        &self.store
    }

    /// Appends an opaque body and returns its id.
    ///
    /// Fails only when storage is exhausted or unavailable; group state never blocks an append.
    pub fn append(&self, body: &str) -> Result<StreamId, StreamError> {
        let now_ms = self.store.now_ms();
        let max_entries = self.store.inner.options.max_entries;
        let id = self.store.write(|conn| {
            ensure_head(conn, &self.name)?;
            if let Some(capacity) = max_entries {
                let length = stream_length(conn, &self.name)?;
                if length >= capacity {
                    return Err(StreamError::Exhausted(format!(
                        "stream {} holds {} entries (capacity {})",
                        self.name, length, capacity
                    )));
                }
            }
            let (last, _) = head(conn, &self.name)?.unwrap_or_default();
            let id = StreamId::next_after(last, now_ms);
            conn.execute(
                "INSERT INTO stream_entries(stream, ms, seq, body) VALUES (?1, ?2, ?3, ?4)",
                params![self.name, sql_u64(id.ms)?, sql_u64(id.seq)?, body],
            )?;
            conn.execute(
                "UPDATE stream_heads SET last_ms = ?2, last_seq = ?3, entries_added = entries_added + 1 \
                 WHERE name = ?1",
                params![self.name, sql_u64(id.ms)?, sql_u64(id.seq)?],
            )?;
            Ok(id)
        })?;
        self.store.inner.appended.notify_all();
        Ok(id)
    }

    /// Serializes `value` as JSON and appends it.
    pub fn append_json<T: Serialize>(&self, value: &T) -> Result<StreamId, StreamError> {
        let body = serde_json::to_string(value)?;
        self.append(&body)
    }

    /// Creates a consumer group.
    pub fn create_group(&self, group: &str, start: GroupStart) -> Result<(), StreamError> {
        self.store.write(|conn| self.insert_group(conn, group, start))?;
        info!(stream = %self.name, group, ?start, "created consumer group");
        Ok(())
    }

    /// Creates the group unless it already exists. Returns whether it was created.
    pub fn ensure_group(&self, group: &str, start: GroupStart) -> Result<bool, StreamError> {
        match self.create_group(group, start) {
            Ok(()) => Ok(true),
            Err(StreamError::GroupExists { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Deletes a group together with its PEL. Returns whether it existed.
    pub fn destroy_group(&self, group: &str) -> Result<bool, StreamError> {
        let existed = self.store.write(|conn| delete_group(conn, &self.name, group))?;
        if existed {
            info!(stream = %self.name, group, "destroyed consumer group");
        }
        Ok(existed)
    }

    /// Destroys and recreates a group at cursor zero so every stored entry is delivered again.
    pub fn recreate_group(&self, group: &str) -> Result<(), StreamError> {
        self.store.write(|conn| {
            delete_group(conn, &self.name, group)?;
            self.insert_group(conn, group, GroupStart::Beginning)
        })?;
        info!(stream = %self.name, group, "recreated consumer group at cursor zero");
        Ok(())
    }

    fn insert_group(
        &self,
        conn: &Connection,
        group: &str,
        start: GroupStart,
    ) -> Result<(), StreamError> {
        ensure_head(conn, &self.name)?;
        if group_cursor(conn, &self.name, group)?.is_some() {
            return Err(StreamError::GroupExists {
                stream: self.name.clone(),
                group: group.to_string(),
            });
        }
        let cursor = match start {
            GroupStart::Beginning => StreamId::ZERO,
            GroupStart::Latest => head(conn, &self.name)?.unwrap_or_default().0,
        };
        conn.execute(
            "INSERT INTO stream_groups(stream, name, cursor_ms, cursor_seq) VALUES (?1, ?2, ?3, ?4)",
            params![self.name, group, sql_u64(cursor.ms)?, sql_u64(cursor.seq)?],
        )?;
        Ok(())
    }

    /// Delivers up to `max_count` never-delivered entries to `consumer`.
    ///
    /// Each delivered entry enters the group's PEL owned by `consumer` and the
    /// group cursor advances past it. When nothing is available the caller is
    /// suspended for up to `block` before an empty result is returned.
    pub fn read(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, StreamError> {
        let deadline = Instant::now() + block;
        let poll_interval = self.store.inner.options.poll_interval;
        let mut conn = self.store.inner.conn.lock();
        loop {
            self.store.ensure_open()?;
            let now_ms = self.store.now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let delivered = self.deliver_new(&tx, group, consumer, max_count, now_ms)?;
            tx.commit()?;
            if !delivered.is_empty() || max_count == 0 {
                debug!(stream = %self.name, group, consumer, count = delivered.len(), "delivered entries");
                return Ok(delivered);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(poll_interval);
            self.store.inner.appended.wait_for(&mut conn, wait);
        }
    }

    fn deliver_new(
        &self,
        conn: &Connection,
        group: &str,
        consumer: &str,
        max_count: usize,
        now_ms: u64,
    ) -> Result<Vec<Delivery>, StreamError> {
        let cursor = self.require_cursor(conn, group)?;
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let entries = {
            let mut stmt = conn.prepare(
                "SELECT ms, seq, body FROM stream_entries \
                 WHERE stream = ?1 AND (ms > ?2 OR (ms = ?2 AND seq > ?3)) \
                 ORDER BY ms, seq LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![
                    self.name,
                    sql_u64(cursor.ms)?,
                    sql_u64(cursor.seq)?,
                    sql_u64(max_count as u64)?
                ],
                |row| {
                    Ok(StreamEntry {
                        id: column_id(row, 0)?,
                        body: row.get(2)?,
                    })
                },
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let Some(last) = entries.last().map(|entry| entry.id) else {
            return Ok(Vec::new());
        };
        for entry in &entries {
            conn.execute(
                "INSERT INTO stream_pending(stream, grp, ms, seq, consumer, delivered_at, delivery_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![
                    self.name,
                    group,
                    sql_u64(entry.id.ms)?,
                    sql_u64(entry.id.seq)?,
                    consumer,
                    sql_u64(now_ms)?
                ],
            )?;
        }
        conn.execute(
            "UPDATE stream_groups SET cursor_ms = ?3, cursor_seq = ?4 WHERE stream = ?1 AND name = ?2",
            params![self.name, group, sql_u64(last.ms)?, sql_u64(last.seq)?],
        )?;
        Ok(entries
            .into_iter()
            .map(|entry| Delivery {
                entry,
                delivery_count: 1,
            })
            .collect())
    }

    /// Removes ids from the group's PEL. Absent ids are ignored.
    ///
    /// Returns how many entries were actually acknowledged.
    pub fn ack(&self, group: &str, ids: &[StreamId]) -> Result<usize, StreamError> {
        self.store.write(|conn| {
            self.require_cursor(conn, group)?;
            let mut removed = 0usize;
            for id in ids {
                removed += conn.execute(
                    "DELETE FROM stream_pending WHERE stream = ?1 AND grp = ?2 AND ms = ?3 AND seq = ?4",
                    params![self.name, group, sql_u64(id.ms)?, sql_u64(id.seq)?],
                )?;
            }
            Ok(removed)
        })
    }

    /// Snapshot of the group's PEL in id order.
    pub fn pending(&self, group: &str) -> Result<Vec<PendingEntry>, StreamError> {
        self.store.snapshot(|conn| {
            self.require_cursor(conn, group)?;
            let mut stmt = conn.prepare(
                "SELECT ms, seq, consumer, delivered_at, delivery_count FROM stream_pending \
                 WHERE stream = ?1 AND grp = ?2 ORDER BY ms, seq",
            )?;
            let rows = stmt.query_map(params![self.name, group], |row| {
                Ok(PendingEntry {
                    id: column_id(row, 0)?,
                    consumer: row.get(2)?,
                    delivered_at_ms: column_u64(row, 3)?,
                    delivery_count: column_u32(row, 4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Transfers PEL entries idle for at least `min_idle` to `consumer`.
    ///
    /// Claimed entries get a fresh delivery time and an incremented delivery
    /// count. Ids that are not pending, or not idle long enough, are skipped.
    pub fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<Delivery>, StreamError> {
        let now_ms = self.store.now_ms();
        let min_idle_ms = duration_ms(min_idle);
        self.store.write(|conn| {
            self.require_cursor(conn, group)?;
            let mut claimed = Vec::new();
            for id in ids {
                if let Some(delivery) = self.claim_one(conn, group, consumer, *id, min_idle_ms, now_ms)? {
                    claimed.push(delivery);
                }
            }
            Ok(claimed)
        })
    }

    /// Claims up to `max_count` PEL entries, oldest first, that are due under `rule`.
    ///
    /// An entry delivered `n` times is due once idle for
    /// `min(base_backoff * 2^(n-1), max_backoff)`. Entries owned by a consumer
    /// other than `consumer` must also be idle for `rule.claim_idle`. The
    /// selection happens in SQL, so entries still backing off are never loaded.
    pub fn claim_due(
        &self,
        group: &str,
        consumer: &str,
        rule: &DueRule,
        max_count: usize,
    ) -> Result<Vec<Delivery>, StreamError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let now_ms = self.store.now_ms();
        let base_ms = duration_ms(rule.base_backoff);
        // Cap the doubling before the shift could reach the sign bit.
        let max_shift = (base_ms.max(1).leading_zeros().saturating_sub(2)).min(31);
        self.store.write(|conn| {
            self.require_cursor(conn, group)?;
            let due = {
                let mut stmt = conn.prepare(
                    "SELECT ms, seq FROM stream_pending \
                     WHERE stream = ?1 AND grp = ?2 \
                       AND ?3 - delivered_at >= MAX( \
                         MIN(?5, ?4 << MIN(MAX(delivery_count, 1) - 1, ?6)), \
                         CASE WHEN consumer = ?7 THEN 0 ELSE ?8 END) \
                     ORDER BY ms, seq LIMIT ?9",
                )?;
                let rows = stmt.query_map(
                    params![
                        self.name,
                        group,
                        sql_u64(now_ms)?,
                        sql_u64(base_ms)?,
                        sql_u64(duration_ms(rule.max_backoff))?,
                        max_shift,
                        consumer,
                        sql_u64(duration_ms(rule.claim_idle))?,
                        sql_u64(max_count as u64)?
                    ],
                    |row| column_id(row, 0),
                )?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let mut claimed = Vec::with_capacity(due.len());
            for id in due {
                if let Some(delivery) = self.claim_one(conn, group, consumer, id, 0, now_ms)? {
                    claimed.push(delivery);
                }
            }
            Ok(claimed)
        })
    }

    fn claim_one(
        &self,
        conn: &Connection,
        group: &str,
        consumer: &str,
        id: StreamId,
        min_idle_ms: u64,
        now_ms: u64,
    ) -> Result<Option<Delivery>, StreamError> {
        let (ms, seq) = (sql_u64(id.ms)?, sql_u64(id.seq)?);
        let pending = conn
            .query_row(
                "SELECT delivered_at, delivery_count FROM stream_pending \
                 WHERE stream = ?1 AND grp = ?2 AND ms = ?3 AND seq = ?4",
                params![self.name, group, ms, seq],
                |row| Ok((column_u64(row, 0)?, column_u32(row, 1)?)),
            )
            .optional()?;
        let Some((delivered_at, count)) = pending else {
            return Ok(None);
        };
        if now_ms.saturating_sub(delivered_at) < min_idle_ms {
            return Ok(None);
        }
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM stream_entries WHERE stream = ?1 AND ms = ?2 AND seq = ?3",
                params![self.name, ms, seq],
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            conn.execute(
                "DELETE FROM stream_pending WHERE stream = ?1 AND grp = ?2 AND ms = ?3 AND seq = ?4",
                params![self.name, group, ms, seq],
            )?;
            return Ok(None);
        };
        let delivery_count = count.saturating_add(1);
        conn.execute(
            "UPDATE stream_pending SET consumer = ?5, delivered_at = ?6, delivery_count = ?7 \
             WHERE stream = ?1 AND grp = ?2 AND ms = ?3 AND seq = ?4",
            params![self.name, group, ms, seq, consumer, sql_u64(now_ms)?, delivery_count],
        )?;
        Ok(Some(Delivery {
            entry: StreamEntry { id, body },
            delivery_count,
        }))
    }

    /// Deletes the oldest entries so that at most `max_len` remain.
    ///
    /// Trimming stops at the first entry some group has not yet delivered or
    /// still holds in its PEL, so the slowest group bounds how far the head
    /// can move. Returns the number of entries removed.
    pub fn trim(&self, max_len: u64) -> Result<u64, StreamError> {
        let removed = self.store.write(|conn| {
            let length = stream_length(conn, &self.name)?;
            if length <= max_len {
                return Ok(0);
            }
            let cursors = {
                let mut stmt = conn.prepare(
                    "SELECT cursor_ms, cursor_seq FROM stream_groups WHERE stream = ?1",
                )?;
                let rows = stmt.query_map(params![self.name], |row| {
                    column_id(row, 0)
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let candidates = {
                let mut stmt = conn.prepare(
                    "SELECT ms, seq FROM stream_entries WHERE stream = ?1 ORDER BY ms, seq LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![self.name, sql_u64(length - max_len)?], |row| {
                    column_id(row, 0)
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let mut removed = 0u64;
            for id in candidates {
                if cursors.iter().any(|cursor| id > *cursor) {
                    break;
                }
                let pending: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM stream_pending WHERE stream = ?1 AND ms = ?2 AND seq = ?3",
                    params![self.name, sql_u64(id.ms)?, sql_u64(id.seq)?],
                    |row| row.get(0),
                )?;
                if pending > 0 {
                    break;
                }
                conn.execute(
                    "DELETE FROM stream_entries WHERE stream = ?1 AND ms = ?2 AND seq = ?3",
                    params![self.name, sql_u64(id.ms)?, sql_u64(id.seq)?],
                )?;
                removed += 1;
            }
            Ok(removed)
        })?;
        if removed > 0 {
            debug!(stream = %self.name, removed, max_len, "trimmed stream");
        }
        Ok(removed)
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> Result<u64, StreamError> {
        self.store.snapshot(|conn| stream_length(conn, &self.name))
    }

    /// Whether the stream currently stores no entries.
    pub fn is_empty(&self) -> Result<bool, StreamError> {
        Ok(self.len()? == 0)
    }

    /// Stored entries with ids greater than `after`, oldest first. Does not touch any group.
    pub fn range(&self, after: StreamId, limit: usize) -> Result<Vec<StreamEntry>, StreamError> {
        self.store.snapshot(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ms, seq, body FROM stream_entries \
                 WHERE stream = ?1 AND (ms > ?2 OR (ms = ?2 AND seq > ?3)) \
                 ORDER BY ms, seq LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![self.name, sql_u64(after.ms)?, sql_u64(after.seq)?, sql_u64(limit as u64)?],
                |row| {
                    Ok(StreamEntry {
                        id: column_id(row, 0)?,
                        body: row.get(2)?,
                    })
                },
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Length, id range and per-group progress.
    pub fn info(&self) -> Result<StreamInfo, StreamError> {
        self.store.snapshot(|conn| {
            let length = stream_length(conn, &self.name)?;
            let head = head(conn, &self.name)?;
            let first_id = conn
                .query_row(
                    "SELECT ms, seq FROM stream_entries WHERE stream = ?1 ORDER BY ms, seq LIMIT 1",
                    params![self.name],
                    |row| {
                        column_id(row, 0)
                    },
                )
                .optional()?;
            let group_rows = {
                let mut stmt = conn.prepare(
                    "SELECT name, cursor_ms, cursor_seq FROM stream_groups WHERE stream = ?1 ORDER BY name",
                )?;
                let rows = stmt.query_map(params![self.name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        column_id(row, 1)?,
                    ))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let mut groups = Vec::with_capacity(group_rows.len());
            for (name, cursor) in group_rows {
                let pending = conn.query_row(
                    "SELECT COUNT(*) FROM stream_pending WHERE stream = ?1 AND grp = ?2",
                    params![self.name, name],
                    |row| column_u64(row, 0),
                )?;
                let undelivered = conn.query_row(
                    "SELECT COUNT(*) FROM stream_entries \
                     WHERE stream = ?1 AND (ms > ?2 OR (ms = ?2 AND seq > ?3))",
                    params![self.name, sql_u64(cursor.ms)?, sql_u64(cursor.seq)?],
                    |row| column_u64(row, 0),
                )?;
                groups.push(GroupInfo {
                    name,
                    cursor,
                    pending,
                    undelivered,
                });
            }
            Ok(StreamInfo {
                name: self.name.clone(),
                length,
                entries_added: head.map(|(_, added)| added).unwrap_or(0),
                first_id,
                last_id: head
                    .map(|(last, _)| last)
                    .filter(|last| *last != StreamId::ZERO),
                groups,
            })
        })
    }

    fn require_cursor(&self, conn: &Connection, group: &str) -> Result<StreamId, StreamError> {
        group_cursor(conn, &self.name, group)?.ok_or_else(|| StreamError::UnknownGroup {
            stream: self.name.clone(),
            group: group.to_string(),
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    let ceiling = i64::MAX.unsigned_abs();
    u64::try_from(duration.as_millis()).map_or(ceiling, |ms| ms.min(ceiling))
}

fn sql_u64(value: u64) -> Result<i64, StreamError> {
    i64::try_from(value).map_err(|_| StreamError::InvalidId(InvalidStreamId(value.to_string())))
}

fn column_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn column_u32(row: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(idx)?;
    u32::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

/// Reads an id stored as `ms` at `idx` and `seq` at `idx + 1`.
fn column_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<StreamId> {
    Ok(StreamId::new(column_u64(row, idx)?, column_u64(row, idx + 1)?))
}

fn ensure_head(conn: &Connection, stream: &str) -> Result<(), StreamError> {
    conn.execute(
        "INSERT OR IGNORE INTO stream_heads(name) VALUES (?1)",
        params![stream],
    )?;
    Ok(())
}

fn head(conn: &Connection, stream: &str) -> Result<Option<(StreamId, u64)>, StreamError> {
    let row = conn
        .query_row(
            "SELECT last_ms, last_seq, entries_added FROM stream_heads WHERE name = ?1",
            params![stream],
            |row| {
                Ok((
                    column_id(row, 0)?,
                    column_u64(row, 2)?,
                ))
            },
        )
        .optional()?;
    Ok(row)
}

fn stream_length(conn: &Connection, stream: &str) -> Result<u64, StreamError> {
    let length = conn.query_row(
        "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
        params![stream],
        |row| column_u64(row, 0),
    )?;
    Ok(length)
}

fn group_cursor(
    conn: &Connection,
    stream: &str,
    group: &str,
) -> Result<Option<StreamId>, StreamError> {
    let cursor = conn
        .query_row(
            "SELECT cursor_ms, cursor_seq FROM stream_groups WHERE stream = ?1 AND name = ?2",
            params![stream, group],
            |row| column_id(row, 0),
        )
        .optional()?;
    Ok(cursor)
}

fn delete_group(conn: &Connection, stream: &str, group: &str) -> Result<bool, StreamError> {
    conn.execute(
        "DELETE FROM stream_pending WHERE stream = ?1 AND grp = ?2",
        params![stream, group],
    )?;
    let removed = conn.execute(
        "DELETE FROM stream_groups WHERE stream = ?1 AND name = ?2",
        params![stream, group],
    )?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    const NO_BLOCK: Duration = Duration::ZERO;

    fn manual_store(start_ms: u64) -> (StreamStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let options = StoreOptions {
            clock: clock.clone(),
            ..StoreOptions::default()
        };
        (StreamStore::in_memory(options).expect("store"), clock)
    }

    fn ids(deliveries: &[Delivery]) -> Vec<StreamId> {
        deliveries.iter().map(Delivery::id).collect()
    }

    #[test]
    fn append_assigns_strictly_increasing_ids() {
        let (store, clock) = manual_store(1_000);
        let stream = store.stream("s");
        let a = stream.append("a").unwrap();
        let b = stream.append("b").unwrap();
        clock.set(500);
        let c = stream.append("c").unwrap();
        clock.set(2_000);
        let d = stream.append("d").unwrap();
        assert_eq!(a, StreamId::new(1_000, 0));
        assert_eq!(b, StreamId::new(1_000, 1));
        assert_eq!(c, StreamId::new(1_000, 2));
        assert_eq!(d, StreamId::new(2_000, 0));
    }

    #[test]
    fn read_moves_entries_into_pel_and_ack_removes_them() {
        let (store, _) = manual_store(10);
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        for body in ["one", "two", "three"] {
            stream.append(body).unwrap();
        }

        let first = stream.read("g", "c1", 2, NO_BLOCK).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|d| d.delivery_count == 1));
        let second = stream.read("g", "c2", 10, NO_BLOCK).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].entry.body, "three");

        let pending = stream.pending("g").unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].consumer, "c1");
        assert_eq!(pending[2].consumer, "c2");

        assert_eq!(stream.ack("g", &ids(&first)).unwrap(), 2);
        // acking again is a no-op
        assert_eq!(stream.ack("g", &ids(&first)).unwrap(), 0);
        assert_eq!(stream.pending("g").unwrap().len(), 1);
        assert!(stream.read("g", "c1", 10, NO_BLOCK).unwrap().is_empty());
    }

    #[test]
    fn groups_progress_independently() {
        let (store, _) = manual_store(10);
        let stream = store.stream("s");
        stream.create_group("a", GroupStart::Beginning).unwrap();
        stream.append("x").unwrap();
        stream.create_group("b", GroupStart::Beginning).unwrap();
        stream.create_group("late", GroupStart::Latest).unwrap();
        stream.append("y").unwrap();

        assert_eq!(stream.read("a", "c", 10, NO_BLOCK).unwrap().len(), 2);
        assert_eq!(stream.read("b", "c", 10, NO_BLOCK).unwrap().len(), 2);
        let late = stream.read("late", "c", 10, NO_BLOCK).unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].entry.body, "y");
    }

    #[test]
    fn unknown_and_duplicate_groups_are_rejected() {
        let (store, _) = manual_store(10);
        let stream = store.stream("s");
        assert!(matches!(
            stream.read("missing", "c", 1, NO_BLOCK),
            Err(StreamError::UnknownGroup { .. })
        ));
        stream.create_group("g", GroupStart::Beginning).unwrap();
        assert!(matches!(
            stream.create_group("g", GroupStart::Beginning),
            Err(StreamError::GroupExists { .. })
        ));
        assert!(!stream.ensure_group("g", GroupStart::Beginning).unwrap());
    }

    #[test]
    fn blocking_read_times_out_empty() {
        let (store, _) = manual_store(10);
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        let started = Instant::now();
        let got = stream
            .read("g", "c", 5, Duration::from_millis(150))
            .unwrap();
        assert!(got.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn blocking_read_wakes_on_append() {
        let store = StreamStore::in_memory(StoreOptions::default()).unwrap();
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        let reader = {
            let stream = stream.clone();
            thread::spawn(move || stream.read("g", "c", 1, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(50));
        stream.append("late").unwrap();
        let got = reader.join().expect("reader thread").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].entry.body, "late");
    }

    #[test]
    fn close_releases_blocked_readers() {
        let store = StreamStore::in_memory(StoreOptions::default()).unwrap();
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        let reader = {
            let stream = stream.clone();
            thread::spawn(move || stream.read("g", "c", 1, Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(50));
        store.close();
        let result = reader.join().expect("reader thread");
        assert!(matches!(result, Err(StreamError::Closed)));
        assert!(matches!(stream.append("x"), Err(StreamError::Closed)));
    }

    #[test]
    fn claim_respects_min_idle_and_counts_deliveries() {
        let (store, clock) = manual_store(1_000);
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        let id = stream.append("work").unwrap();
        stream.read("g", "dead", 1, NO_BLOCK).unwrap();

        clock.advance(Duration::from_millis(500));
        let early = stream
            .claim("g", "live", Duration::from_secs(1), &[id])
            .unwrap();
        assert!(early.is_empty());

        clock.advance(Duration::from_millis(600));
        let claimed = stream
            .claim("g", "live", Duration::from_secs(1), &[id])
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 2);
        assert_eq!(claimed[0].entry.body, "work");

        let pending = stream.pending("g").unwrap();
        assert_eq!(pending[0].consumer, "live");
        assert_eq!(pending[0].delivered_at_ms, 2_100);

        // the claim reset idle time, so an immediate second claim is refused
        assert!(stream
            .claim("g", "other", Duration::from_secs(1), &[id])
            .unwrap()
            .is_empty());
        // claiming an acknowledged id is a no-op
        stream.ack("g", &[id]).unwrap();
        assert!(stream
            .claim("g", "other", Duration::ZERO, &[id])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn claim_due_takes_only_entries_past_their_backoff() {
        let (store, clock) = manual_store(1_000);
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        let a = stream.append("a").unwrap();
        let b = stream.append("b").unwrap();
        let c = stream.append("c").unwrap();
        stream.read("g", "me", 2, NO_BLOCK).unwrap();
        stream.read("g", "other", 1, NO_BLOCK).unwrap();
        stream.claim("g", "me", Duration::ZERO, &[b]).unwrap();
        let rule = DueRule {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            claim_idle: Duration::from_secs(10),
        };

        assert!(stream.claim_due("g", "me", &rule, 10).unwrap().is_empty());

        clock.set(2_000);
        let first = stream.claim_due("g", "me", &rule, 10).unwrap();
        assert_eq!(ids(&first), vec![a], "b was delivered twice and waits 2s");
        assert_eq!(first[0].delivery_count, 2);

        clock.set(3_000);
        let second = stream.claim_due("g", "me", &rule, 10).unwrap();
        assert_eq!(ids(&second), vec![b]);
        assert_eq!(second[0].delivery_count, 3);

        clock.set(11_000);
        let oldest = stream.claim_due("g", "me", &rule, 2).unwrap();
        assert_eq!(ids(&oldest), vec![a, b]);
        let rest = stream.claim_due("g", "me", &rule, 2).unwrap();
        assert_eq!(ids(&rest), vec![c], "other's entry needs the claim idle time");
        assert!(stream.claim_due("g", "me", &rule, 0).unwrap().is_empty());
    }

    #[test]
    fn claim_due_survives_huge_backoffs() {
        let (store, clock) = manual_store(1_000);
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        let id = stream.append("a").unwrap();
        stream.read("g", "me", 1, NO_BLOCK).unwrap();
        for _ in 0..40 {
            stream.claim("g", "me", Duration::ZERO, &[id]).unwrap();
        }
        clock.set(1_000_000);
        let rule = DueRule {
            base_backoff: Duration::MAX,
            max_backoff: Duration::from_secs(500),
            claim_idle: Duration::ZERO,
        };
        let due = stream.claim_due("g", "me", &rule, 1).unwrap();
        assert_eq!(due.len(), 1, "the cap applies even when doubling would overflow");
        assert_eq!(due[0].delivery_count, 42);
    }

    #[test]
    fn out_of_range_integers_are_errors_not_wraps() {
        assert!(matches!(sql_u64(u64::MAX), Err(StreamError::InvalidId(_))));
        assert_eq!(sql_u64(42).unwrap(), 42);

        let (store, _) = manual_store(1_000);
        let stream = store.stream("s");
        store
            .inner
            .conn
            .lock()
            .execute(
                "INSERT INTO stream_entries(stream, ms, seq, body) VALUES ('s', -5, 0, 'x')",
                [],
            )
            .unwrap();
        let err = stream.info().unwrap_err();
        assert!(matches!(
            err,
            StreamError::Storage(rusqlite::Error::IntegralValueOutOfRange(0, -5))
        ));
    }

    #[test]
    fn trim_never_drops_pending_or_undelivered_entries() {
        let (store, _) = manual_store(10);
        let stream = store.stream("s");
        stream.create_group("fast", GroupStart::Beginning).unwrap();
        stream.create_group("slow", GroupStart::Beginning).unwrap();
        let appended: Vec<_> = (0..6)
            .map(|i| stream.append(&i.to_string()).unwrap())
            .collect();

        let fast = stream.read("fast", "c", 6, NO_BLOCK).unwrap();
        stream.ack("fast", &ids(&fast)).unwrap();
        let slow = stream.read("slow", "c", 3, NO_BLOCK).unwrap();
        stream.ack("slow", &[slow[0].id(), slow[1].id()]).unwrap();

        // appended[2] is pending for "slow": only the two entries before it may go
        assert_eq!(stream.trim(1).unwrap(), 2);
        assert_eq!(stream.len().unwrap(), 4);
        let info = stream.info().unwrap();
        assert_eq!(info.first_id, Some(appended[2]));
        assert_eq!(info.entries_added, 6);

        stream.ack("slow", &[appended[2]]).unwrap();
        // appended[3..] are undelivered for "slow"
        assert_eq!(stream.trim(0).unwrap(), 1);
        assert_eq!(stream.len().unwrap(), 3);
    }

    #[test]
    fn trim_without_groups_drops_oldest() {
        let (store, _) = manual_store(10);
        let stream = store.stream("s");
        for i in 0..5 {
            stream.append(&i.to_string()).unwrap();
        }
        assert_eq!(stream.trim(2).unwrap(), 3);
        let remaining: Vec<_> = stream
            .range(StreamId::ZERO, 10)
            .unwrap()
            .into_iter()
            .map(|entry| entry.body)
            .collect();
        assert_eq!(remaining, vec!["3", "4"]);
        // ids keep growing after the head is trimmed
        let next = stream.append("5").unwrap();
        assert_eq!(next, StreamId::new(10, 5));
    }

    #[test]
    fn recreate_group_replays_every_stored_entry() {
        let (store, _) = manual_store(10);
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        for i in 0..3 {
            stream.append(&i.to_string()).unwrap();
        }
        let first = stream.read("g", "c", 10, NO_BLOCK).unwrap();
        stream.ack("g", &ids(&first)).unwrap();
        stream.read("g", "c", 10, NO_BLOCK).unwrap();

        stream.recreate_group("g").unwrap();
        assert!(stream.pending("g").unwrap().is_empty());
        let replayed = stream.read("g", "c", 10, NO_BLOCK).unwrap();
        assert_eq!(ids(&replayed), ids(&first));
    }

    #[test]
    fn info_reports_pending_and_undelivered() {
        let (store, _) = manual_store(10);
        let stream = store.stream("s");
        stream.create_group("g", GroupStart::Beginning).unwrap();
        for i in 0..4 {
            stream.append(&i.to_string()).unwrap();
        }
        stream.read("g", "c", 1, NO_BLOCK).unwrap();
        let info = stream.info().unwrap();
        assert_eq!(info.length, 4);
        assert_eq!(info.groups.len(), 1);
        assert_eq!(info.groups[0].pending, 1);
        assert_eq!(info.groups[0].undelivered, 3);
        assert_eq!(info.groups[0].lag(), 4);
        assert_eq!(store.stream_names().unwrap(), vec!["s".to_string()]);
    }

    #[test]
    fn append_fails_once_capacity_is_reached() {
        let options = StoreOptions {
            max_entries: Some(2),
            ..StoreOptions::default()
        };
        let store = StreamStore::in_memory(options).unwrap();
        let stream = store.stream("s");
        stream.append("a").unwrap();
        stream.append("b").unwrap();
        assert!(matches!(stream.append("c"), Err(StreamError::Exhausted(_))));
        stream.trim(1).unwrap();
        stream.append("c").unwrap();
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("streams.db");
        let id = {
            let store = StreamStore::open(&path, StoreOptions::default()).unwrap();
            let stream = store.stream("s");
            stream.create_group("g", GroupStart::Beginning).unwrap();
            let id = stream.append("persisted").unwrap();
            stream.read("g", "c", 1, NO_BLOCK).unwrap();
            store.close();
            id
        };
        let store = StreamStore::open(&path, StoreOptions::default()).unwrap();
        let stream = store.stream("s");
        let pending = stream.pending("g").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        let claimed = stream.claim("g", "c2", Duration::ZERO, &[id]).unwrap();
        assert_eq!(claimed[0].entry.body, "persisted");
    }
}
