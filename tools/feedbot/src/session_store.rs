use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::errors::FeedbotError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::types::SessionMaterial;

const READ_POOL_SIZE: usize = 4;
const MS_PER_HOUR: f64 = 3_600_000.0;

type StoreResult<T> = Result<T, FeedbotError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub login_count: i64,
    pub last_used: i64,
    pub bot_type: String,
}

/// One persisted session per account. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub account_id: String,
    #[serde(skip)]
    pub material: SessionMaterial,
    pub last_login: i64,
    /// Stored flag only; see [`SessionRecord::is_valid_at`] for validity.
    pub is_valid: bool,
    pub metadata: SessionMetadata,
    pub user_agent: Option<String>,
    pub created_at: i64,
}

impl SessionRecord {
    pub fn is_valid_at(&self, now_ms: i64, max_age: Duration) -> bool {
        self.is_valid && now_ms.saturating_sub(self.last_login) < duration_ms(max_age)
    }

    pub fn age_hours(&self, now_ms: i64) -> f64 {
        now_ms.saturating_sub(self.last_login) as f64 / MS_PER_HOUR
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub valid: usize,
    /// Records failing the validity predicate, whether flagged or aged out.
    pub expired: usize,
    pub avg_age_hours: f64,
    pub by_bot_type: BTreeMap<String, usize>,
    /// `last_login` of the oldest and newest records.
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkout {
    /// Valid session; `metadata.last_used` has been stamped.
    Ready(SessionRecord),
    Expired(SessionRecord),
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFilter {
    All,
    Valid,
    Invalid,
}

#[derive(Debug)]
enum WriteCmd {
    Upsert {
        account_id: String,
        material: SessionMaterial,
        bot_type: String,
        user_agent: Option<String>,
        now: i64,
        reply: oneshot::Sender<StoreResult<SessionRecord>>,
    },
    Invalidate {
        account_id: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    Delete {
        account_id: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    Touch {
        account_id: String,
        now: i64,
        reply: oneshot::Sender<StoreResult<Option<SessionRecord>>>,
    },
    CleanupExpired {
        cutoff: i64,
        reply: oneshot::Sender<StoreResult<usize>>,
    },
    DeleteOldInvalidated {
        cutoff: i64,
        reply: oneshot::Sender<StoreResult<usize>>,
    },
}

/// Session records on SQLite. All writes funnel through one writer thread,
/// so two upserts for the same account never interleave and no
/// `login_count` increment is lost. Reads go to a pool of read-only WAL
/// connections and see whole rows only.
pub struct SessionStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
    max_age: Duration,
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl SessionStore {
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        max_age: Duration,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "session_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FeedbotError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| FeedbotError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(FeedbotError::Database(format!(
                    "session database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(FeedbotError::Database(format!(
                    "session database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn, clock.now_unix_ms())?;

        let (write_tx, mut write_rx) = mpsc::channel(128);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::Upsert {
                        account_id,
                        material,
                        bot_type,
                        user_agent,
                        now,
                        reply,
                    } => {
                        let result = upsert_session(
                            &write_conn,
                            &account_id,
                            &material,
                            &bot_type,
                            user_agent.as_deref(),
                            now,
                        )
                        .and_then(|()| {
                            fetch_session(&write_conn, &account_id)?.ok_or_else(|| {
                                FeedbotError::Database("row missing after upsert".to_string())
                            })
                        });
                        let _ = reply.send(result);
                    }
                    WriteCmd::Invalidate { account_id, reply } => {
                        let result = write_conn
                            .execute(
                                "UPDATE sessions SET is_valid = 0 WHERE account_id = ?1",
                                params![account_id],
                            )
                            .map(|rows| rows > 0)
                            .map_err(db_err);
                        let _ = reply.send(result);
                    }
                    WriteCmd::Delete { account_id, reply } => {
                        let result = write_conn
                            .execute(
                                "DELETE FROM sessions WHERE account_id = ?1",
                                params![account_id],
                            )
                            .map(|rows| rows > 0)
                            .map_err(db_err);
                        let _ = reply.send(result);
                    }
                    WriteCmd::Touch {
                        account_id,
                        now,
                        reply,
                    } => {
                        let result = write_conn
                            .execute(
                                "UPDATE sessions SET last_used = ?2 WHERE account_id = ?1",
                                params![account_id, now],
                            )
                            .map_err(db_err)
                            .and_then(|_| fetch_session(&write_conn, &account_id));
                        let _ = reply.send(result);
                    }
                    WriteCmd::CleanupExpired { cutoff, reply } => {
                        let result = write_conn
                            .execute(
                                "UPDATE sessions SET is_valid = 0 WHERE is_valid = 1 AND last_login <= ?1",
                                params![cutoff],
                            )
                            .map_err(db_err);
                        let _ = reply.send(result);
                    }
                    WriteCmd::DeleteOldInvalidated { cutoff, reply } => {
                        let result = write_conn
                            .execute(
                                "DELETE FROM sessions WHERE is_valid = 0 AND last_login < ?1",
                                params![cutoff],
                            )
                            .map_err(db_err);
                        let _ = reply.send(result);
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        append_run_log(
            "info",
            "session_store.opened",
            json!({
                "path": path.display().to_string(),
                "max_session_age_ms": duration_ms(max_age),
            }),
        );
        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            db_path: path,
            clock,
            max_age,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> WriteCmd,
    ) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .as_ref()
            .ok_or_else(|| FeedbotError::Database("store is closed".to_string()))?
            .blocking_send(build(reply_tx))
            .map_err(|e| FeedbotError::Database(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| FeedbotError::Database(e.to_string()))?
    }

    /// Never auto-invalidates; combine with [`SessionRecord::is_valid_at`].
    pub fn get(&self, account_id: &str) -> StoreResult<Option<SessionRecord>> {
        self.read_pool
            .with_conn(|conn| fetch_session(conn, account_id))
    }

    /// Create the record with `login_count = 1`, or overwrite the material,
    /// refresh `last_login`, revalidate and bump `login_count`.
    pub fn upsert(
        &self,
        account_id: &str,
        material: SessionMaterial,
        bot_type: &str,
        user_agent: Option<&str>,
    ) -> StoreResult<SessionRecord> {
        let now = self.clock.now_unix_ms();
        let result = self.send(|reply| WriteCmd::Upsert {
            account_id: account_id.to_string(),
            material,
            bot_type: bot_type.to_string(),
            user_agent: user_agent.map(str::to_string),
            now,
            reply,
        });
        match &result {
            Ok(record) => append_run_log(
                "info",
                "session_store.upsert",
                json!({
                    "account_id": account_id,
                    "bot_type": bot_type,
                    "login_count": record.metadata.login_count,
                }),
            ),
            Err(e) => append_run_log(
                "error",
                "session_store.upsert.failed",
                json!({ "account_id": account_id, "error": e.to_string() }),
            ),
        }
        result
    }

    pub fn invalidate(&self, account_id: &str) -> StoreResult<()> {
        let found = self.send(|reply| WriteCmd::Invalidate {
            account_id: account_id.to_string(),
            reply,
        })?;
        if !found {
            append_run_log(
                "warn",
                "session_store.invalidate.missing",
                json!({ "account_id": account_id }),
            );
            return Err(FeedbotError::NotFound(format!("session for {account_id}")));
        }
        append_run_log(
            "info",
            "session_store.invalidated",
            json!({ "account_id": account_id }),
        );
        Ok(())
    }

    pub fn delete(&self, account_id: &str) -> StoreResult<bool> {
        let removed = self.send(|reply| WriteCmd::Delete {
            account_id: account_id.to_string(),
            reply,
        })?;
        append_run_log(
            "info",
            "session_store.delete",
            json!({ "account_id": account_id, "removed": removed }),
        );
        Ok(removed)
    }

    pub fn is_valid(&self, account_id: &str) -> StoreResult<bool> {
        let now = self.clock.now_unix_ms();
        Ok(self
            .get(account_id)?
            .is_some_and(|record| record.is_valid_at(now, self.max_age)))
    }

    /// Read the record for an active run, stamping `last_used` when it is valid.
    pub fn checkout(&self, account_id: &str) -> StoreResult<Checkout> {
        let now = self.clock.now_unix_ms();
        let Some(record) = self.get(account_id)? else {
            append_run_log(
                "info",
                "session_store.checkout.missing",
                json!({ "account_id": account_id }),
            );
            return Ok(Checkout::Missing);
        };
        if !record.is_valid_at(now, self.max_age) {
            append_run_log(
                "info",
                "session_store.checkout.expired",
                json!({
                    "account_id": account_id,
                    "is_valid": record.is_valid,
                    "age_hours": record.age_hours(now),
                }),
            );
            return Ok(Checkout::Expired(record));
        }
        let touched = self.send(|reply| WriteCmd::Touch {
            account_id: account_id.to_string(),
            now,
            reply,
        })?;
        append_run_log(
            "info",
            "session_store.checkout.ready",
            json!({ "account_id": account_id }),
        );
        // A concurrent delete between the read and the stamp leaves nothing to run with.
        Ok(touched.map_or(Checkout::Missing, Checkout::Ready))
    }

    /// Flip `is_valid` off for every still-flagged record past the validity window.
    pub fn cleanup_expired(&self) -> StoreResult<usize> {
        let cutoff = self.clock.now_unix_ms().saturating_sub(duration_ms(self.max_age));
        let flipped = self.send(|reply| WriteCmd::CleanupExpired { cutoff, reply })?;
        append_run_log(
            if flipped > 0 { "warn" } else { "debug" },
            "session_store.cleanup_expired",
            json!({ "flipped": flipped }),
        );
        Ok(flipped)
    }

    pub fn delete_old_invalidated(&self, retention: Duration) -> StoreResult<usize> {
        let cutoff = self.clock.now_unix_ms().saturating_sub(duration_ms(retention));
        let deleted = self.send(|reply| WriteCmd::DeleteOldInvalidated { cutoff, reply })?;
        append_run_log(
            "info",
            "session_store.delete_old_invalidated",
            json!({ "deleted": deleted, "retention_ms": duration_ms(retention) }),
        );
        Ok(deleted)
    }

    pub fn list(&self, filter: SessionFilter) -> StoreResult<Vec<SessionRecord>> {
        let cutoff = self.clock.now_unix_ms().saturating_sub(duration_ms(self.max_age));
        let clause = match filter {
            SessionFilter::All => "1 = 1",
            SessionFilter::Valid => "is_valid = 1 AND last_login > ?1",
            SessionFilter::Invalid => "NOT (is_valid = 1 AND last_login > ?1)",
        };
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE {clause} ORDER BY account_id"
                ))
                .map_err(db_err)?;
            let mapped = match filter {
                SessionFilter::All => statement.query_map([], row_to_session),
                SessionFilter::Valid | SessionFilter::Invalid => {
                    statement.query_map(params![cutoff], row_to_session)
                }
            };
            let rows = mapped
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    /// Aggregates over one read transaction, so totals and the per-bot-type
    /// breakdown describe the same snapshot.
    pub fn stats(&self) -> StoreResult<SessionStats> {
        let now = self.clock.now_unix_ms();
        let cutoff = now.saturating_sub(duration_ms(self.max_age));
        self.read_pool.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let (total, valid, avg_age_hours, oldest, newest) = tx
                .query_row(
                    "SELECT
                        COUNT(*),
                        COALESCE(SUM(CASE WHEN is_valid = 1 AND last_login > ?1 THEN 1 ELSE 0 END), 0),
                        AVG((?2 - last_login) / 3600000.0),
                        MIN(last_login),
                        MAX(last_login)
                     FROM sessions",
                    params![cutoff, now],
                    |row| {
                        let total: i64 = row.get(0)?;
                        let valid: i64 = row.get(1)?;
                        let avg: Option<f64> = row.get(2)?;
                        let oldest: Option<i64> = row.get(3)?;
                        let newest: Option<i64> = row.get(4)?;
                        Ok((total as usize, valid as usize, avg.unwrap_or(0.0), oldest, newest))
                    },
                )
                .map_err(db_err)?;

            let mut by_bot_type = BTreeMap::new();
            {
                let mut statement = tx
                    .prepare("SELECT bot_type, COUNT(*) FROM sessions GROUP BY bot_type")
                    .map_err(db_err)?;
                let rows = statement
                    .query_map([], |row| {
                        let bot_type: String = row.get(0)?;
                        let count: i64 = row.get(1)?;
                        Ok((bot_type, count as usize))
                    })
                    .map_err(db_err)?;
                for row in rows {
                    let (bot_type, count) = row.map_err(db_err)?;
                    by_bot_type.insert(bot_type, count);
                }
            }
            tx.commit().map_err(db_err)?;

            Ok(SessionStats {
                total,
                valid,
                expired: total.saturating_sub(valid),
                avg_age_hours,
                by_bot_type,
                oldest,
                newest,
            })
        })
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(Duration::from_secs(3)).map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| FeedbotError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection, now: i64) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_sessions.sql"))];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        append_run_log(
            "info",
            "session_store.migration.applying",
            json!({ "version": version }),
        );
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }
    Ok(())
}

const SESSION_COLUMNS: &str = "account_id, cookies, local_state, last_login, is_valid, \
     login_count, last_used, bot_type, user_agent, created_at";

fn upsert_session(
    conn: &Connection,
    account_id: &str,
    material: &SessionMaterial,
    bot_type: &str,
    user_agent: Option<&str>,
    now: i64,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sessions (
            account_id, cookies, local_state, last_login, is_valid, login_count,
            last_used, bot_type, user_agent, created_at
         ) VALUES (?1, ?2, ?3, ?4, 1, 1, ?4, ?5, ?6, ?4)
         ON CONFLICT(account_id) DO UPDATE SET
            cookies = excluded.cookies,
            local_state = excluded.local_state,
            last_login = excluded.last_login,
            is_valid = 1,
            login_count = sessions.login_count + 1,
            last_used = excluded.last_used,
            bot_type = excluded.bot_type,
            user_agent = COALESCE(excluded.user_agent, sessions.user_agent)",
        params![
            account_id,
            material.cookies,
            material.local_state,
            now,
            bot_type,
            user_agent
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn fetch_session(conn: &Connection, account_id: &str) -> StoreResult<Option<SessionRecord>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE account_id = ?1"),
        params![account_id],
        row_to_session,
    )
    .optional()
    .map_err(db_err)
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let is_valid: i64 = row.get(4)?;
    Ok(SessionRecord {
        account_id: row.get(0)?,
        material: SessionMaterial {
            cookies: row.get(1)?,
            local_state: row.get(2)?,
        },
        last_login: row.get(3)?,
        is_valid: is_valid != 0,
        metadata: SessionMetadata {
            login_count: row.get(5)?,
            last_used: row.get(6)?,
            bot_type: row.get(7)?,
        },
        user_agent: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn db_err(error: rusqlite::Error) -> FeedbotError {
    FeedbotError::Database(error.to_string())
}
