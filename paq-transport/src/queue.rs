//! The durable outbound queue.
//!
//! Logically this is a scored pending set, a processing set and two
//! TTL'd archives keyed by message id, with bodies spooled as files.
//! It is realized as a single SQLite table with a status column and an
//! index on the next-attempt score; the spool files referenced by
//! `message_path` belong to the delivery engine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rand::Rng;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;

pub const MAX_ATTEMPTS: u32 = 15;
pub const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);
const SENT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const FAILED_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const CLOSE_GRACE: Duration = Duration::from_secs(30);

/// Attempt count → base delay before the next try.
const RETRY_SCHEDULE: [Duration; 9] = [
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 3600),
    Duration::from_secs(4 * 3600),
    Duration::from_secs(8 * 3600),
    Duration::from_secs(16 * 3600),
    Duration::from_secs(24 * 3600),
];

pub fn retry_delay(attempts: u32) -> Duration {
    let idx = attempts.clamp(1, RETRY_SCHEDULE.len() as u32) as usize - 1;
    RETRY_SCHEDULE[idx]
}

/// Base delay with ±10 % jitter so retries from one outage spread out.
pub fn retry_delay_jittered(attempts: u32) -> Duration {
    let base = retry_delay(attempts).as_secs_f64();
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(base * factor)
}

/// `<unix-nano>-<12 random bytes, hex>`
pub fn gen_message_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill(&mut bytes);
    format!("{}-{}", now_nanos(), hex::encode(bytes))
}

pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Pending,
    Sending,
    Sent,
    Failed,
    Deferred,
    Bounced,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Sending => "sending",
            Status::Sent => "sent",
            Status::Failed => "failed",
            Status::Deferred => "deferred",
            Status::Bounced => "bounced",
        }
    }

    fn from_str(s: &str) -> Status {
        match s {
            "pending" => Status::Pending,
            "sending" => Status::Sending,
            "sent" => Status::Sent,
            "failed" => Status::Failed,
            "deferred" => Status::Deferred,
            _ => Status::Bounced,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub id: String,
    pub sender: String,
    /// All recipients share `domain`.
    pub recipients: Vec<String>,
    pub domain: String,
    pub message_path: PathBuf,
    pub size: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Nanosecond timestamps; `next_attempt` is the pending-set score.
    pub last_attempt: Option<i64>,
    pub next_attempt: i64,
    pub last_error: Option<String>,
    pub status: Status,
    pub created_at: i64,
}

impl QueuedMessage {
    pub fn new(sender: &str, recipients: Vec<String>, domain: &str, path: PathBuf, size: i64) -> Self {
        Self {
            id: gen_message_id(),
            sender: sender.to_string(),
            recipients,
            domain: domain.to_string(),
            message_path: path,
            size,
            attempts: 0,
            max_attempts: MAX_ATTEMPTS,
            last_attempt: None,
            next_attempt: now_nanos(),
            last_error: None,
            status: Status::Pending,
            created_at: now_nanos(),
        }
    }
}

#[derive(Debug)]
pub enum RetryDecision {
    /// Back in the pending set, next attempt at this score.
    Deferred { next_attempt: i64 },
    /// Attempts or age exhausted; archived as failed.
    Failed,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("no such queue entry {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub sending: u64,
    pub deferred: u64,
    pub sent: u64,
    pub failed: u64,
    pub bounced: u64,
}

pub struct Queue {
    pool: r2d2::Pool<SqliteConnectionManager>,
    closed: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl Queue {
    pub fn open(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(std::time::Duration::from_millis(5000))
        });
        let pool = r2d2::Pool::builder()
            .max_size(8)
            .build(manager)
            .context("building queue connection pool")?;
        {
            let conn = pool.get()?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS queue_messages (
                    id TEXT PRIMARY KEY,
                    sender TEXT NOT NULL,
                    recipients TEXT NOT NULL,
                    domain TEXT NOT NULL,
                    message_path TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    last_attempt INTEGER,
                    next_attempt INTEGER NOT NULL,
                    last_error TEXT,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    archived_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_queue_ready
                    ON queue_messages(status, next_attempt);",
            )?;
        }
        Ok(Self {
            pool,
            closed: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    async fn call<F, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let pool = self.pool.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);
        let result = tokio::task::spawn_blocking(move || {
            let out = (|| {
                let mut conn = pool
                    .get()
                    .context("checking out queue connection")
                    .map_err(QueueError::Internal)?;
                f(&mut conn)
            })();
            out
        })
        .await
        .map_err(|e| QueueError::Internal(anyhow::anyhow!("queue task join error: {}", e)));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result?
    }

    /// Atomically records the message and adds it to the pending set.
    pub async fn enqueue(&self, msg: QueuedMessage) -> Result<(), QueueError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO queue_messages
                 (id, sender, recipients, domain, message_path, size, attempts, max_attempts,
                  last_attempt, next_attempt, last_error, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    msg.id,
                    msg.sender,
                    msg.recipients.join("\n"),
                    msg.domain,
                    msg.message_path.to_string_lossy(),
                    msg.size,
                    msg.attempts,
                    msg.max_attempts,
                    msg.last_attempt,
                    msg.next_attempt,
                    msg.last_error,
                    Status::Pending.as_str(),
                    msg.created_at,
                ],
            )
            .context("inserting queue entry")
            .map_err(QueueError::Internal)?;
            Ok(())
        })
        .await
    }

    /// Pops the smallest-score ready entry, moves it to the processing
    /// set and counts the attempt. `None` when nothing is ready.
    pub async fn dequeue(&self) -> Result<Option<QueuedMessage>, QueueError> {
        self.call(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("queue tx")
                .map_err(QueueError::Internal)?;
            let now = now_nanos();
            let row = tx
                .query_row(
                    &format!(
                        "{} WHERE status IN ('pending', 'deferred') AND next_attempt <= ?1
                         ORDER BY next_attempt LIMIT 1",
                        SELECT
                    ),
                    params![now],
                    row_to_message,
                )
                .optional()
                .context("selecting ready entry")
                .map_err(QueueError::Internal)?;
            let mut msg = match row {
                Some(m) => m,
                None => return Ok(None),
            };
            tx.execute(
                "UPDATE queue_messages
                 SET status = 'sending', attempts = attempts + 1, last_attempt = ?2
                 WHERE id = ?1",
                params![msg.id, now],
            )
            .context("claiming entry")
            .map_err(QueueError::Internal)?;
            tx.commit().context("queue commit").map_err(QueueError::Internal)?;
            msg.status = Status::Sending;
            msg.attempts += 1;
            msg.last_attempt = Some(now);
            Ok(Some(msg))
        })
        .await
    }

    /// Delivery succeeded: archive into the sent set.
    pub async fn complete(&self, id: &str) -> Result<(), QueueError> {
        let id = id.to_string();
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE queue_messages SET status = 'sent', archived_at = ?2 WHERE id = ?1",
                    params![id, now_nanos()],
                )
                .context("completing entry")
                .map_err(QueueError::Internal)?;
            if changed == 0 {
                return Err(QueueError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    /// Schedules the next attempt, or fails the entry once attempts or
    /// age run out.
    pub async fn retry(&self, id: &str, error: &str) -> Result<RetryDecision, QueueError> {
        let id = id.to_string();
        let error = error.to_string();
        self.call(move |conn| {
            let msg = conn
                .query_row(&format!("{} WHERE id = ?1", SELECT), params![id], row_to_message)
                .optional()
                .context("loading entry")
                .map_err(QueueError::Internal)?
                .ok_or_else(|| QueueError::NotFound(id.clone()))?;

            let age = now_nanos().saturating_sub(msg.created_at);
            if msg.attempts >= msg.max_attempts || age > MAX_AGE.as_nanos() as i64 {
                conn.execute(
                    "UPDATE queue_messages
                     SET status = 'failed', last_error = ?2, archived_at = ?3
                     WHERE id = ?1",
                    params![id, error, now_nanos()],
                )
                .context("failing exhausted entry")
                .map_err(QueueError::Internal)?;
                return Ok(RetryDecision::Failed);
            }

            let next = now_nanos() + retry_delay_jittered(msg.attempts).as_nanos() as i64;
            conn.execute(
                "UPDATE queue_messages
                 SET status = 'deferred', last_error = ?2, next_attempt = ?3
                 WHERE id = ?1",
                params![id, error, next],
            )
            .context("deferring entry")
            .map_err(QueueError::Internal)?;
            Ok(RetryDecision::Deferred { next_attempt: next })
        })
        .await
    }

    /// Permanent failure: archive into the failed set (`bounced` when a
    /// bounce message was generated for it).
    pub async fn fail(&self, id: &str, reason: &str, bounced: bool) -> Result<(), QueueError> {
        let id = id.to_string();
        let reason = reason.to_string();
        let status = if bounced { Status::Bounced } else { Status::Failed };
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE queue_messages
                     SET status = ?2, last_error = ?3, archived_at = ?4
                     WHERE id = ?1",
                    params![id, status.as_str(), reason, now_nanos()],
                )
                .context("failing entry")
                .map_err(QueueError::Internal)?;
            if changed == 0 {
                return Err(QueueError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    /// Entries stuck in processing longer than `threshold` go back to
    /// pending with an immediate score; a crashed worker loses nothing.
    pub async fn recover_stale(&self, threshold: Duration) -> Result<usize, QueueError> {
        self.call(move |conn| {
            let cutoff = now_nanos() - threshold.as_nanos() as i64;
            let changed = conn
                .execute(
                    "UPDATE queue_messages
                     SET status = 'pending', next_attempt = ?1,
                         last_error = 'recovered stale processing entry'
                     WHERE status = 'sending' AND last_attempt < ?2",
                    params![now_nanos(), cutoff],
                )
                .context("recovering stale entries")
                .map_err(QueueError::Internal)?;
            Ok(changed)
        })
        .await
    }

    /// Drops archived entries past their TTL (sent 7 d, failed 30 d).
    pub async fn purge_expired(&self) -> Result<usize, QueueError> {
        self.call(move |conn| {
            let now = now_nanos();
            let sent_cutoff = now - SENT_TTL.as_nanos() as i64;
            let failed_cutoff = now - FAILED_TTL.as_nanos() as i64;
            let a = conn
                .execute(
                    "DELETE FROM queue_messages
                     WHERE status = 'sent' AND archived_at < ?1",
                    params![sent_cutoff],
                )
                .context("purging sent archive")
                .map_err(QueueError::Internal)?;
            let b = conn
                .execute(
                    "DELETE FROM queue_messages
                     WHERE status IN ('failed', 'bounced') AND archived_at < ?1",
                    params![failed_cutoff],
                )
                .context("purging failed archive")
                .map_err(QueueError::Internal)?;
            Ok(a + b)
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueuedMessage>, QueueError> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.query_row(&format!("{} WHERE id = ?1", SELECT), params![id], row_to_message)
                .optional()
                .context("loading entry")
                .map_err(QueueError::Internal)
        })
        .await
    }

    /// Queue inspection for the admin surface.
    pub async fn list(&self, limit: usize) -> Result<Vec<QueuedMessage>, QueueError> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!("{} ORDER BY next_attempt LIMIT ?1", SELECT))
                .context("preparing list")
                .map_err(QueueError::Internal)?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_message)
                .context("listing entries")
                .map_err(QueueError::Internal)?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("listing entries")
                .map_err(QueueError::Internal)
        })
        .await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.call(move |conn| {
            let mut stats = QueueStats::default();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM queue_messages GROUP BY status")
                .context("preparing stats")
                .map_err(QueueError::Internal)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))
                .context("collecting stats")
                .map_err(QueueError::Internal)?;
            for row in rows {
                let (status, count) = row.context("stats row").map_err(QueueError::Internal)?;
                match Status::from_str(&status) {
                    Status::Pending => stats.pending = count,
                    Status::Sending => stats.sending = count,
                    Status::Deferred => stats.deferred = count,
                    Status::Sent => stats.sent = count,
                    Status::Failed => stats.failed = count,
                    Status::Bounced => stats.bounced = count,
                }
            }
            Ok(stats)
        })
        .await
    }

    /// Simulates a crashed worker by backdating a processing entry.
    #[cfg(test)]
    pub(crate) async fn set_last_attempt(&self, id: &str, timestamp: i64) -> Result<(), QueueError> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE queue_messages SET last_attempt = ?2 WHERE id = ?1",
                params![id, timestamp],
            )
            .context("backdating entry")
            .map_err(QueueError::Internal)?;
            Ok(())
        })
        .await
    }

    /// Makes a deferred entry immediately ready.
    #[cfg(test)]
    pub(crate) async fn make_ready(&self, id: &str) -> Result<(), QueueError> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE queue_messages SET next_attempt = 0 WHERE id = ?1",
                params![id],
            )
            .context("rescheduling entry")
            .map_err(QueueError::Internal)?;
            Ok(())
        })
        .await
    }

    /// Rejects new operations, then waits for in-flight ones (bounded).
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + CLOSE_GRACE;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("queue close grace expired with operations in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

const SELECT: &str = "SELECT id, sender, recipients, domain, message_path, size, attempts,
        max_attempts, last_attempt, next_attempt, last_error, status, created_at
 FROM queue_messages";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let recipients: String = row.get(2)?;
    let path: String = row.get(4)?;
    let status: String = row.get(11)?;
    Ok(QueuedMessage {
        id: row.get(0)?,
        sender: row.get(1)?,
        recipients: recipients.split('\n').map(str::to_string).collect(),
        domain: row.get(3)?,
        message_path: PathBuf::from(path),
        size: row.get(5)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        last_attempt: row.get(8)?,
        next_attempt: row.get(9)?,
        last_error: row.get(10)?,
        status: Status::from_str(&status),
        created_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue(name: &str) -> Queue {
        let path = std::env::temp_dir().join(format!(
            "paq-queue-test-{}-{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        Queue::open(&path).unwrap()
    }

    fn entry(domain: &str) -> QueuedMessage {
        QueuedMessage::new(
            "alice@example.com",
            vec![format!("user@{}", domain)],
            domain,
            PathBuf::from("/tmp/never-read.eml"),
            42,
        )
    }

    #[test]
    fn backoff_schedule_is_monotonic() {
        for k in 1..RETRY_SCHEDULE.len() as u32 {
            assert!(retry_delay(k + 1) >= retry_delay(k), "step {}", k);
        }
        assert_eq!(retry_delay(1), Duration::from_secs(300));
        assert_eq!(retry_delay(9), Duration::from_secs(24 * 3600));
        assert_eq!(retry_delay(14), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let d = retry_delay_jittered(1).as_secs_f64();
            assert!((270.0..=330.0).contains(&d), "jittered delay {}", d);
        }
    }

    #[test]
    fn message_id_format() {
        let id = gen_message_id();
        let (nanos, rnd) = id.split_once('-').unwrap();
        assert!(nanos.parse::<i64>().is_ok());
        assert_eq!(rnd.len(), 24);
    }

    #[tokio::test]
    async fn enqueue_dequeue_complete() {
        let queue = test_queue("edc");
        let msg = entry("other.test");
        let id = msg.id.clone();
        queue.enqueue(msg).await.unwrap();

        let claimed = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, Status::Sending);

        // nothing else is ready
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.complete(&id).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.sending, 0);
    }

    #[tokio::test]
    async fn retry_defers_then_fails_when_exhausted() {
        let queue = test_queue("retry");
        let mut msg = entry("other.test");
        msg.max_attempts = 2;
        let id = msg.id.clone();
        queue.enqueue(msg).await.unwrap();

        queue.dequeue().await.unwrap().unwrap();
        match queue.retry(&id, "connection refused").await.unwrap() {
            RetryDecision::Deferred { next_attempt } => {
                assert!(next_attempt > now_nanos());
            }
            other => panic!("expected deferral, got {:?}", other),
        }
        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Deferred);
        assert_eq!(stored.last_error.as_deref(), Some("connection refused"));

        // not ready yet: the deferred score is minutes away
        assert!(queue.dequeue().await.unwrap().is_none());

        // second attempt exhausts max_attempts
        queue.make_ready(&id).await.unwrap();
        let claimed = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
        match queue.retry(&claimed.id, "still down").await.unwrap() {
            RetryDecision::Failed => {}
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(queue.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn stale_entries_are_recovered() {
        let queue = test_queue("stale");
        let msg = entry("other.test");
        let id = msg.id.clone();
        queue.enqueue(msg).await.unwrap();
        let claimed = queue.dequeue().await.unwrap().unwrap();

        // simulate a crashed worker: last_attempt 15 minutes ago
        let stale_ts = now_nanos() - Duration::from_secs(15 * 60).as_nanos() as i64;
        queue.set_last_attempt(&claimed.id, stale_ts).await.unwrap();

        let recovered = queue.recover_stale(Duration::from_secs(600)).await.unwrap();
        assert_eq!(recovered, 1);
        let entry = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, Status::Pending);
        assert!(entry.next_attempt <= now_nanos());
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn close_rejects_new_operations() {
        let queue = test_queue("close");
        queue.close().await;
        assert!(matches!(
            queue.enqueue(entry("other.test")).await,
            Err(QueueError::Closed)
        ));
    }
}
