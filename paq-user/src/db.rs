use std::path::Path;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

pub type Pool = r2d2::Pool<SqliteConnectionManager>;

/// Ordered schema migrations. Never edit an entry in place, append a new
/// one; each runs in its own transaction and is recorded in
/// `schema_migrations`.
const MIGRATIONS: &[&str] = &[
    // 1: initial schema
    r#"
    CREATE TABLE domains (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        dkim_selector TEXT NOT NULL DEFAULT 'mail',
        dkim_private_key TEXT,
        active INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE users (
        id INTEGER PRIMARY KEY,
        domain_id INTEGER NOT NULL REFERENCES domains(id),
        local_part TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        display_name TEXT NOT NULL DEFAULT '',
        quota_bytes INTEGER NOT NULL DEFAULT 0,
        used_bytes INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        UNIQUE (domain_id, local_part)
    );
    CREATE TABLE aliases (
        id INTEGER PRIMARY KEY,
        domain_id INTEGER NOT NULL REFERENCES domains(id),
        local_part TEXT NOT NULL,
        destination_user_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
        destination_address TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        UNIQUE (domain_id, local_part),
        CHECK ((destination_user_id IS NULL) <> (destination_address IS NULL))
    );
    CREATE TABLE mailboxes (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        uidvalidity INTEGER NOT NULL,
        uidnext INTEGER NOT NULL DEFAULT 1,
        special_use TEXT NOT NULL DEFAULT '',
        subscribed INTEGER NOT NULL DEFAULT 1,
        UNIQUE (user_id, name)
    );
    CREATE TABLE messages (
        id INTEGER PRIMARY KEY,
        mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
        uid INTEGER NOT NULL,
        maildir_key TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        internal_date INTEGER NOT NULL,
        flags TEXT NOT NULL DEFAULT '',
        recent INTEGER NOT NULL DEFAULT 0,
        env_message_id TEXT,
        env_subject TEXT,
        env_from TEXT,
        env_to TEXT,
        env_in_reply_to TEXT,
        env_references TEXT,
        UNIQUE (mailbox_id, uid)
    );
    CREATE INDEX idx_messages_mailbox_uid ON messages(mailbox_id, uid);
    CREATE INDEX idx_messages_mailbox_flags ON messages(mailbox_id, flags);
    CREATE TABLE sieve_scripts (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        source TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 0,
        UNIQUE (user_id, name)
    );
    CREATE TABLE vacation_responses (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        sender TEXT NOT NULL,
        last_response INTEGER NOT NULL,
        PRIMARY KEY (user_id, sender)
    );
    "#,
];

#[derive(Clone)]
pub struct Db {
    pool: Pool,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(std::time::Duration::from_millis(5000))
        });
        let pool = r2d2::Pool::builder()
            .max_size(8)
            .build(manager)
            .context("building sqlite connection pool")?;

        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.pool.get()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
            [],
        )?;
        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            let version = (idx + 1) as i64;
            if version <= current {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)
                .with_context(|| format!("applying migration {}", version))?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, strftime('%s','now'))",
                [version],
            )?;
            tx.commit()?;
            tracing::info!(version, "applied schema migration");
        }
        Ok(())
    }

    /// Run a blocking closure against a pooled connection on the
    /// blocking thread pool. Dropping the returned future cancels the
    /// wait, not the statement; statements here are short.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("checking out sqlite connection")?;
            f(&mut conn)
        })
        .await
        .context("sqlite task join error")?
    }

    /// Synchronous variant for startup paths and tests.
    pub fn call_sync<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.pool.get().context("checking out sqlite connection")?;
        f(&mut conn)
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
