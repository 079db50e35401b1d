//! Typed access to the metadata index. No SQL leaves this module.

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::address::Address;
use crate::db::{now_millis, Db};
use crate::model::*;

pub const INBOX: &str = "INBOX";

/// Mailboxes every account starts with, besides INBOX.
pub const DEFAULT_MAILBOXES: &[(&str, &str)] = &[
    ("Drafts", SPECIAL_USE_DRAFTS),
    ("Sent", SPECIAL_USE_SENT),
    ("Trash", SPECIAL_USE_TRASH),
    ("Junk", SPECIAL_USE_JUNK),
    ("Archive", SPECIAL_USE_ARCHIVE),
];

#[derive(Clone)]
pub struct Directory {
    db: Db,
}

impl Directory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    // ---- Domains ----

    pub async fn create_domain(
        &self,
        name: &str,
        dkim_selector: &str,
        dkim_private_key: Option<String>,
    ) -> Result<Domain> {
        let name = name.to_lowercase();
        let selector = dkim_selector.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO domains (name, dkim_selector, dkim_private_key) VALUES (?1, ?2, ?3)",
                    params![name, selector, dkim_private_key],
                )?;
                let id = conn.last_insert_rowid();
                get_domain_by_id(conn, id)
            })
            .await
    }

    pub async fn domain_by_name(&self, name: &str) -> Result<Option<Domain>> {
        let name = name.to_lowercase();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, name, dkim_selector, dkim_private_key, active
                     FROM domains WHERE name = ?1",
                    params![name],
                    row_to_domain,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn list_domains(&self) -> Result<Vec<Domain>> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, dkim_selector, dkim_private_key, active
                     FROM domains ORDER BY name",
                )?;
                let rows = stmt.query_map([], row_to_domain)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }

    /// Domains are only deleted once empty; message data has no other
    /// path out of the cascade.
    pub async fn delete_domain(&self, id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                let users: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE domain_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                if users > 0 {
                    bail!("domain still has {} users", users);
                }
                conn.execute("DELETE FROM aliases WHERE domain_id = ?1", params![id])?;
                conn.execute("DELETE FROM domains WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
    }

    /// True when the domain is served here and accepting mail.
    pub async fn is_local_domain(&self, name: &str) -> Result<bool> {
        Ok(self
            .domain_by_name(name)
            .await?
            .map(|d| d.active)
            .unwrap_or(false))
    }

    // ---- Users ----

    /// Creates the user together with INBOX and the special-use
    /// mailboxes, in one transaction.
    pub async fn create_user(
        &self,
        domain_id: i64,
        local_part: &str,
        password_hash: &str,
        display_name: &str,
        quota_bytes: i64,
    ) -> Result<User> {
        let local = local_part.to_lowercase();
        let hash = password_hash.to_string();
        let display = display_name.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO users (domain_id, local_part, password_hash, display_name, quota_bytes)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![domain_id, local, hash, display, quota_bytes],
                )?;
                let user_id = tx.last_insert_rowid();

                let uidvalidity = uidvalidity_now();
                tx.execute(
                    "INSERT INTO mailboxes (user_id, name, uidvalidity, special_use)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![user_id, INBOX, uidvalidity, SPECIAL_USE_NONE],
                )?;
                for (name, special) in DEFAULT_MAILBOXES {
                    tx.execute(
                        "INSERT INTO mailboxes (user_id, name, uidvalidity, special_use)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![user_id, name, uidvalidity, special],
                    )?;
                }
                tx.commit()?;
                get_user_by_id(conn, user_id)
            })
            .await
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        self.db
            .call(move |conn| {
                conn.query_row(USER_SELECT_BY_ID, params![id], row_to_user)
                    .optional()
                    .map_err(Into::into)
            })
            .await
    }

    pub async fn user_by_address(&self, address: &Address) -> Result<Option<User>> {
        let local = address.local.clone();
        let domain = address.domain.clone();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("{} WHERE u.local_part = ?1 AND d.name = ?2", USER_SELECT),
                    params![local, domain],
                    row_to_user,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn list_users(&self, domain_id: i64) -> Result<Vec<User>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE u.domain_id = ?1 ORDER BY u.local_part",
                    USER_SELECT
                ))?;
                let rows = stmt.query_map(params![domain_id], row_to_user)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }

    pub async fn set_user_password(&self, user_id: i64, password_hash: &str) -> Result<()> {
        let hash = password_hash.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET password_hash = ?2 WHERE id = ?1",
                    params![user_id, hash],
                )?;
                Ok(())
            })
            .await
    }

    /// Removes index rows; the caller owns the on-disk cleanup.
    pub async fn delete_user(&self, user_id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
                Ok(())
            })
            .await
    }

    pub async fn add_used_bytes(&self, user_id: i64, delta: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET used_bytes = MAX(0, used_bytes + ?2) WHERE id = ?1",
                    params![user_id, delta],
                )?;
                Ok(())
            })
            .await
    }

    /// Re-derives `used_bytes` from the stored message sizes.
    pub async fn recompute_used_bytes(&self, user_id: i64) -> Result<i64> {
        self.db
            .call(move |conn| {
                let used: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(m.size_bytes), 0)
                     FROM messages m JOIN mailboxes b ON m.mailbox_id = b.id
                     WHERE b.user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "UPDATE users SET used_bytes = ?2 WHERE id = ?1",
                    params![user_id, used],
                )?;
                Ok(used)
            })
            .await
    }

    // ---- Aliases ----

    pub async fn create_alias(
        &self,
        domain_id: i64,
        local_part: &str,
        target: AliasTarget,
    ) -> Result<()> {
        let local = local_part.to_lowercase();
        self.db
            .call(move |conn| {
                let (user_id, external) = match &target {
                    AliasTarget::User(id) => (Some(*id), None),
                    AliasTarget::External(addr) => (None, Some(addr.to_lowercase())),
                };
                conn.execute(
                    "INSERT INTO aliases (domain_id, local_part, destination_user_id, destination_address)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![domain_id, local, user_id, external],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn resolve_alias(&self, address: &Address) -> Result<Option<AliasTarget>> {
        let local = address.local.clone();
        let domain = address.domain.clone();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT a.destination_user_id, a.destination_address
                     FROM aliases a JOIN domains d ON a.domain_id = d.id
                     WHERE a.local_part = ?1 AND d.name = ?2
                       AND a.active = 1 AND d.active = 1",
                    params![local, domain],
                    |row| {
                        let user: Option<i64> = row.get(0)?;
                        let ext: Option<String> = row.get(1)?;
                        Ok(match (user, ext) {
                            (Some(id), _) => AliasTarget::User(id),
                            (None, Some(addr)) => AliasTarget::External(addr),
                            (None, None) => unreachable!("checked by schema"),
                        })
                    },
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    // ---- Mailboxes ----

    pub async fn create_mailbox(
        &self,
        user_id: i64,
        name: &str,
        special_use: &str,
    ) -> Result<MailboxRow> {
        let name = name.to_string();
        let special = special_use.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO mailboxes (user_id, name, uidvalidity, special_use)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![user_id, name, uidvalidity_now(), special],
                )?;
                get_mailbox_by_id(conn, conn.last_insert_rowid())
            })
            .await
    }

    pub async fn mailbox_by_name(&self, user_id: i64, name: &str) -> Result<Option<MailboxRow>> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, name, uidvalidity, uidnext, special_use, subscribed
                     FROM mailboxes WHERE user_id = ?1 AND name = ?2",
                    params![user_id, name],
                    row_to_mailbox,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn mailbox_by_id(&self, id: i64) -> Result<Option<MailboxRow>> {
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, name, uidvalidity, uidnext, special_use, subscribed
                     FROM mailboxes WHERE id = ?1",
                    params![id],
                    row_to_mailbox,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn mailbox_with_special_use(
        &self,
        user_id: i64,
        special_use: &str,
    ) -> Result<Option<MailboxRow>> {
        let special = special_use.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, name, uidvalidity, uidnext, special_use, subscribed
                     FROM mailboxes WHERE user_id = ?1 AND special_use = ?2",
                    params![user_id, special],
                    row_to_mailbox,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn list_mailboxes(&self, user_id: i64) -> Result<Vec<MailboxRow>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, name, uidvalidity, uidnext, special_use, subscribed
                     FROM mailboxes WHERE user_id = ?1 ORDER BY name",
                )?;
                let rows = stmt.query_map(params![user_id], row_to_mailbox)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }

    pub async fn rename_mailbox(&self, user_id: i64, from: &str, to: &str) -> Result<MailboxRow> {
        let from = from.to_string();
        let to = to.to_string();
        self.db
            .call(move |conn| {
                if from == INBOX || to == INBOX {
                    bail!("INBOX cannot be renamed");
                }
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM mailboxes WHERE user_id = ?1 AND name = ?2",
                        params![user_id, to],
                        |row| row.get(0),
                    )
                    .optional()?;
                if existing.is_some() {
                    bail!("mailbox {} already exists", to);
                }
                let changed = conn.execute(
                    "UPDATE mailboxes SET name = ?3 WHERE user_id = ?1 AND name = ?2",
                    params![user_id, from, to],
                )?;
                if changed == 0 {
                    bail!("mailbox {} does not exist", from);
                }
                conn.query_row(
                    "SELECT id, user_id, name, uidvalidity, uidnext, special_use, subscribed
                     FROM mailboxes WHERE user_id = ?1 AND name = ?2",
                    params![user_id, to],
                    row_to_mailbox,
                )
                .map_err(Into::into)
            })
            .await
    }

    /// Deletes the mailbox row; message rows go with it (cascade) and
    /// the caller removes the Maildir directory. Returns the total size
    /// of the removed messages so quota accounting can follow.
    pub async fn delete_mailbox(&self, user_id: i64, name: &str) -> Result<(MailboxRow, i64)> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                if name == INBOX {
                    bail!("INBOX cannot be deleted");
                }
                let mbx = conn
                    .query_row(
                        "SELECT id, user_id, name, uidvalidity, uidnext, special_use, subscribed
                         FROM mailboxes WHERE user_id = ?1 AND name = ?2",
                        params![user_id, name],
                        row_to_mailbox,
                    )
                    .optional()?
                    .ok_or_else(|| anyhow!("mailbox {} does not exist", name))?;
                let size: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(size_bytes), 0) FROM messages WHERE mailbox_id = ?1",
                    params![mbx.id],
                    |row| row.get(0),
                )?;
                conn.execute("DELETE FROM mailboxes WHERE id = ?1", params![mbx.id])?;
                Ok((mbx, size))
            })
            .await
    }

    pub async fn set_subscribed(&self, user_id: i64, name: &str, subscribed: bool) -> Result<()> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE mailboxes SET subscribed = ?3 WHERE user_id = ?1 AND name = ?2",
                    params![user_id, name, subscribed],
                )?;
                if changed == 0 {
                    bail!("mailbox {} does not exist", name);
                }
                Ok(())
            })
            .await
    }

    /// Allocates the next UID. UIDNEXT is only ever incremented; the
    /// per-mailbox lock in the store additionally serializes callers so
    /// UIDs come out in append order.
    pub async fn allocate_uid(&self, mailbox_id: i64) -> Result<(u32, u32)> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let (uidvalidity, uidnext): (u32, u32) = tx.query_row(
                    "SELECT uidvalidity, uidnext FROM mailboxes WHERE id = ?1",
                    params![mailbox_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                tx.execute(
                    "UPDATE mailboxes SET uidnext = uidnext + 1 WHERE id = ?1",
                    params![mailbox_id],
                )?;
                tx.commit()?;
                Ok((uidvalidity, uidnext))
            })
            .await
    }

    // ---- Messages ----

    pub async fn insert_message(&self, msg: MessageRow) -> Result<i64> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages (mailbox_id, uid, maildir_key, size_bytes, internal_date,
                                           flags, recent, env_message_id, env_subject, env_from,
                                           env_to, env_in_reply_to, env_references)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        msg.mailbox_id,
                        msg.uid,
                        msg.maildir_key,
                        msg.size_bytes,
                        msg.internal_date,
                        msg.flags,
                        msg.recent,
                        msg.envelope.message_id,
                        msg.envelope.subject,
                        msg.envelope.from,
                        msg.envelope.to,
                        msg.envelope.in_reply_to,
                        msg.envelope.references,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn messages_in_mailbox(&self, mailbox_id: i64) -> Result<Vec<MessageRow>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE mailbox_id = ?1 ORDER BY uid",
                    MESSAGE_SELECT
                ))?;
                let rows = stmt.query_map(params![mailbox_id], row_to_message)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }

    pub async fn message_by_uid(&self, mailbox_id: i64, uid: u32) -> Result<Option<MessageRow>> {
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("{} WHERE mailbox_id = ?1 AND uid = ?2", MESSAGE_SELECT),
                    params![mailbox_id, uid],
                    row_to_message,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn update_message_flags(
        &self,
        message_id: i64,
        flags: &str,
        recent: bool,
        maildir_key: &str,
    ) -> Result<()> {
        let flags = flags.to_string();
        let key = maildir_key.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE messages SET flags = ?2, recent = ?3, maildir_key = ?4 WHERE id = ?1",
                    params![message_id, flags, recent, key],
                )?;
                Ok(())
            })
            .await
    }

    /// \Recent is consumed by the first session that selects the
    /// mailbox read-write.
    pub async fn clear_recent(&self, mailbox_id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE messages SET recent = 0 WHERE mailbox_id = ?1",
                    params![mailbox_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete_message(&self, message_id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
                Ok(())
            })
            .await
    }

    // ---- Sieve scripts ----

    pub async fn active_sieve_script(&self, user_id: i64) -> Result<Option<SieveScript>> {
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, name, source, active FROM sieve_scripts
                     WHERE user_id = ?1 AND active = 1",
                    params![user_id],
                    row_to_sieve,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn upsert_sieve_script(&self, user_id: i64, name: &str, source: &str) -> Result<()> {
        let name = name.to_string();
        let source = source.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sieve_scripts (user_id, name, source) VALUES (?1, ?2, ?3)
                     ON CONFLICT (user_id, name) DO UPDATE SET source = excluded.source",
                    params![user_id, name, source],
                )?;
                Ok(())
            })
            .await
    }

    /// At most one script per user is active; activation swaps
    /// atomically.
    pub async fn activate_sieve_script(&self, user_id: i64, name: &str) -> Result<()> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE sieve_scripts SET active = 0 WHERE user_id = ?1",
                    params![user_id],
                )?;
                let changed = tx.execute(
                    "UPDATE sieve_scripts SET active = 1 WHERE user_id = ?1 AND name = ?2",
                    params![user_id, name],
                )?;
                if changed == 0 {
                    bail!("sieve script {} does not exist", name);
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn deactivate_sieve_scripts(&self, user_id: i64) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE sieve_scripts SET active = 0 WHERE user_id = ?1",
                    params![user_id],
                )?;
                Ok(())
            })
            .await
    }

    // ---- Vacation responses ----

    /// Returns true when no auto-response went to `sender` within
    /// `period_days`, and records the response in the same transaction.
    pub async fn vacation_try_record(
        &self,
        user_id: i64,
        sender: &str,
        period_days: u32,
    ) -> Result<bool> {
        let sender = sender.to_lowercase();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = now_millis();
                let cutoff = now - (period_days as i64) * 24 * 3600 * 1000;
                let last: Option<i64> = tx
                    .query_row(
                        "SELECT last_response FROM vacation_responses
                         WHERE user_id = ?1 AND sender = ?2",
                        params![user_id, sender],
                        |row| row.get(0),
                    )
                    .optional()?;
                if matches!(last, Some(ts) if ts > cutoff) {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT INTO vacation_responses (user_id, sender, last_response)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (user_id, sender) DO UPDATE SET last_response = excluded.last_response",
                    params![user_id, sender, now],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await
    }
}

// ---- row mapping ----

const USER_SELECT: &str = "SELECT u.id, u.domain_id, u.local_part, d.name, u.password_hash,
        u.display_name, u.quota_bytes, u.used_bytes, u.active
 FROM users u JOIN domains d ON u.domain_id = d.id";

const USER_SELECT_BY_ID: &str = "SELECT u.id, u.domain_id, u.local_part, d.name, u.password_hash,
        u.display_name, u.quota_bytes, u.used_bytes, u.active
 FROM users u JOIN domains d ON u.domain_id = d.id WHERE u.id = ?1";

const MESSAGE_SELECT: &str = "SELECT id, mailbox_id, uid, maildir_key, size_bytes, internal_date,
        flags, recent, env_message_id, env_subject, env_from, env_to,
        env_in_reply_to, env_references
 FROM messages";

fn row_to_domain(row: &Row<'_>) -> rusqlite::Result<Domain> {
    Ok(Domain {
        id: row.get(0)?,
        name: row.get(1)?,
        dkim_selector: row.get(2)?,
        dkim_private_key: row.get(3)?,
        active: row.get(4)?,
    })
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        local_part: row.get(2)?,
        domain_name: row.get(3)?,
        password_hash: row.get(4)?,
        display_name: row.get(5)?,
        quota_bytes: row.get(6)?,
        used_bytes: row.get(7)?,
        active: row.get(8)?,
    })
}

fn row_to_mailbox(row: &Row<'_>) -> rusqlite::Result<MailboxRow> {
    Ok(MailboxRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        uidvalidity: row.get(3)?,
        uidnext: row.get(4)?,
        special_use: row.get(5)?,
        subscribed: row.get(6)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        mailbox_id: row.get(1)?,
        uid: row.get(2)?,
        maildir_key: row.get(3)?,
        size_bytes: row.get(4)?,
        internal_date: row.get(5)?,
        flags: row.get(6)?,
        recent: row.get(7)?,
        envelope: EnvelopeCache {
            message_id: row.get(8)?,
            subject: row.get(9)?,
            from: row.get(10)?,
            to: row.get(11)?,
            in_reply_to: row.get(12)?,
            references: row.get(13)?,
        },
    })
}

fn row_to_sieve(row: &Row<'_>) -> rusqlite::Result<SieveScript> {
    Ok(SieveScript {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        source: row.get(3)?,
        active: row.get(4)?,
    })
}

fn get_domain_by_id(conn: &Connection, id: i64) -> Result<Domain> {
    conn.query_row(
        "SELECT id, name, dkim_selector, dkim_private_key, active FROM domains WHERE id = ?1",
        params![id],
        row_to_domain,
    )
    .context("domain row just inserted")
}

fn get_user_by_id(conn: &Connection, id: i64) -> Result<User> {
    conn.query_row(USER_SELECT_BY_ID, params![id], row_to_user)
        .context("user row just inserted")
}

fn get_mailbox_by_id(conn: &Connection, id: i64) -> Result<MailboxRow> {
    conn.query_row(
        "SELECT id, user_id, name, uidvalidity, uidnext, special_use, subscribed
         FROM mailboxes WHERE id = ?1",
        params![id],
        row_to_mailbox,
    )
    .context("mailbox row just inserted")
}

fn uidvalidity_now() -> u32 {
    // Epoch seconds: strictly greater on any later re-creation of a
    // mailbox with the same name.
    chrono::Utc::now().timestamp() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn test_db(name: &str) -> Db {
        let path = std::env::temp_dir().join(format!(
            "paq-user-test-{}-{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        Db::open(&path).unwrap()
    }

    #[tokio::test]
    async fn user_creation_provisions_mailboxes() {
        let dir = Directory::new(test_db("provision"));
        let domain = dir.create_domain("example.com", "mail", None).await.unwrap();
        let user = dir
            .create_user(domain.id, "Alice", "$argon2id$fake", "Alice", 0)
            .await
            .unwrap();
        assert_eq!(user.local_part, "alice");

        let mailboxes = dir.list_mailboxes(user.id).await.unwrap();
        let names: Vec<_> = mailboxes.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"INBOX"));
        assert!(names.contains(&"Sent"));
        assert_eq!(mailboxes.len(), 1 + DEFAULT_MAILBOXES.len());

        let sent = dir
            .mailbox_with_special_use(user.id, SPECIAL_USE_SENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.name, "Sent");
    }

    #[tokio::test]
    async fn uid_allocation_is_monotonic() {
        let dir = Directory::new(test_db("uids"));
        let domain = dir.create_domain("example.com", "mail", None).await.unwrap();
        let user = dir
            .create_user(domain.id, "bob", "$argon2id$fake", "", 0)
            .await
            .unwrap();
        let inbox = dir.mailbox_by_name(user.id, INBOX).await.unwrap().unwrap();

        let mut last = 0;
        for _ in 0..10 {
            let (_validity, uid) = dir.allocate_uid(inbox.id).await.unwrap();
            assert!(uid > last);
            last = uid;
        }
        let reloaded = dir.mailbox_by_id(inbox.id).await.unwrap().unwrap();
        assert_eq!(reloaded.uidnext, last + 1);
    }

    #[tokio::test]
    async fn inbox_is_protected() {
        let dir = Directory::new(test_db("inbox"));
        let domain = dir.create_domain("example.com", "mail", None).await.unwrap();
        let user = dir
            .create_user(domain.id, "carol", "$argon2id$fake", "", 0)
            .await
            .unwrap();
        assert!(dir.rename_mailbox(user.id, "INBOX", "Other").await.is_err());
        assert!(dir.delete_mailbox(user.id, "INBOX").await.is_err());
        dir.delete_mailbox(user.id, "Junk").await.unwrap();
    }

    #[tokio::test]
    async fn single_active_sieve_script() {
        let dir = Directory::new(test_db("sieve"));
        let domain = dir.create_domain("example.com", "mail", None).await.unwrap();
        let user = dir
            .create_user(domain.id, "dave", "$argon2id$fake", "", 0)
            .await
            .unwrap();
        dir.upsert_sieve_script(user.id, "one", "keep;").await.unwrap();
        dir.upsert_sieve_script(user.id, "two", "discard;").await.unwrap();
        dir.activate_sieve_script(user.id, "one").await.unwrap();
        dir.activate_sieve_script(user.id, "two").await.unwrap();
        let active = dir.active_sieve_script(user.id).await.unwrap().unwrap();
        assert_eq!(active.name, "two");
    }

    #[tokio::test]
    async fn vacation_deduplicates() {
        let dir = Directory::new(test_db("vacation"));
        let domain = dir.create_domain("example.com", "mail", None).await.unwrap();
        let user = dir
            .create_user(domain.id, "erin", "$argon2id$fake", "", 0)
            .await
            .unwrap();
        assert!(dir
            .vacation_try_record(user.id, "peer@other.test", 7)
            .await
            .unwrap());
        assert!(!dir
            .vacation_try_record(user.id, "peer@other.test", 7)
            .await
            .unwrap());
        assert!(dir
            .vacation_try_record(user.id, "someone-else@other.test", 7)
            .await
            .unwrap());
    }
}
