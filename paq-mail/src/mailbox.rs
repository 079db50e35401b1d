use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;

use paq_user::db::now_millis;
use paq_user::directory::Directory;
use paq_user::model::{MailboxRow, MessageRow};

use crate::envelope;
use crate::flags::{FlagSet, FLAG_DELETED, FLAG_SEEN};
use crate::maildir;
use crate::notify::TrackerRegistry;
use crate::search::SearchCriteria;
use crate::snapshot::MailboxSnapshot;

/// A handle on one mailbox: the index rows plus the Maildir tree.
/// Mutations take the per-mailbox lock so UID allocation and file
/// renames are serialized; reads go straight to the index.
pub struct Mailbox {
    row: MailboxRow,
    dir: PathBuf,
    directory: Arc<Directory>,
    lock: Arc<Mutex<()>>,
    trackers: Arc<TrackerRegistry>,
}

impl Mailbox {
    pub(crate) fn new(
        row: MailboxRow,
        dir: PathBuf,
        directory: Arc<Directory>,
        lock: Arc<Mutex<()>>,
        trackers: Arc<TrackerRegistry>,
    ) -> Self {
        Self {
            row,
            dir,
            directory,
            lock,
            trackers,
        }
    }

    pub fn id(&self) -> i64 {
        self.row.id
    }

    pub fn user_id(&self) -> i64 {
        self.row.user_id
    }

    pub fn name(&self) -> &str {
        &self.row.name
    }

    pub fn tracker(&self) -> Arc<tokio::sync::Notify> {
        self.trackers.tracker(self.row.id)
    }

    // ---- Reading ----

    pub async fn snapshot(&self) -> Result<MailboxSnapshot> {
        let fresh = self
            .directory
            .mailbox_by_id(self.row.id)
            .await?
            .ok_or_else(|| anyhow!("mailbox {} no longer exists", self.row.name))?;
        let messages = self.directory.messages_in_mailbox(self.row.id).await?;
        Ok(MailboxSnapshot {
            mailbox_id: fresh.id,
            uidvalidity: fresh.uidvalidity,
            uidnext: fresh.uidnext,
            messages,
        })
    }

    /// Clears \Recent after a read-write SELECT announced it.
    pub async fn consume_recent(&self) -> Result<()> {
        self.directory.clear_recent(self.row.id).await
    }

    /// Reads the raw message bytes for a UID.
    pub async fn read(&self, uid: u32) -> Result<Vec<u8>> {
        let msg = self
            .directory
            .message_by_uid(self.row.id, uid)
            .await?
            .ok_or_else(|| anyhow!("no message with uid {}", uid))?;
        let flags = FlagSet::from_stored(&msg.flags);
        let path = maildir::locate(&self.dir, &msg.maildir_key, &flags)
            .ok_or_else(|| anyhow!("message file for uid {} is missing", uid))?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    /// Structured search over the index; returns matching UIDs in
    /// ascending order.
    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .messages
            .iter()
            .filter(|m| criteria.matches(m))
            .map(|m| m.uid)
            .collect())
    }

    // ---- Writing ----

    /// Appends a message: tmp write, atomic rename, UID allocation
    /// under the mailbox lock, index row, envelope cache. The tmp file
    /// never survives a failure.
    pub async fn append(
        &self,
        data: &[u8],
        flags: &FlagSet,
        internal_date: Option<i64>,
        recent: bool,
    ) -> Result<(u32, u32)> {
        let key = maildir::gen_key();
        let tmp_path = self.dir.join(maildir::TMP).join(&key);
        tokio::fs::write(&tmp_path, data)
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;

        match self
            .append_after_tmp(&key, data, flags, internal_date, recent)
            .await
        {
            Ok(ok) => {
                self.trackers.notify(self.row.id);
                Ok(ok)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn append_after_tmp(
        &self,
        key: &str,
        data: &[u8],
        flags: &FlagSet,
        internal_date: Option<i64>,
        recent: bool,
    ) -> Result<(u32, u32)> {
        let envelope = envelope::extract(data);

        let _guard = self.lock.lock().await;
        let (uidvalidity, uid) = self.directory.allocate_uid(self.row.id).await?;

        let tmp_path = self.dir.join(maildir::TMP).join(key);
        let dest = if flags.contains(FLAG_SEEN) {
            self.dir
                .join(maildir::CUR)
                .join(maildir::file_name(key, flags))
        } else {
            self.dir.join(maildir::NEW).join(key)
        };
        tokio::fs::rename(&tmp_path, &dest)
            .await
            .with_context(|| format!("renaming into {}", dest.display()))?;

        let row = MessageRow {
            id: 0,
            mailbox_id: self.row.id,
            uid,
            maildir_key: key.to_string(),
            size_bytes: data.len() as i64,
            internal_date: internal_date.unwrap_or_else(now_millis),
            flags: flags.as_str().to_string(),
            recent,
            envelope,
        };
        if let Err(e) = self.directory.insert_message(row).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e);
        }
        self.directory
            .add_used_bytes(self.row.user_id, data.len() as i64)
            .await?;
        Ok((uidvalidity, uid))
    }

    pub async fn add_flags(&self, uid: u32, add: &[char]) -> Result<Option<MessageRow>> {
        self.change_flags(uid, |set| {
            for &c in add {
                set.insert(c);
            }
        })
        .await
    }

    pub async fn remove_flags(&self, uid: u32, remove: &[char]) -> Result<Option<MessageRow>> {
        self.change_flags(uid, |set| {
            for &c in remove {
                set.remove(c);
            }
        })
        .await
    }

    pub async fn set_flags(&self, uid: u32, flags: &[char]) -> Result<Option<MessageRow>> {
        self.change_flags(uid, |set| {
            *set = FlagSet::new();
            for &c in flags {
                set.insert(c);
            }
        })
        .await
    }

    /// Applies a flag mutation: index row first, then the file rename
    /// that keeps the suffix in step. A vanished file downgrades to a
    /// metadata-only update with a reconciliation warning.
    async fn change_flags(
        &self,
        uid: u32,
        mutate: impl FnOnce(&mut FlagSet),
    ) -> Result<Option<MessageRow>> {
        let _guard = self.lock.lock().await;
        let msg = match self.directory.message_by_uid(self.row.id, uid).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        let old_flags = FlagSet::from_stored(&msg.flags);
        let mut new_flags = old_flags.clone();
        mutate(&mut new_flags);
        if new_flags == old_flags {
            return Ok(Some(msg));
        }

        self.directory
            .update_message_flags(msg.id, new_flags.as_str(), msg.recent, &msg.maildir_key)
            .await?;

        match maildir::locate(&self.dir, &msg.maildir_key, &old_flags) {
            Some(old_path) => {
                // the file changes directory only as \Seen toggles; the
                // suffix still tracks the whole flag set
                let new_path = if new_flags.contains(FLAG_SEEN) {
                    self.dir
                        .join(maildir::CUR)
                        .join(maildir::file_name(&msg.maildir_key, &new_flags))
                } else {
                    self.dir.join(maildir::NEW).join(&msg.maildir_key)
                };
                if old_path != new_path {
                    if let Err(e) = tokio::fs::rename(&old_path, &new_path).await {
                        tracing::warn!(
                            uid,
                            err = %e,
                            "flag rename failed, index updated anyway"
                        );
                    }
                }
            }
            None => {
                tracing::warn!(
                    uid,
                    key = %msg.maildir_key,
                    "message file missing during flag update"
                );
            }
        }

        drop(_guard);
        self.trackers.notify(self.row.id);
        self.directory.message_by_uid(self.row.id, uid).await
    }

    /// Removes every message flagged \Deleted (optionally restricted to
    /// a UID set) and returns the expunged UIDs, ascending.
    pub async fn expunge(&self, only_uids: Option<&[u32]>) -> Result<Vec<u32>> {
        let guard = self.lock.lock().await;
        let messages = self.directory.messages_in_mailbox(self.row.id).await?;
        let mut expunged = Vec::new();
        let mut freed = 0i64;
        for msg in messages {
            if !msg.has_flag(FLAG_DELETED) {
                continue;
            }
            if let Some(uids) = only_uids {
                if !uids.contains(&msg.uid) {
                    continue;
                }
            }
            let flags = FlagSet::from_stored(&msg.flags);
            match maildir::locate(&self.dir, &msg.maildir_key, &flags) {
                Some(path) => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(uid = msg.uid, err = %e, "could not remove message file");
                    }
                }
                None => {
                    tracing::warn!(uid = msg.uid, key = %msg.maildir_key, "expunging message without backing file");
                }
            }
            self.directory.delete_message(msg.id).await?;
            freed += msg.size_bytes;
            expunged.push(msg.uid);
        }
        if freed > 0 {
            self.directory
                .add_used_bytes(self.row.user_id, -freed)
                .await?;
        }
        drop(guard);
        if !expunged.is_empty() {
            self.trackers.notify(self.row.id);
        }
        Ok(expunged)
    }

    /// Copies one message into `dest` (a new UID there). \Recent is
    /// never carried over.
    pub async fn copy_to(&self, dest: &Mailbox, uid: u32) -> Result<Option<u32>> {
        let msg = match self.directory.message_by_uid(self.row.id, uid).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        let data = self.read(uid).await?;
        let flags = FlagSet::from_stored(&msg.flags);
        let (_validity, new_uid) = dest
            .append(&data, &flags, Some(msg.internal_date), false)
            .await?;
        Ok(Some(new_uid))
    }

    /// Move is copy followed by expunge of the source.
    pub async fn move_to(&self, dest: &Mailbox, uid: u32) -> Result<Option<u32>> {
        let new_uid = match self.copy_to(dest, uid).await? {
            Some(u) => u,
            None => return Ok(None),
        };
        self.add_flags(uid, &[FLAG_DELETED]).await?;
        self.expunge(Some(&[uid])).await?;
        Ok(Some(new_uid))
    }
}
