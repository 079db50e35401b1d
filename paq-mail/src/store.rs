use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;

use paq_user::directory::{Directory, INBOX};
use paq_user::model::{MailboxRow, User, SPECIAL_USE_NONE};

use crate::mailbox::Mailbox;
use crate::maildir;
use crate::notify::TrackerRegistry;

/// The Maildir-backed message store: on-disk trees under
/// `<data-dir>/maildir` coordinated with the metadata index.
pub struct MailStore {
    root: PathBuf,
    directory: Arc<Directory>,
    trackers: Arc<TrackerRegistry>,
    /// Per-mailbox critical sections serializing UID allocation and
    /// file renames. Hash-bucketed by the map, not one global mutex.
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl MailStore {
    pub fn new(data_dir: &Path, directory: Arc<Directory>) -> Self {
        Self {
            root: data_dir.join("maildir"),
            directory,
            trackers: Arc::new(TrackerRegistry::new()),
            locks: DashMap::new(),
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn trackers(&self) -> Arc<TrackerRegistry> {
        self.trackers.clone()
    }

    fn lock_for(&self, mailbox_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(mailbox_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates the on-disk trees for every mailbox row of a user.
    pub async fn provision_user(&self, user_id: i64) -> Result<()> {
        for row in self.directory.list_mailboxes(user_id).await? {
            maildir::create_dirs(&maildir::mailbox_dir(&self.root, user_id, &row.name))
                .await
                .with_context(|| format!("creating maildir for {}", row.name))?;
        }
        Ok(())
    }

    pub async fn create_mailbox(&self, user_id: i64, name: &str) -> Result<MailboxRow> {
        let name = name.trim_matches('/');
        if name.is_empty() {
            bail!("empty mailbox name");
        }
        if name.eq_ignore_ascii_case(INBOX) && name != INBOX {
            bail!("INBOX is reserved");
        }
        let row = self
            .directory
            .create_mailbox(user_id, name, SPECIAL_USE_NONE)
            .await?;
        maildir::create_dirs(&maildir::mailbox_dir(&self.root, user_id, name)).await?;
        Ok(row)
    }

    pub async fn delete_mailbox(&self, user_id: i64, name: &str) -> Result<()> {
        let (row, freed) = self.directory.delete_mailbox(user_id, name).await?;
        self.directory.add_used_bytes(user_id, -freed).await?;
        let dir = maildir::mailbox_dir(&self.root, user_id, name);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(mailbox=%name, err=%e, "could not remove maildir tree");
            }
        }
        self.trackers.remove(row.id);
        self.locks.remove(&row.id);
        Ok(())
    }

    /// Renaming keeps the row (and UIDVALIDITY) but running sessions
    /// treat the result as a new mailbox; their tracker is detached.
    pub async fn rename_mailbox(&self, user_id: i64, from: &str, to: &str) -> Result<()> {
        let row = self.directory.rename_mailbox(user_id, from, to).await?;
        let old_dir = maildir::mailbox_dir(&self.root, user_id, from);
        let new_dir = maildir::mailbox_dir(&self.root, user_id, to);
        if old_dir.exists() {
            tokio::fs::rename(&old_dir, &new_dir)
                .await
                .with_context(|| format!("renaming maildir {} -> {}", from, to))?;
        } else {
            maildir::create_dirs(&new_dir).await?;
            tracing::warn!(mailbox=%from, "maildir tree missing at rename, created empty target");
        }
        self.trackers.remove(row.id);
        Ok(())
    }

    pub async fn open_mailbox(&self, user_id: i64, name: &str) -> Result<Option<Mailbox>> {
        let row = match self.directory.mailbox_by_name(user_id, name).await? {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(self.open_row(row)))
    }

    pub async fn open_mailbox_by_id(&self, mailbox_id: i64) -> Result<Option<Mailbox>> {
        let row = match self.directory.mailbox_by_id(mailbox_id).await? {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(self.open_row(row)))
    }

    pub fn open_row(&self, row: MailboxRow) -> Mailbox {
        let dir = maildir::mailbox_dir(&self.root, row.user_id, &row.name);
        Mailbox::new(
            row.clone(),
            dir,
            self.directory.clone(),
            self.lock_for(row.id),
            self.trackers.clone(),
        )
    }

    /// True when storing `additional` more bytes stays within quota.
    /// A quota of zero means unlimited.
    pub fn within_quota(user: &User, additional: i64) -> bool {
        user.quota_bytes <= 0 || user.used_bytes + additional <= user.quota_bytes
    }

    /// Index/tree consistency check for one user. Orphans are logged
    /// and counted, never fatal.
    pub async fn reconcile(&self, user_id: i64) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for row in self.directory.list_mailboxes(user_id).await? {
            let dir = maildir::mailbox_dir(&self.root, user_id, &row.name);
            let messages = self.directory.messages_in_mailbox(row.id).await?;
            for msg in &messages {
                let flags = crate::flags::FlagSet::from_stored(&msg.flags);
                if maildir::locate(&dir, &msg.maildir_key, &flags).is_none() {
                    tracing::warn!(
                        mailbox = %row.name,
                        uid = msg.uid,
                        key = %msg.maildir_key,
                        "indexed message has no backing file"
                    );
                    report.missing_files += 1;
                }
            }
            for sub in [maildir::NEW, maildir::CUR] {
                let mut entries = match tokio::fs::read_dir(dir.join(sub)).await {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let (key, _) = maildir::parse_file_name(&name);
                    if !messages.iter().any(|m| m.maildir_key == key) {
                        tracing::warn!(
                            mailbox = %row.name,
                            key = %key,
                            "file on disk has no index row"
                        );
                        report.orphan_files += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub missing_files: usize,
    pub orphan_files: usize,
}
