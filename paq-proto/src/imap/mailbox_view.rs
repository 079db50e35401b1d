use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;

use anyhow::{Error, Result};
use imap_codec::imap_types::core::Charset;
use imap_codec::imap_types::flag::{Flag, FlagFetch, FlagPerm, StoreResponse, StoreType};
use imap_codec::imap_types::response::{Code, CodeOther, Data, Status};
use imap_codec::imap_types::search::SearchKey;
use imap_codec::imap_types::sequence::SequenceSet;
use mail_parser::MessageParser;

use paq_mail::mailbox::Mailbox;
use paq_mail::snapshot::MailboxSnapshot;

use crate::imap::attributes::AttributesProxy;
use crate::imap::flags;
use crate::imap::index::Index;
use crate::imap::mail_view::{MailView, SeenFlag};
use crate::imap::response::Body;
use crate::imap::search;

const DEFAULT_FLAGS: [Flag; 5] = [
    Flag::Seen,
    Flag::Answered,
    Flag::Flagged,
    Flag::Deleted,
    Flag::Draft,
];

/// A MailboxView is what the client knows about the selected mailbox:
/// the snapshot taken at SELECT time (sequence numbers are positions in
/// it), refreshed against the store and diffed into untagged responses.
pub struct MailboxView {
    pub mailbox: Arc<Mailbox>,
    pub snapshot: MailboxSnapshot,
}

impl MailboxView {
    pub async fn new(mailbox: Mailbox) -> Result<Self> {
        let mailbox = Arc::new(mailbox);
        let snapshot = mailbox.snapshot().await?;
        Ok(Self { mailbox, snapshot })
    }

    /// SELECT/EXAMINE summary for the current snapshot.
    pub fn summary(&self) -> Result<Vec<Body<'static>>> {
        let mut data = Vec::<Body>::new();
        data.push(Body::Data(Data::Exists(self.snapshot.exists())));
        data.push(Body::Data(Data::Recent(self.snapshot.recent())));
        data.extend(self.flags_status()?);
        data.push(Body::Status(
            Status::ok(
                None,
                Some(Code::UidValidity(nonzero(self.snapshot.uidvalidity)?)),
                "UIDs valid",
            )
            .map_err(Error::msg)?,
        ));
        data.push(Body::Status(
            Status::ok(
                None,
                Some(Code::UidNext(nonzero(self.snapshot.uidnext)?)),
                "Predicted next UID",
            )
            .map_err(Error::msg)?,
        ));
        Ok(data)
    }

    /// Refreshes the snapshot and renders the difference the way RFC
    /// 3501 wants it: EXPUNGE (descending), EXISTS/RECENT, then FETCH
    /// for flag changes. `silence` suppresses FETCH lines for messages
    /// this session just changed itself (STORE .SILENT).
    pub async fn update(
        &mut self,
        silence: &HashSet<u32>,
        with_uid: bool,
    ) -> Result<Vec<Body<'static>>> {
        let old = std::mem::replace(&mut self.snapshot, self.mailbox.snapshot().await?);
        let new = &self.snapshot;

        let mut data = Vec::<Body>::new();

        let mut expunged = 0;
        for (i, msg) in old.messages.iter().enumerate().rev() {
            if new.by_uid(msg.uid).is_none() {
                data.push(Body::Data(Data::Expunge(nonzero((i + 1) as u32)?)));
                expunged += 1;
            }
        }

        if new.messages.len() != old.messages.len() - expunged
            || new.uidvalidity != old.uidvalidity
        {
            data.push(Body::Data(Data::Exists(new.exists())));
            data.push(Body::Data(Data::Recent(new.recent())));
        }

        if new.uidvalidity != old.uidvalidity {
            data.push(Body::Status(
                Status::ok(
                    None,
                    Some(Code::UidValidity(nonzero(new.uidvalidity)?)),
                    "UIDs valid",
                )
                .map_err(Error::msg)?,
            ));
        } else {
            for (i, msg) in new.messages.iter().enumerate() {
                if silence.contains(&msg.uid) {
                    continue;
                }
                if let Some(old_msg) = old.by_uid(msg.uid) {
                    if old_msg.flags != msg.flags || old_msg.recent != msg.recent {
                        let mut items = vec![imap_codec::imap_types::fetch::MessageDataItem::Flags(
                            flags::fetch_flags(msg),
                        )];
                        if with_uid {
                            items.push(imap_codec::imap_types::fetch::MessageDataItem::Uid(
                                nonzero(msg.uid)?,
                            ));
                        }
                        data.push(Body::Data(Data::Fetch {
                            seq: nonzero((i + 1) as u32)?,
                            items: items.try_into()?,
                        }));
                    }
                }
            }
        }
        Ok(data)
    }

    pub async fn fetch(
        &mut self,
        sequence_set: &SequenceSet,
        ap: &AttributesProxy,
        by_uid: bool,
        read_only: bool,
    ) -> Result<Vec<Body<'static>>> {
        let mut out = Vec::new();
        let mut add_seen: Vec<u32> = Vec::new();
        {
            let idx = Index::new(&self.snapshot)?;
            let selected = idx.fetch(sequence_set, by_uid);

            for midx in selected {
                let raw = if ap.need_raw() {
                    match self.mailbox.read(midx.row.uid).await {
                        Ok(bytes) => Some(bytes),
                        Err(e) => {
                            tracing::warn!(uid = midx.row.uid, err = %e, "cannot read message for FETCH");
                            continue;
                        }
                    }
                } else {
                    None
                };
                let view = MailView::new(midx, raw.as_deref());
                let (body, seen) = view.filter(ap)?;
                out.push(body);
                if matches!(seen, SeenFlag::MustAdd) && !read_only {
                    add_seen.push(midx.row.uid);
                }
            }
        }
        // apply the \Seen side effect and patch the session's view in
        // place, so the next update() only reports other writers
        for uid in add_seen {
            let updated = self
                .mailbox
                .add_flags(uid, &[paq_mail::flags::FLAG_SEEN])
                .await?;
            if let (Some(updated), Ok(pos)) = (
                updated,
                self.snapshot.messages.binary_search_by_key(&uid, |m| m.uid),
            ) {
                self.snapshot.messages[pos] = updated;
            }
        }
        Ok(out)
    }

    pub async fn store(
        &mut self,
        sequence_set: &SequenceSet,
        kind: &StoreType,
        response: &StoreResponse,
        store_flags: &[Flag<'_>],
        by_uid: bool,
    ) -> Result<Vec<Body<'static>>> {
        let chars = flags::to_chars(store_flags);
        let uids: Vec<u32> = {
            let idx = Index::new(&self.snapshot)?;
            idx.fetch(sequence_set, by_uid)
                .into_iter()
                .map(|m| m.row.uid)
                .collect()
        };

        for uid in &uids {
            match kind {
                StoreType::Add => self.mailbox.add_flags(*uid, &chars).await?,
                StoreType::Remove => self.mailbox.remove_flags(*uid, &chars).await?,
                StoreType::Replace => self.mailbox.set_flags(*uid, &chars).await?,
            };
        }

        let silence = match response {
            StoreResponse::Answer => HashSet::new(),
            StoreResponse::Silent => uids.iter().copied().collect(),
        };
        self.update(&silence, by_uid).await
    }

    /// Removes \Deleted messages (optionally a UID subset) and reports
    /// the expunges against the session's snapshot, descending.
    pub async fn expunge(&mut self, only_uids: Option<Vec<u32>>) -> Result<Vec<Body<'static>>> {
        self.mailbox.expunge(only_uids.as_deref()).await?;
        self.update(&HashSet::new(), false).await
    }

    pub async fn copy(
        &self,
        sequence_set: &SequenceSet,
        dest: &Mailbox,
        by_uid: bool,
    ) -> Result<(u32, Vec<(u32, u32)>)> {
        let uids: Vec<u32> = {
            let idx = Index::new(&self.snapshot)?;
            idx.fetch(sequence_set, by_uid)
                .into_iter()
                .map(|m| m.row.uid)
                .collect()
        };
        let mut mapping = Vec::new();
        for uid in uids {
            if let Some(new_uid) = self.mailbox.copy_to(dest, uid).await? {
                mapping.push((uid, new_uid));
            }
        }
        let dest_snapshot = dest.snapshot().await?;
        Ok((dest_snapshot.uidvalidity, mapping))
    }

    pub async fn search(
        &self,
        _charset: &Option<Charset<'_>>,
        key: &SearchKey<'_>,
        by_uid: bool,
    ) -> Result<Vec<Body<'static>>> {
        let need_message = search::need_message(key);
        let idx = Index::new(&self.snapshot)?;

        let mut found = Vec::new();
        for midx in &idx.entries {
            let raw = if need_message {
                match self.mailbox.read(midx.row.uid).await {
                    Ok(bytes) => Some(bytes),
                    Err(_) => None,
                }
            } else {
                None
            };
            let message = raw
                .as_deref()
                .and_then(|bytes| MessageParser::new().parse(bytes));
            if search::matches(key, midx, message.as_ref()) {
                found.push(if by_uid { midx.uid } else { midx.i });
            }
        }
        Ok(vec![Body::Data(Data::Search(found))])
    }

    /// UIDs a CLOSE-style silent expunge would remove.
    pub fn deleted_uids(&self) -> Vec<u32> {
        self.snapshot
            .messages
            .iter()
            .filter(|m| m.has_flag(paq_mail::flags::FLAG_DELETED))
            .map(|m| m.uid)
            .collect()
    }

    pub fn copyuid_code(uidvalidity: u32, mapping: &[(u32, u32)]) -> Code<'static> {
        let src = mapping
            .iter()
            .map(|(s, _)| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let dst = mapping
            .iter()
            .map(|(_, d)| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Code::Other(CodeOther::unvalidated(
            format!("COPYUID {} {} {}", uidvalidity, src, dst).into_bytes(),
        ))
    }

    fn flags_status(&self) -> Result<Vec<Body<'static>>> {
        let mut body = vec![];

        let mut known_flags: Vec<Flag> = DEFAULT_FLAGS.to_vec();
        for msg in &self.snapshot.messages {
            for ff in flags::fetch_flags(msg) {
                if let FlagFetch::Flag(f) = ff {
                    if !known_flags.contains(&f) {
                        known_flags.push(f);
                    }
                }
            }
        }
        body.push(Body::Data(Data::Flags(known_flags)));

        let permanent = DEFAULT_FLAGS
            .iter()
            .map(|f| FlagPerm::Flag(f.clone()))
            .collect::<Vec<_>>();
        let permanent_flags = Status::ok(
            None,
            Some(Code::PermanentFlags(permanent)),
            "Flags permitted",
        )
        .map_err(Error::msg)?;
        body.push(Body::Status(permanent_flags));

        Ok(body)
    }
}

fn nonzero(v: u32) -> Result<NonZeroU32> {
    Ok(NonZeroU32::try_from(v)?)
}
