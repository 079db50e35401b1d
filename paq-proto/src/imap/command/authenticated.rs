use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::core::{Atom, QuotedChar};
use imap_codec::imap_types::datetime::DateTime;
use imap_codec::imap_types::extensions::binary::LiteralOrLiteral8;
use imap_codec::imap_types::flag::{Flag, FlagNameAttribute};
use imap_codec::imap_types::mailbox::{ListMailbox, Mailbox as MailboxCodec};
use imap_codec::imap_types::response::{Code, CodeOther, Data};
use imap_codec::imap_types::status::{StatusDataItem, StatusDataItemName};

use paq_mail::flags::FlagSet;
use paq_mail::store::MailStore;
use paq_user::model::{MailboxRow, User, SPECIAL_USE_ARCHIVE, SPECIAL_USE_DRAFTS, SPECIAL_USE_SENT, SPECIAL_USE_TRASH};

use crate::imap::capability::ServerCapability;
use crate::imap::command::{anystate, MailboxName};
use crate::imap::flags;
use crate::imap::flow;
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::Response;
use crate::imap::ToOwnedTag;
use crate::Core;

pub const MAILBOX_HIERARCHY_DELIMITER: char = '/';

pub struct AuthenticatedContext<'a> {
    pub req: &'a Command<'a>,
    pub core: &'a Arc<Core>,
    pub capabilities: &'a ServerCapability,
    pub user: &'a Arc<User>,
}

pub async fn dispatch(
    ctx: AuthenticatedContext<'_>,
) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Noop => anystate::noop_nothing(ctx.req.tag.to_owned_tag()),
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.to_owned_tag(), ctx.capabilities)
        }
        CommandBody::Logout => anystate::logout(),

        // Specific to this state
        CommandBody::Create { mailbox } => ctx.create(mailbox).await,
        CommandBody::Delete { mailbox } => ctx.delete(mailbox).await,
        CommandBody::Rename { from, to } => ctx.rename(from, to).await,
        CommandBody::Lsub {
            reference,
            mailbox_wildcard,
        } => ctx.list(reference, mailbox_wildcard, true).await,
        CommandBody::List {
            reference,
            mailbox_wildcard,
            ..
        } => ctx.list(reference, mailbox_wildcard, false).await,
        CommandBody::Status {
            mailbox,
            item_names,
        } => ctx.status(mailbox, item_names).await,
        CommandBody::Subscribe { mailbox } => ctx.subscribe(mailbox, true).await,
        CommandBody::Unsubscribe { mailbox } => ctx.subscribe(mailbox, false).await,
        CommandBody::Select { mailbox, .. } => ctx.select(mailbox).await,
        CommandBody::Examine { mailbox, .. } => ctx.examine(mailbox).await,
        CommandBody::Append {
            mailbox,
            flags,
            date,
            message,
        } => ctx.append(mailbox, flags, date, message).await,

        _ => anystate::not_implemented(ctx.req.tag.to_owned_tag(), "in authenticated state"),
    }
}

// --- PRIVATE ---
impl<'a> AuthenticatedContext<'a> {
    async fn create(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name = match mailbox {
            MailboxCodec::Inbox => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Cannot create INBOX")
                        .bad()?,
                    flow::Transition::None,
                ));
            }
            MailboxCodec::Other(aname) => std::str::from_utf8(aname.as_ref())?,
        };

        match self.core.store.create_mailbox(self.user.id, name).await {
            Ok(_) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("CREATE complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn delete(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        match self.core.store.delete_mailbox(self.user.id, name).await {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("DELETE complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn rename(
        self,
        from: &MailboxCodec<'a>,
        to: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(from).try_into()?;
        let new_name: &str = MailboxName(to).try_into()?;

        match self
            .core
            .store
            .rename_mailbox(self.user.id, name, new_name)
            .await
        {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("RENAME complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn list(
        &self,
        reference: &MailboxCodec<'a>,
        mailbox_wildcard: &ListMailbox<'a>,
        is_lsub: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let mbx_hier_delim: QuotedChar = QuotedChar::unvalidated(MAILBOX_HIERARCHY_DELIMITER);

        let reference: &str = MailboxName(reference).try_into()?;
        if !reference.is_empty() {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("References not supported")
                    .bad()?,
                flow::Transition::None,
            ));
        }

        let wildcard = match mailbox_wildcard {
            ListMailbox::Token(v) => std::str::from_utf8(v.as_ref())?,
            ListMailbox::String(v) => std::str::from_utf8(v.as_ref())?,
        };
        if wildcard.is_empty() {
            let data = if is_lsub {
                Data::Lsub {
                    items: vec![],
                    delimiter: Some(mbx_hier_delim),
                    mailbox: "".try_into().unwrap(),
                }
            } else {
                Data::List {
                    items: vec![],
                    delimiter: Some(mbx_hier_delim),
                    mailbox: "".try_into().unwrap(),
                }
            };
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message(if is_lsub { "LSUB complete" } else { "LIST complete" })
                    .data(data)
                    .ok()?,
                flow::Transition::None,
            ));
        }

        let rows = self.core.directory.list_mailboxes(self.user.id).await?;
        let mut vmailboxes: BTreeMap<String, Option<&MailboxRow>> = BTreeMap::new();
        for row in rows.iter() {
            if is_lsub && !row.subscribed {
                continue;
            }
            for (i, _) in row.name.match_indices(MAILBOX_HIERARCHY_DELIMITER) {
                if i > 0 {
                    let parent = &row.name[..i];
                    vmailboxes.entry(parent.to_string()).or_insert(None);
                }
            }
            vmailboxes.insert(row.name.clone(), Some(row));
        }

        let mut ret = vec![];
        for (name, maybe_row) in vmailboxes.iter() {
            if !matches_wildcard(wildcard, name) {
                continue;
            }
            let mailbox: MailboxCodec = name
                .to_string()
                .try_into()
                .map_err(|_| anyhow::anyhow!("invalid mailbox name {:?}", name))?;
            let mut items = vec![];

            match maybe_row {
                None => items.push(FlagNameAttribute::Noselect),
                Some(row) => match row.special_use.as_str() {
                    SPECIAL_USE_DRAFTS => items.push(Atom::unvalidated("Drafts").into()),
                    SPECIAL_USE_SENT => items.push(Atom::unvalidated("Sent").into()),
                    SPECIAL_USE_TRASH => items.push(Atom::unvalidated("Trash").into()),
                    SPECIAL_USE_ARCHIVE => items.push(Atom::unvalidated("Archive").into()),
                    _ => (),
                },
            }

            if is_lsub {
                ret.push(Data::Lsub {
                    items,
                    delimiter: Some(mbx_hier_delim),
                    mailbox,
                });
            } else {
                ret.push(Data::List {
                    items,
                    delimiter: Some(mbx_hier_delim),
                    mailbox,
                });
            }
        }

        let msg = if is_lsub {
            "LSUB completed"
        } else {
            "LIST completed"
        };
        Ok((
            Response::build()
                .to_req(self.req)
                .message(msg)
                .many_data(ret)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn status(
        &self,
        mailbox: &MailboxCodec<'a>,
        attributes: &[StatusDataItemName],
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let handle = match self.core.store.open_mailbox(self.user.id, name).await? {
            Some(handle) => handle,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        let snapshot = handle.snapshot().await?;

        let mut ret_attrs = vec![];
        for attr in attributes.iter() {
            ret_attrs.push(match attr {
                StatusDataItemName::Messages => StatusDataItem::Messages(snapshot.exists()),
                StatusDataItemName::Unseen => StatusDataItem::Unseen(snapshot.unseen()),
                StatusDataItemName::Recent => StatusDataItem::Recent(snapshot.recent()),
                StatusDataItemName::UidNext => {
                    StatusDataItem::UidNext(snapshot.uidnext.try_into()?)
                }
                StatusDataItemName::UidValidity => {
                    StatusDataItem::UidValidity(snapshot.uidvalidity.try_into()?)
                }
                other => bail!("STATUS item {:?} is not supported", other),
            });
        }

        let mailbox: MailboxCodec<'static> = name.to_string().try_into()
            .map_err(|_| anyhow::anyhow!("invalid mailbox name {:?}", name))?;
        Ok((
            Response::build()
                .to_req(self.req)
                .message("STATUS completed")
                .data(Data::Status {
                    mailbox,
                    items: ret_attrs.into(),
                })
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn subscribe(
        self,
        mailbox: &MailboxCodec<'a>,
        subscribed: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;
        let verb = if subscribed { "SUBSCRIBE" } else { "UNSUBSCRIBE" };

        match self
            .core
            .directory
            .set_subscribed(self.user.id, name, subscribed)
            .await
        {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(format!("{} complete", verb))
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn select(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let handle = match self.core.store.open_mailbox(self.user.id, name).await? {
            Some(handle) => handle,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        tracing::info!(username = %self.user.address(), mailbox = %name, "mailbox.selected");

        let view = MailboxView::new(handle).await?;
        // the \Recent announced in this summary belongs to this session
        view.mailbox.consume_recent().await?;
        let data = view.summary()?;

        Ok((
            Response::build()
                .message("Select completed")
                .to_req(self.req)
                .code(Code::ReadWrite)
                .set_body(data)
                .ok()?,
            flow::Transition::Select(view, flow::MailboxPerm::ReadWrite),
        ))
    }

    async fn examine(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let handle = match self.core.store.open_mailbox(self.user.id, name).await? {
            Some(handle) => handle,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        tracing::info!(username = %self.user.address(), mailbox = %name, "mailbox.examined");

        let view = MailboxView::new(handle).await?;
        let data = view.summary()?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("Examine completed")
                .code(Code::ReadOnly)
                .set_body(data)
                .ok()?,
            flow::Transition::Select(view, flow::MailboxPerm::ReadOnly),
        ))
    }

    async fn append(
        self,
        mailbox: &MailboxCodec<'a>,
        append_flags: &[Flag<'a>],
        date: &Option<DateTime>,
        message: &LiteralOrLiteral8<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let handle = match self.core.store.open_mailbox(self.user.id, name).await? {
            Some(handle) => handle,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .code(Code::TryCreate)
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };

        if date.is_some() {
            tracing::warn!("Cannot set date when appending message");
        }

        let data: &[u8] = match message {
            LiteralOrLiteral8::Literal(literal) => literal.data(),
            LiteralOrLiteral8::Literal8(literal8) => literal8.data.as_ref(),
        };
        let fresh_user = self
            .core
            .directory
            .user_by_id(self.user.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user vanished"))?;
        if !MailStore::within_quota(&fresh_user, data.len() as i64) {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Mailbox quota exceeded")
                    .no()?,
                flow::Transition::None,
            ));
        }

        let mut flag_set = FlagSet::new();
        for c in flags::to_chars(append_flags) {
            flag_set.insert(c);
        }
        let (uidvalidity, uid) = handle.append(data, &flag_set, None, true).await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("APPEND completed")
                .code(Code::Other(CodeOther::unvalidated(
                    format!("APPENDUID {} {}", uidvalidity, uid).into_bytes(),
                )))
                .ok()?,
            flow::Transition::None,
        ))
    }
}

/// RFC 3501 LIST wildcards: `*` matches anything, `%` anything except
/// the hierarchy delimiter.
pub fn matches_wildcard(wildcard: &str, name: &str) -> bool {
    let wildcard = wildcard.chars().collect::<Vec<char>>();
    let name = name.chars().collect::<Vec<char>>();

    let mut matches = vec![vec![false; wildcard.len() + 1]; name.len() + 1];

    for i in 0..=name.len() {
        for j in 0..=wildcard.len() {
            matches[i][j] = (i == 0 && j == 0)
                || (j > 0
                    && matches[i][j - 1]
                    && (wildcard[j - 1] == '%' || wildcard[j - 1] == '*'))
                || (i > 0
                    && j > 0
                    && matches[i - 1][j - 1]
                    && wildcard[j - 1] == name[i - 1]
                    && wildcard[j - 1] != '%'
                    && wildcard[j - 1] != '*')
                || (i > 0
                    && j > 0
                    && matches[i - 1][j]
                    && (wildcard[j - 1] == '*'
                        || (wildcard[j - 1] == '%'
                            && name[i - 1] != MAILBOX_HIERARCHY_DELIMITER)));
        }
    }

    matches[name.len()][wildcard.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches() {
        assert!(matches_wildcard("INBOX", "INBOX"));
        assert!(matches_wildcard("*", "INBOX"));
        assert!(matches_wildcard("%", "INBOX"));
        assert!(!matches_wildcard("%", "Test/Azerty"));
        assert!(!matches_wildcard("INBOX/*", "INBOX"));
        assert!(matches_wildcard("Sent/*", "Sent/A"));
        assert!(matches_wildcard("Sent/*", "Sent/A/B"));
        assert!(!matches_wildcard("Sent/%", "Sent/A/B"));
    }
}
