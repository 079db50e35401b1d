use std::sync::Arc;

use anyhow::Result;
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::core::Charset;
use imap_codec::imap_types::fetch::MacroOrMessageDataItemNames;
use imap_codec::imap_types::ToStatic;
use imap_codec::imap_types::flag::{Flag, StoreResponse, StoreType};
use imap_codec::imap_types::mailbox::Mailbox as MailboxCodec;
use imap_codec::imap_types::response::Code;
use imap_codec::imap_types::search::SearchKey;
use imap_codec::imap_types::sequence::SequenceSet;

use paq_user::model::User;

use crate::imap::attributes::AttributesProxy;
use crate::imap::capability::ServerCapability;
use crate::imap::command::{anystate, authenticated, MailboxName};
use crate::imap::flow;
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::Response;
use crate::imap::ToOwnedTag;
use crate::Core;

pub struct SelectedContext<'a> {
    pub req: &'a Command<'a>,
    pub core: &'a Arc<Core>,
    pub capabilities: &'a ServerCapability,
    pub user: &'a Arc<User>,
    pub mailbox: &'a mut MailboxView,
    pub perm: &'a flow::MailboxPerm,
}

pub async fn dispatch(ctx: SelectedContext<'_>) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.to_owned_tag(), ctx.capabilities)
        }
        CommandBody::Logout => anystate::logout(),

        // Specific to this state
        CommandBody::Close => match ctx.perm {
            flow::MailboxPerm::ReadWrite => ctx.close().await,
            flow::MailboxPerm::ReadOnly => ctx.examine_close().await,
        },
        CommandBody::Noop | CommandBody::Check => ctx.noop().await,
        CommandBody::Fetch {
            sequence_set,
            macro_or_item_names,
            uid,
            ..
        } => {
            ctx.fetch(sequence_set, &macro_or_item_names.to_static(), uid)
                .await
        }
        CommandBody::Search {
            charset,
            criteria,
            uid,
        } => {
            ctx.search(charset, &SearchKey::And(criteria.clone()), uid)
                .await
        }
        CommandBody::Expunge { .. } => ctx.expunge().await,
        CommandBody::Store {
            sequence_set,
            kind,
            response,
            flags,
            uid,
            ..
        } => ctx.store(sequence_set, kind, response, flags, uid).await,
        CommandBody::Copy {
            sequence_set,
            mailbox,
            uid,
        } => ctx.copy(sequence_set, mailbox, uid).await,

        // In selected mode, we fallback to authenticated when needed
        _ => {
            authenticated::dispatch(authenticated::AuthenticatedContext {
                req: ctx.req,
                core: ctx.core,
                capabilities: ctx.capabilities,
                user: ctx.user,
            })
            .await
        }
    }
}

// --- PRIVATE ---

impl<'a> SelectedContext<'a> {
    /// CLOSE expunges without sending the untagged EXPUNGE responses.
    async fn close(self) -> Result<(Response<'static>, flow::Transition)> {
        let deleted = self.mailbox.deleted_uids();
        if !deleted.is_empty() {
            self.mailbox.mailbox.expunge(Some(deleted.as_slice())).await?;
        }
        Ok((
            Response::build()
                .to_req(self.req)
                .message("CLOSE completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    /// CLOSE on an EXAMINE'd mailbox does not expunge.
    async fn examine_close(self) -> Result<(Response<'static>, flow::Transition)> {
        Ok((
            Response::build()
                .to_req(self.req)
                .message("CLOSE completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    async fn noop(self) -> Result<(Response<'static>, flow::Transition)> {
        let updates = self.mailbox.update(&Default::default(), false).await?;
        Ok((
            Response::build()
                .to_req(self.req)
                .message("NOOP completed.")
                .set_body(updates)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn fetch(
        self,
        sequence_set: &SequenceSet,
        attributes: &MacroOrMessageDataItemNames<'static>,
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let ap = AttributesProxy::new(attributes, *uid);
        // examining never sets \Seen
        let read_only = *self.perm == flow::MailboxPerm::ReadOnly;

        match self.mailbox.fetch(sequence_set, &ap, *uid, read_only).await {
            Ok(resp) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("FETCH completed")
                    .set_body(resp)
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

    async fn search(
        self,
        charset: &Option<Charset<'a>>,
        criteria: &SearchKey<'a>,
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let found = self.mailbox.search(charset, criteria, *uid).await?;
        Ok((
            Response::build()
                .to_req(self.req)
                .set_body(found)
                .message("SEARCH completed")
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn expunge(self) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let data = self.mailbox.expunge(None).await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("EXPUNGE completed")
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn store(
        self,
        sequence_set: &SequenceSet,
        kind: &StoreType,
        response: &StoreResponse,
        flags: &[Flag<'a>],
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let data = self
            .mailbox
            .store(sequence_set, kind, response, flags, *uid)
            .await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("STORE completed")
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn copy(
        self,
        sequence_set: &SequenceSet,
        mailbox: &MailboxCodec<'a>,
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let dest = match self.core.store.open_mailbox(self.user.id, name).await? {
            Some(handle) => handle,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Destination mailbox does not exist")
                        .code(Code::TryCreate)
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };

        let (uidval, uid_map) = self.mailbox.copy(sequence_set, &dest, *uid).await?;

        let mut builder = Response::build()
            .to_req(self.req)
            .message("COPY completed");
        if !uid_map.is_empty() {
            builder = builder.code(MailboxView::copyuid_code(uidval, &uid_map));
        }
        Ok((builder.ok()?, flow::Transition::None))
    }

    fn fail_read_only(&self) -> Option<Response<'static>> {
        match self.perm {
            flow::MailboxPerm::ReadWrite => None,
            flow::MailboxPerm::ReadOnly => Some(
                Response::build()
                    .to_req(self.req)
                    .message("Write commands are forbidden while examining a mailbox")
                    .no()
                    .expect("plain NO response builds"),
            ),
        }
    }
}
