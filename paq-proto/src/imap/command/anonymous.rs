use std::sync::Arc;

use anyhow::Result;
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::secret::Secret;

use paq_user::login::AuthError;

use crate::imap::capability::ServerCapability;
use crate::imap::command::anystate;
use crate::imap::flow;
use crate::imap::response::Response;
use crate::imap::ToOwnedTag;
use crate::Core;

pub struct AnonymousContext<'a> {
    pub req: &'a Command<'a>,
    pub core: &'a Arc<Core>,
    pub capabilities: &'a ServerCapability,
}

pub async fn dispatch(ctx: AnonymousContext<'_>) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Noop => anystate::noop_nothing(ctx.req.tag.to_owned_tag()),
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.to_owned_tag(), ctx.capabilities)
        }
        CommandBody::Logout => anystate::logout(),

        // Specific to the anonymous state
        CommandBody::Login { username, password } => ctx.login(username, password).await,

        _ => anystate::wrong_state(ctx.req.tag.to_owned_tag()),
    }
}

impl<'a> AnonymousContext<'a> {
    async fn login(
        self,
        username: &imap_codec::imap_types::core::AString<'a>,
        password: &Secret<imap_codec::imap_types::core::AString<'a>>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let username = String::from_utf8_lossy(username.as_ref()).into_owned();
        let password = String::from_utf8_lossy(password.declassify().as_ref()).into_owned();
        tracing::info!(user = %username, "command.login");

        match self.core.auth.authenticate(&username, &password).await {
            Ok(user) => {
                tracing::info!(user = %username, "connected");
                Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Completed")
                        .ok()?,
                    flow::Transition::Authenticate(Arc::new(user)),
                ))
            }
            Err(e) => {
                if matches!(e, AuthError::Disabled) {
                    tracing::warn!(user = %username, "login to disabled account");
                } else {
                    tracing::debug!(user = %username, "authentication failed");
                }
                Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Authentication failed")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        }
    }
}
