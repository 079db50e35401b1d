use std::sync::Arc;

use imap_codec::imap_types::command::Command;
use imap_codec::imap_types::core::Tag;
use tokio::sync::Notify;

use paq_user::login::AuthError;

use crate::imap::capability::ServerCapability;
use crate::imap::command::{anonymous, authenticated, selected};
use crate::imap::flow;
use crate::imap::response::{Body, Response};
use crate::imap::ToOwnedTag;
use crate::Core;

pub struct Instance {
    core: Arc<Core>,
    capabilities: ServerCapability,
    pub state: flow::State,
}

impl Instance {
    pub fn new(core: Arc<Core>, capabilities: ServerCapability) -> Self {
        Self {
            core,
            capabilities,
            state: flow::State::NotAuthenticated,
        }
    }

    /// Commands are handled in separate code paths per state so state
    /// errors cannot slip through.
    pub async fn command(&mut self, cmd: Command<'_>) -> Response<'static> {
        let result = match &mut self.state {
            flow::State::NotAuthenticated => {
                let ctx = anonymous::AnonymousContext {
                    req: &cmd,
                    core: &self.core,
                    capabilities: &self.capabilities,
                };
                anonymous::dispatch(ctx).await
            }
            flow::State::Authenticated(user) => {
                let ctx = authenticated::AuthenticatedContext {
                    req: &cmd,
                    core: &self.core,
                    capabilities: &self.capabilities,
                    user,
                };
                authenticated::dispatch(ctx).await
            }
            flow::State::Selected(user, mailbox, perm) => {
                let ctx = selected::SelectedContext {
                    req: &cmd,
                    core: &self.core,
                    capabilities: &self.capabilities,
                    user,
                    mailbox,
                    perm,
                };
                selected::dispatch(ctx).await
            }
            flow::State::Logout => Response::build()
                .to_req(&cmd)
                .message("No commands are allowed in the LOGOUT state.")
                .bad()
                .map(|r| (r, flow::Transition::None)),
        };

        let (response, transition) = match result {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(err = %err, cmd = ?cmd.body, "command processing failed");
                return Response::build()
                    .to_req(&cmd)
                    .message("Internal error while processing command")
                    .bad()
                    .expect("plain BAD response builds");
            }
        };

        if let Err(e) = self.state.apply(transition) {
            tracing::error!(err = %e, "illegal IMAP state transition");
            return Response::build()
                .to_req(&cmd)
                .message("Internal error, command triggered an illegal IMAP state transition")
                .bad()
                .expect("plain BAD response builds");
        }
        response
    }

    /// Shared by LOGIN and AUTHENTICATE PLAIN.
    pub async fn login(&mut self, tag: &Tag<'_>, username: &str, password: &str) -> Response<'static> {
        if !matches!(self.state, flow::State::NotAuthenticated) {
            return Response::build()
                .tag(tag.to_owned_tag())
                .message("Already authenticated")
                .bad()
                .expect("plain BAD response builds");
        }
        match self.core.auth.authenticate(username, password).await {
            Ok(user) => {
                tracing::info!(user = %username, "imap.authenticated");
                let transition = flow::Transition::Authenticate(Arc::new(user));
                match self.state.apply(transition) {
                    Ok(()) => Response::build()
                        .tag(tag.to_owned_tag())
                        .message("Completed")
                        .ok()
                        .expect("plain OK response builds"),
                    Err(_) => Response::build()
                        .tag(tag.to_owned_tag())
                        .message("Internal state error")
                        .bad()
                        .expect("plain BAD response builds"),
                }
            }
            Err(e) => {
                if matches!(e, AuthError::Disabled) {
                    tracing::warn!(user = %username, "login to disabled account");
                } else {
                    tracing::info!(user = %username, "authentication failed");
                }
                Response::build()
                    .tag(tag.to_owned_tag())
                    .message("Authentication failed")
                    .no()
                    .expect("plain NO response builds")
            }
        }
    }

    /// The tracker an IDLE on the currently selected mailbox waits on.
    pub fn idle_tracker(&self) -> Option<Arc<Notify>> {
        match &self.state {
            flow::State::Selected(_, view, _) => Some(view.mailbox.tracker()),
            _ => None,
        }
    }

    /// Unsolicited responses for the idling client after a tracker
    /// wakeup.
    pub async fn idle_updates(&mut self) -> Vec<Body<'static>> {
        match &mut self.state {
            flow::State::Selected(_, view, _) => view
                .update(&Default::default(), false)
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(err = %e, "idle resync failed");
                    vec![]
                }),
            _ => vec![],
        }
    }
}
