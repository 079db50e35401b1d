use std::sync::Arc;

use thiserror::Error;

use paq_user::model::User;

use crate::imap::mailbox_view::MailboxView;

#[derive(Error, Debug)]
pub enum Error {
    #[error("forbidden IMAP state transition")]
    ForbiddenTransition,
}

// See RFC 3501 section 3.
pub enum State {
    NotAuthenticated,
    Authenticated(Arc<User>),
    Selected(Arc<User>, MailboxView, MailboxPerm),
    Logout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxPerm {
    ReadOnly,
    ReadWrite,
}

pub enum Transition {
    None,
    Authenticate(Arc<User>),
    Select(MailboxView, MailboxPerm),
    Unselect,
    Logout,
}

impl State {
    pub fn apply(&mut self, transition: Transition) -> Result<(), Error> {
        let old = std::mem::replace(self, State::Logout);
        let new = match (old, transition) {
            (state, Transition::None) => state,
            (State::NotAuthenticated, Transition::Authenticate(user)) => {
                State::Authenticated(user)
            }
            (State::Authenticated(user), Transition::Select(view, perm))
            | (State::Selected(user, _, _), Transition::Select(view, perm)) => {
                State::Selected(user, view, perm)
            }
            (State::Selected(user, _, _), Transition::Unselect) => State::Authenticated(user),
            (_, Transition::Logout) => State::Logout,
            _ => return Err(Error::ForbiddenTransition),
        };
        *self = new;
        Ok(())
    }
}
