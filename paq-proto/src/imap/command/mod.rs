pub mod anonymous;
pub mod anystate;
pub mod authenticated;
pub mod selected;

use imap_codec::imap_types::mailbox::Mailbox as MailboxCodec;

/// IMAP wire name → UTF-8 mailbox name.
pub struct MailboxName<'a>(pub &'a MailboxCodec<'a>);

impl<'a> TryFrom<MailboxName<'a>> for &'a str {
    type Error = std::str::Utf8Error;

    fn try_from(name: MailboxName<'a>) -> Result<Self, Self::Error> {
        match name.0 {
            MailboxCodec::Inbox => Ok("INBOX"),
            MailboxCodec::Other(other) => std::str::from_utf8(other.as_ref()),
        }
    }
}
