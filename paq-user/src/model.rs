use crate::address::Address;

#[derive(Clone, Debug)]
pub struct Domain {
    pub id: i64,
    pub name: String,
    pub dkim_selector: String,
    pub dkim_private_key: Option<String>,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: i64,
    pub domain_id: i64,
    pub local_part: String,
    pub domain_name: String,
    pub password_hash: String,
    pub display_name: String,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub active: bool,
}

impl User {
    pub fn address(&self) -> Address {
        Address::new(&self.local_part, &self.domain_name)
    }
}

/// Where an alias points: a local user or an external address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AliasTarget {
    User(i64),
    External(String),
}

#[derive(Clone, Debug)]
pub struct Alias {
    pub id: i64,
    pub domain_id: i64,
    pub local_part: String,
    pub target: AliasTarget,
    pub active: bool,
}

pub const SPECIAL_USE_NONE: &str = "";
pub const SPECIAL_USE_DRAFTS: &str = "drafts";
pub const SPECIAL_USE_SENT: &str = "sent";
pub const SPECIAL_USE_TRASH: &str = "trash";
pub const SPECIAL_USE_JUNK: &str = "junk";
pub const SPECIAL_USE_ARCHIVE: &str = "archive";

#[derive(Clone, Debug)]
pub struct MailboxRow {
    pub id: i64,
    pub user_id: i64,
    /// IMAP name, `/` as hierarchy delimiter.
    pub name: String,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub special_use: String,
    pub subscribed: bool,
}

/// Envelope fields cached at append time so that SEARCH and sieve header
/// tests do not have to re-open the message file.
#[derive(Clone, Debug, Default)]
pub struct EnvelopeCache {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MessageRow {
    pub id: i64,
    pub mailbox_id: i64,
    pub uid: u32,
    /// Base Maildir key, without directory or `:2,` suffix.
    pub maildir_key: String,
    pub size_bytes: i64,
    /// Unix milliseconds.
    pub internal_date: i64,
    /// Subset of the Maildir flag characters `DFRST`, sorted.
    pub flags: String,
    pub recent: bool,
    pub envelope: EnvelopeCache,
}

impl MessageRow {
    pub fn has_flag(&self, c: char) -> bool {
        self.flags.contains(c)
    }
}

#[derive(Clone, Debug)]
pub struct SieveScript {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub source: String,
    pub active: bool,
}
