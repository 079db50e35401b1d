use paq_user::model::MessageRow;

use crate::flags::FLAG_SEEN;

/// An ordered view of a mailbox at a point in time. IMAP sequence
/// numbers are positions in `messages` (1-based); sessions keep the
/// snapshot they announced to the client and diff against newer ones.
#[derive(Clone, Debug)]
pub struct MailboxSnapshot {
    pub mailbox_id: i64,
    pub uidvalidity: u32,
    pub uidnext: u32,
    /// Ascending by UID.
    pub messages: Vec<MessageRow>,
}

impl MailboxSnapshot {
    pub fn exists(&self) -> u32 {
        self.messages.len() as u32
    }

    pub fn recent(&self) -> u32 {
        self.messages.iter().filter(|m| m.recent).count() as u32
    }

    pub fn unseen(&self) -> u32 {
        self.messages
            .iter()
            .filter(|m| !m.has_flag(FLAG_SEEN))
            .count() as u32
    }

    pub fn by_uid(&self, uid: u32) -> Option<&MessageRow> {
        self.messages
            .binary_search_by_key(&uid, |m| m.uid)
            .ok()
            .map(|idx| &self.messages[idx])
    }

    /// 1-based sequence number of a UID, if present.
    pub fn seq_of_uid(&self, uid: u32) -> Option<u32> {
        self.messages
            .binary_search_by_key(&uid, |m| m.uid)
            .ok()
            .map(|idx| (idx + 1) as u32)
    }
}
