use imap_codec::imap_types::flag::{Flag, FlagFetch};

use paq_mail::flags as store_flags;
use paq_user::model::MessageRow;

/// IMAP flag → Maildir flag character. Keywords and extension flags
/// are not persisted.
pub fn to_char(flag: &Flag<'_>) -> Option<char> {
    match flag {
        Flag::Seen => Some(store_flags::FLAG_SEEN),
        Flag::Answered => Some(store_flags::FLAG_ANSWERED),
        Flag::Flagged => Some(store_flags::FLAG_FLAGGED),
        Flag::Deleted => Some(store_flags::FLAG_DELETED),
        Flag::Draft => Some(store_flags::FLAG_DRAFT),
        _ => None,
    }
}

pub fn to_chars(flags: &[Flag<'_>]) -> Vec<char> {
    flags
        .iter()
        .filter_map(|f| {
            let c = to_char(f);
            if c.is_none() {
                tracing::debug!(flag = ?f, "ignoring unsupported flag");
            }
            c
        })
        .collect()
}

fn from_char(c: char) -> Option<Flag<'static>> {
    match c {
        store_flags::FLAG_SEEN => Some(Flag::Seen),
        store_flags::FLAG_ANSWERED => Some(Flag::Answered),
        store_flags::FLAG_FLAGGED => Some(Flag::Flagged),
        store_flags::FLAG_DELETED => Some(Flag::Deleted),
        store_flags::FLAG_DRAFT => Some(Flag::Draft),
        _ => None,
    }
}

/// The FETCH FLAGS view of a message, \Recent included.
pub fn fetch_flags(row: &MessageRow) -> Vec<FlagFetch<'static>> {
    let mut out: Vec<FlagFetch> = row
        .flags
        .chars()
        .filter_map(from_char)
        .map(FlagFetch::Flag)
        .collect();
    if row.recent {
        out.push(FlagFetch::Recent);
    }
    out
}
