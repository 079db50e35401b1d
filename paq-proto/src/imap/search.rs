//! SEARCH criteria evaluation over the snapshot index plus, when the
//! key demands it, the parsed message.

use chrono::NaiveDate;
use imap_codec::imap_types::search::SearchKey;
use mail_parser::{Address, HeaderValue, Message};

use paq_mail::flags as store_flags;

use crate::imap::index::MailIndex;

/// Keys that reach beyond the envelope cache need the message itself:
/// full-text and body matching, Date-header comparisons, and the
/// header keys the cache does not carry.
pub fn need_message(key: &SearchKey<'_>) -> bool {
    use SearchKey::*;
    match key {
        Text(_) | Body(_) | SentBefore(_) | SentOn(_) | SentSince(_) | Cc(_) | Bcc(_)
        | Header(..) => true,
        And(list) => list.as_ref().iter().any(need_message),
        Or(a, b) => need_message(a) || need_message(b),
        Not(inner) => need_message(inner),
        _ => false,
    }
}

pub fn matches(key: &SearchKey<'_>, midx: &MailIndex<'_>, message: Option<&Message<'_>>) -> bool {
    use SearchKey::*;
    match key {
        All => true,
        And(list) => list.as_ref().iter().all(|k| matches(k, midx, message)),
        Or(a, b) => matches(a, midx, message) || matches(b, midx, message),
        Not(inner) => !matches(inner, midx, message),

        SequenceSet(set) => set
            .0
            .as_ref()
            .iter()
            .any(|seq| midx.is_in_sequence(seq, false)),
        Uid(set) => set
            .0
            .as_ref()
            .iter()
            .any(|seq| midx.is_in_sequence(seq, true)),

        Answered => midx.is_flag_set(store_flags::FLAG_ANSWERED),
        Unanswered => !midx.is_flag_set(store_flags::FLAG_ANSWERED),
        Deleted => midx.is_flag_set(store_flags::FLAG_DELETED),
        Undeleted => !midx.is_flag_set(store_flags::FLAG_DELETED),
        Draft => midx.is_flag_set(store_flags::FLAG_DRAFT),
        Undraft => !midx.is_flag_set(store_flags::FLAG_DRAFT),
        Flagged => midx.is_flag_set(store_flags::FLAG_FLAGGED),
        Unflagged => !midx.is_flag_set(store_flags::FLAG_FLAGGED),
        Seen => midx.is_flag_set(store_flags::FLAG_SEEN),
        Unseen => !midx.is_flag_set(store_flags::FLAG_SEEN),
        Recent => midx.row.recent,
        Old => !midx.row.recent,
        New => midx.row.recent && !midx.is_flag_set(store_flags::FLAG_SEEN),
        Keyword(_) => false,
        Unkeyword(_) => true,

        Larger(n) => midx.row.size_bytes > *n as i64,
        Smaller(n) => midx.row.size_bytes < *n as i64,

        Before(date) => internal_date(midx) < naive(date),
        On(date) => internal_date(midx) == naive(date),
        Since(date) => internal_date(midx) >= naive(date),
        SentBefore(date) => sent_date(message).map(|d| d < naive(date)).unwrap_or(false),
        SentOn(date) => sent_date(message).map(|d| d == naive(date)).unwrap_or(false),
        SentSince(date) => sent_date(message).map(|d| d >= naive(date)).unwrap_or(false),

        From(s) => env_contains(midx.row.envelope.from.as_deref(), s.as_ref()),
        To(s) => env_contains(midx.row.envelope.to.as_deref(), s.as_ref()),
        Subject(s) => env_contains(midx.row.envelope.subject.as_deref(), s.as_ref()),
        Cc(s) => address_header_contains(message.and_then(|m| m.cc()), s.as_ref()),
        Bcc(s) => address_header_contains(message.and_then(|m| m.bcc()), s.as_ref()),
        Header(name, value) => header_contains(
            message,
            &String::from_utf8_lossy(name.as_ref()),
            value.as_ref(),
        ),

        Text(s) => message
            .map(|m| contains_ci_bytes(m.raw_message.as_ref(), s.as_ref()))
            .unwrap_or(false),
        Body(s) => message
            .map(|m| {
                let raw = m.raw_message.as_ref();
                let body = match raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    Some(pos) => &raw[pos + 4..],
                    None => raw,
                };
                contains_ci_bytes(body, s.as_ref())
            })
            .unwrap_or(false),

        other => {
            tracing::debug!(key = ?other, "unsupported search key matches nothing");
            false
        }
    }
}

fn naive(date: &imap_codec::imap_types::datetime::NaiveDate) -> NaiveDate {
    *date.as_ref()
}

fn internal_date(midx: &MailIndex<'_>) -> NaiveDate {
    chrono::DateTime::from_timestamp_millis(midx.row.internal_date)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

fn sent_date(message: Option<&Message<'_>>) -> Option<NaiveDate> {
    let date = message?.date()?;
    NaiveDate::from_ymd_opt(date.year as i32, date.month as u32, date.day as u32)
}

fn env_contains(haystack: Option<&str>, needle: &[u8]) -> bool {
    let needle = String::from_utf8_lossy(needle).to_lowercase();
    haystack
        .map(|h| h.to_lowercase().contains(&needle))
        .unwrap_or(false)
}

/// Cc/Bcc matching over the parsed address list, display names
/// included.
fn address_header_contains(address: Option<&Address<'_>>, needle: &[u8]) -> bool {
    let address = match address {
        Some(a) => a,
        None => return false,
    };
    let needle = String::from_utf8_lossy(needle).to_lowercase();
    address.iter().any(|a| {
        a.address
            .as_deref()
            .map(|spec| spec.to_lowercase().contains(&needle))
            .unwrap_or(false)
            || a.name
                .as_deref()
                .map(|name| name.to_lowercase().contains(&needle))
                .unwrap_or(false)
    })
}

/// HEADER <name> <value>: an empty value tests mere existence.
fn header_contains(message: Option<&Message<'_>>, name: &str, needle: &[u8]) -> bool {
    let header = match message.and_then(|m| m.header(name)) {
        Some(h) => h,
        None => return false,
    };
    if needle.is_empty() {
        return true;
    }
    let needle = String::from_utf8_lossy(needle).to_lowercase();
    header_text(header).to_lowercase().contains(&needle)
}

fn header_text(value: &HeaderValue<'_>) -> String {
    match value {
        HeaderValue::Text(t) => t.to_string(),
        HeaderValue::TextList(l) => l
            .iter()
            .map(|t| t.as_ref())
            .collect::<Vec<_>>()
            .join(", "),
        HeaderValue::Address(address) => address
            .iter()
            .filter_map(|a| a.address.as_deref())
            .collect::<Vec<_>>()
            .join(", "),
        HeaderValue::DateTime(dt) => dt.to_rfc3339(),
        _ => String::new(),
    }
}

fn contains_ci_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    let haystack = String::from_utf8_lossy(haystack).to_lowercase();
    let needle = String::from_utf8_lossy(needle).to_lowercase();
    haystack.contains(&needle)
}
