//! Store-level structured search: the criteria the protocol layers
//! compile their queries into. Evaluated against the snapshot plus the
//! envelope cache; body matching is layered on top by the caller when
//! it needs file contents.

use paq_user::model::MessageRow;

use crate::flags::FlagSet;

#[derive(Clone, Debug, Default)]
pub struct SearchCriteria {
    /// Internal date lower bound (inclusive), unix millis.
    pub since: Option<i64>,
    /// Internal date upper bound (exclusive), unix millis.
    pub before: Option<i64>,
    pub larger_than: Option<i64>,
    pub smaller_than: Option<i64>,
    pub from_contains: Option<String>,
    pub to_contains: Option<String>,
    pub subject_contains: Option<String>,
    pub with_flags: FlagSet,
    pub without_flags: FlagSet,
}

impl SearchCriteria {
    pub fn matches(&self, msg: &MessageRow) -> bool {
        if let Some(since) = self.since {
            if msg.internal_date < since {
                return false;
            }
        }
        if let Some(before) = self.before {
            if msg.internal_date >= before {
                return false;
            }
        }
        if let Some(larger) = self.larger_than {
            if msg.size_bytes <= larger {
                return false;
            }
        }
        if let Some(smaller) = self.smaller_than {
            if msg.size_bytes >= smaller {
                return false;
            }
        }
        if let Some(ref needle) = self.from_contains {
            if !contains_ci(msg.envelope.from.as_deref(), needle) {
                return false;
            }
        }
        if let Some(ref needle) = self.to_contains {
            if !contains_ci(msg.envelope.to.as_deref(), needle) {
                return false;
            }
        }
        if let Some(ref needle) = self.subject_contains {
            if !contains_ci(msg.envelope.subject.as_deref(), needle) {
                return false;
            }
        }
        for flag in self.with_flags.iter() {
            if !msg.has_flag(flag) {
                return false;
            }
        }
        for flag in self.without_flags.iter() {
            if msg.has_flag(flag) {
                return false;
            }
        }
        true
    }
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    match haystack {
        Some(h) => h.to_lowercase().contains(&needle.to_lowercase()),
        None => false,
    }
}
