use std::num::NonZeroU32;

use anyhow::Result;
use imap_codec::imap_types::sequence::{SeqOrUid, Sequence, SequenceSet};

use paq_mail::snapshot::MailboxSnapshot;
use paq_user::model::MessageRow;

/// Pairs every message of a snapshot with its sequence number, and maps
/// sequence sets (by id or by uid) back to messages.
pub struct Index<'a> {
    pub entries: Vec<MailIndex<'a>>,
}

#[derive(Clone, Debug)]
pub struct MailIndex<'a> {
    /// 1-based sequence number in the snapshot.
    pub i: NonZeroU32,
    pub uid: NonZeroU32,
    pub row: &'a MessageRow,
}

impl<'a> Index<'a> {
    pub fn new(snapshot: &'a MailboxSnapshot) -> Result<Self> {
        let entries = snapshot
            .messages
            .iter()
            .enumerate()
            .map(|(i, row)| {
                Ok(MailIndex {
                    i: NonZeroU32::try_from((i + 1) as u32)?,
                    uid: NonZeroU32::try_from(row.uid)?,
                    row,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    fn last_uid(&self) -> NonZeroU32 {
        self.entries
            .last()
            .map(|e| e.uid)
            .unwrap_or(NonZeroU32::MIN)
    }

    fn last_seq(&self) -> NonZeroU32 {
        self.entries
            .last()
            .map(|e| e.i)
            .unwrap_or(NonZeroU32::MIN)
    }

    /// Resolves a sequence set into message descriptors, ascending.
    pub fn fetch(&self, sequence_set: &SequenceSet, by_uid: bool) -> Vec<&MailIndex<'a>> {
        if self.entries.is_empty() {
            return vec![];
        }
        if by_uid {
            let mut wanted: Vec<NonZeroU32> = sequence_set.iter(self.last_uid()).collect();
            wanted.sort_unstable();
            wanted.dedup();
            let mut out = Vec::new();
            for uid in wanted {
                if let Ok(idx) = self.entries.binary_search_by_key(&uid, |e| e.uid) {
                    out.push(&self.entries[idx]);
                }
            }
            out
        } else {
            let mut wanted: Vec<NonZeroU32> = sequence_set.iter(self.last_seq()).collect();
            wanted.sort_unstable();
            wanted.dedup();
            wanted
                .into_iter()
                .filter_map(|seq| self.entries.get(seq.get() as usize - 1))
                .collect()
        }
    }
}

impl MailIndex<'_> {
    pub fn is_in_sequence(&self, seq: &Sequence, by_uid: bool) -> bool {
        let target = if by_uid { self.uid } else { self.i };
        match seq {
            Sequence::Single(SeqOrUid::Asterisk) => true,
            Sequence::Single(SeqOrUid::Value(x)) => *x == target,
            Sequence::Range(SeqOrUid::Asterisk, SeqOrUid::Value(x))
            | Sequence::Range(SeqOrUid::Value(x), SeqOrUid::Asterisk) => *x <= target,
            Sequence::Range(SeqOrUid::Value(x1), SeqOrUid::Value(x2)) => {
                if x1 <= x2 {
                    *x1 <= target && target <= *x2
                } else {
                    *x2 <= target && target <= *x1
                }
            }
            Sequence::Range(SeqOrUid::Asterisk, SeqOrUid::Asterisk) => true,
        }
    }

    pub fn is_flag_set(&self, c: char) -> bool {
        self.row.has_flag(c)
    }
}
