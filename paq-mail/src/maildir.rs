//! Maildir naming and directory layout.
//!
//! A mailbox lives at `<root>/user_<id>/<fs name>/{tmp,new,cur}` where
//! the fs name is the IMAP name with `/` replaced by `.`. A message
//! file is `<unix-nano>.<hex random 16>` with an optional `:2,<flags>`
//! suffix once it carries flags.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use rand::prelude::*;

use crate::flags::FlagSet;

pub const TMP: &str = "tmp";
pub const NEW: &str = "new";
pub const CUR: &str = "cur";

pub const INFO_SEPARATOR: &str = ":2,";

struct KeyGenerator {
    seed: u64,
    sn: AtomicU64,
}

impl KeyGenerator {
    fn new() -> Self {
        Self {
            seed: thread_rng().gen::<u64>(),
            sn: AtomicU64::new(0),
        }
    }

    fn gen(&self) -> String {
        let now = chrono::Utc::now();
        let nanos =
            now.timestamp() as u128 * 1_000_000_000 + now.timestamp_subsec_nanos() as u128;
        // Mix a process seed with a sequence number so concurrent
        // appends in the same nanosecond stay distinct.
        let sn = self.sn.fetch_add(1, Ordering::Relaxed);
        let uniq = self.seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(sn);
        format!("{}.{}", nanos, hex::encode(uniq.to_be_bytes()))
    }
}

lazy_static! {
    static ref GENERATOR: KeyGenerator = KeyGenerator::new();
}

/// A fresh message key, `<unix-nano>.<16 hex chars>`.
pub fn gen_key() -> String {
    GENERATOR.gen()
}

/// IMAP mailbox name → on-disk directory name.
pub fn fs_name(imap_name: &str) -> String {
    imap_name.replace('/', ".")
}

pub fn user_dir(root: &Path, user_id: i64) -> PathBuf {
    root.join(format!("user_{}", user_id))
}

pub fn mailbox_dir(root: &Path, user_id: i64, imap_name: &str) -> PathBuf {
    user_dir(root, user_id).join(fs_name(imap_name))
}

/// File name for a key + flag set: bare in `new/`, suffixed in `cur/`.
pub fn file_name(key: &str, flags: &FlagSet) -> String {
    if flags.is_empty() {
        format!("{}{}", key, INFO_SEPARATOR)
    } else {
        format!("{}{}{}", key, INFO_SEPARATOR, flags.as_str())
    }
}

/// Splits a file name into its key and flag set.
pub fn parse_file_name(name: &str) -> (String, FlagSet) {
    match name.split_once(INFO_SEPARATOR) {
        Some((key, flags)) => (key.to_string(), FlagSet::from_stored(flags)),
        None => (name.to_string(), FlagSet::new()),
    }
}

/// Finds the current on-disk path of a message. Checks the expected
/// locations first and only falls back to a directory scan when the
/// index and the tree disagree.
pub fn locate(dir: &Path, key: &str, flags: &FlagSet) -> Option<PathBuf> {
    let candidates = [
        dir.join(NEW).join(key),
        dir.join(CUR).join(file_name(key, flags)),
        dir.join(CUR).join(key),
        dir.join(NEW).join(file_name(key, flags)),
    ];
    for c in candidates {
        if c.is_file() {
            return Some(c);
        }
    }
    for sub in [NEW, CUR] {
        if let Ok(entries) = std::fs::read_dir(dir.join(sub)) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name == key || name.starts_with(&format!("{}{}", key, INFO_SEPARATOR)) {
                    return Some(entry.path());
                }
            }
        }
    }
    None
}

pub async fn create_dirs(dir: &Path) -> std::io::Result<()> {
    for sub in [TMP, NEW, CUR] {
        tokio::fs::create_dir_all(dir.join(sub)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{FlagSet, FLAG_SEEN};

    #[test]
    fn keys_are_unique_and_well_formed() {
        let a = gen_key();
        let b = gen_key();
        assert_ne!(a, b);
        let (nanos, rnd) = a.split_once('.').unwrap();
        assert!(nanos.parse::<u128>().is_ok());
        assert_eq!(rnd.len(), 16);
        assert!(rnd.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn file_name_roundtrip() {
        let mut flags = FlagSet::new();
        flags.insert(FLAG_SEEN);
        let name = file_name("123.abcd", &flags);
        assert_eq!(name, "123.abcd:2,S");
        let (key, parsed) = parse_file_name(&name);
        assert_eq!(key, "123.abcd");
        assert_eq!(parsed.as_str(), "S");

        let (key, parsed) = parse_file_name("123.abcd");
        assert_eq!(key, "123.abcd");
        assert!(parsed.is_empty());
    }

    #[test]
    fn hierarchy_delimiter_is_mapped() {
        assert_eq!(fs_name("Lists/rust"), "Lists.rust");
    }
}
