use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error, Result};

/// A normalized `local@domain` e-mail address.
///
/// Both parts are lowercased at parse time; the split is on the
/// rightmost `@` so that quoted locals containing `@` keep working.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub local: String,
    pub domain: String,
}

impl Address {
    pub fn new(local: &str, domain: &str) -> Self {
        Self {
            local: local.to_lowercase(),
            domain: domain.to_lowercase(),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (local, domain) = match s.rfind('@') {
            Some(idx) => (&s[..idx], &s[idx + 1..]),
            None => bail!("invalid address {:?}: missing @", s),
        };
        if local.is_empty() || domain.is_empty() {
            bail!("invalid address {:?}: empty local part or domain", s);
        }
        Ok(Address::new(local, domain))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes() {
        let a: Address = "Alice@Example.COM".parse().unwrap();
        assert_eq!(a.local, "alice");
        assert_eq!(a.domain, "example.com");
        assert_eq!(a.to_string(), "alice@example.com");
    }

    #[test]
    fn splits_on_rightmost_at() {
        let a: Address = "\"weird@local\"@example.com".parse().unwrap();
        assert_eq!(a.local, "\"weird@local\"");
        assert_eq!(a.domain, "example.com");
    }

    #[test]
    fn rejects_malformed() {
        assert!("no-at-sign".parse::<Address>().is_err());
        assert!("@example.com".parse::<Address>().is_err());
        assert!("alice@".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }
}
