//! SASL PLAIN decoding shared by SMTP AUTH and IMAP AUTHENTICATE:
//! base64 over `authzid NUL authcid NUL password`, where the authzid
//! must be empty or equal to the authcid (no impersonation).

use anyhow::{bail, Result};
use base64::Engine;

pub struct PlainCredentials {
    pub authcid: String,
    pub password: String,
}

pub fn decode_plain(b64: &str) -> Result<PlainCredentials> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|_| anyhow::anyhow!("invalid base64 in AUTH PLAIN"))?;
    decode_plain_raw(&raw)
}

pub fn decode_plain_raw(raw: &[u8]) -> Result<PlainCredentials> {
    let mut parts = raw.split(|&b| b == 0);
    let (authzid, authcid, password) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(z), Some(c), Some(p), None) => (z, c, p),
        _ => bail!("malformed SASL PLAIN payload"),
    };
    if !authzid.is_empty() && authzid != authcid {
        bail!("impersonating another user is not supported");
    }
    let authcid = std::str::from_utf8(authcid)?;
    let password = std::str::from_utf8(password)?;
    Ok(PlainCredentials {
        authcid: authcid.to_string(),
        password: password.to_string(),
    })
}

pub fn encode_b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_b64(b64: &str) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(b64.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain() {
        // \0alice@example.com\0hunter2
        let creds = decode_plain("AGFsaWNlQGV4YW1wbGUuY29tAGh1bnRlcjI=").unwrap();
        assert_eq!(creds.authcid, "alice@example.com");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn rejects_impersonation() {
        let raw = b"mallory\0alice\0pw";
        assert!(decode_plain_raw(raw).is_err());
    }

    #[test]
    fn accepts_matching_authzid() {
        let raw = b"alice\0alice\0pw";
        let creds = decode_plain_raw(raw).unwrap();
        assert_eq!(creds.authcid, "alice");
    }
}
