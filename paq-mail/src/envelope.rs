use mail_parser::{Address, HeaderValue, Message, MessageParser};

use paq_user::model::EnvelopeCache;

/// Only this much of a message is parsed for the envelope cache; header
/// blocks beyond it are truncated rather than read whole.
pub const HEADER_PARSE_LIMIT: usize = 64 * 1024;

/// Extracts the cached envelope fields from a raw message.
pub fn extract(raw: &[u8]) -> EnvelopeCache {
    let bounded = &raw[..raw.len().min(HEADER_PARSE_LIMIT)];
    match MessageParser::new().parse(bounded) {
        Some(message) => from_message(&message),
        None => EnvelopeCache::default(),
    }
}

pub fn from_message(message: &Message<'_>) -> EnvelopeCache {
    EnvelopeCache {
        message_id: message.message_id().map(|s| s.to_string()),
        subject: message.subject().map(|s| s.to_string()),
        from: message.from().and_then(address_list),
        to: message.to().and_then(address_list),
        in_reply_to: header_text(message, "In-Reply-To"),
        references: header_text(message, "References"),
    }
}

fn address_list(addr: &Address<'_>) -> Option<String> {
    let list: Vec<String> = addr
        .iter()
        .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list.join(", "))
    }
}

fn header_text(message: &Message<'_>, name: &str) -> Option<String> {
    match message.header(name) {
        Some(HeaderValue::Text(t)) => Some(t.to_string()),
        Some(HeaderValue::TextList(l)) => Some(
            l.iter()
                .map(|t| t.as_ref())
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"Message-ID: <abc@example.com>\r\n\
Subject: Weekly report\r\n\
From: Alice Example <alice@example.com>\r\n\
To: bob@example.com, carol@example.com\r\n\
In-Reply-To: <prev@example.com>\r\n\
Date: Thu, 12 Oct 2023 08:45:28 +0000\r\n\
\r\n\
body\r\n";

    #[test]
    fn extracts_cached_fields() {
        let env = extract(SAMPLE);
        assert_eq!(env.message_id.as_deref(), Some("abc@example.com"));
        assert_eq!(env.subject.as_deref(), Some("Weekly report"));
        assert_eq!(env.from.as_deref(), Some("alice@example.com"));
        assert_eq!(
            env.to.as_deref(),
            Some("bob@example.com, carol@example.com")
        );
        assert_eq!(env.in_reply_to.as_deref(), Some("prev@example.com"));
    }

    #[test]
    fn tolerates_garbage() {
        let env = extract(b"\xff\xfe not a message");
        assert!(env.subject.is_none());
    }
}
