//! The message view a script is evaluated against: the envelope
//! sender/recipient, the size, and the parsed header block.

use mail_parser::{Address, HeaderValue, MessageParser};

/// Headers beyond this offset are ignored; scripts only ever test
/// headers, not bodies.
const HEADER_SCAN_LIMIT: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct SieveMessage {
    pub sender: String,
    pub recipient: String,
    pub size: usize,
    /// (lowercased name, rendered value) in message order.
    headers: Vec<(String, String)>,
}

impl SieveMessage {
    pub fn parse(sender: &str, recipient: &str, raw: &[u8]) -> Self {
        let bounded = &raw[..raw.len().min(HEADER_SCAN_LIMIT)];
        let headers = match MessageParser::new().parse(bounded) {
            Some(message) => message
                .headers()
                .iter()
                .map(|header| {
                    (
                        header.name().to_lowercase(),
                        render_header_value(&header.value),
                    )
                })
                .collect(),
            None => Vec::new(),
        };
        Self {
            sender: sender.to_lowercase(),
            recipient: recipient.to_lowercase(),
            size: raw.len(),
            headers,
        }
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn has_header(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.headers.iter().any(|(n, _)| *n == name)
    }

    /// Messages identified as automated never get a vacation response:
    /// list mail, bulk precedence, auto-submitted traffic, and the
    /// usual do-not-reply senders.
    pub fn is_automated(&self) -> bool {
        for precedence in self.header_values("Precedence") {
            let p = precedence.trim().to_lowercase();
            if p == "bulk" || p == "list" || p == "junk" {
                return true;
            }
        }
        if self.has_header("List-Id") || self.has_header("List-Unsubscribe") {
            return true;
        }
        for auto in self.header_values("Auto-Submitted") {
            if !auto.trim().eq_ignore_ascii_case("no") {
                return true;
            }
        }
        let local = self.sender.split('@').next().unwrap_or("");
        if self.sender.is_empty()
            || matches!(local, "noreply" | "no-reply" | "postmaster" | "mailer-daemon")
        {
            return true;
        }
        false
    }
}

/// Renders a parsed header back into the text a script matches on;
/// address headers keep their `Name <addr>` shape so both parts stay
/// testable.
fn render_header_value(value: &HeaderValue<'_>) -> String {
    match value {
        HeaderValue::Text(text) => text.to_string(),
        HeaderValue::TextList(list) => list
            .iter()
            .map(|t| t.as_ref())
            .collect::<Vec<_>>()
            .join(", "),
        HeaderValue::Address(address) => render_addresses(address),
        HeaderValue::DateTime(dt) => dt.to_rfc3339(),
        _ => String::new(),
    }
}

fn render_addresses(address: &Address<'_>) -> String {
    address
        .iter()
        .map(|a| {
            let spec = a.address.as_deref().unwrap_or("");
            match a.name.as_deref() {
                Some(name) => format!("{} <{}>", name, spec),
                None => spec.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pulls the addr-spec out of a header value: the angle-bracket form
/// when present, the bare value otherwise.
pub fn extract_address(value: &str) -> &str {
    match (value.rfind('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => &value[open + 1..close],
        _ => value.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\n\
Subject: a very\r\n folded subject\r\n\
List-Id: <dev.lists.example.com>\r\n\
\r\n\
Subject: not-a-header-anymore\r\n";

    #[test]
    fn parses_and_unfolds() {
        let msg = SieveMessage::parse("alice@example.com", "bob@example.com", RAW);
        assert_eq!(
            msg.header_values("subject"),
            vec!["a very folded subject"]
        );
        assert_eq!(msg.header_values("from"), vec!["Alice <alice@example.com>"]);
        // body lines are not headers
        assert_eq!(msg.header_values("subject").len(), 1);
    }

    #[test]
    fn automation_detection() {
        let msg = SieveMessage::parse("alice@example.com", "bob@example.com", RAW);
        assert!(msg.is_automated()); // List-Id

        let plain = SieveMessage::parse("alice@example.com", "bob@example.com", b"Subject: x\r\n\r\n");
        assert!(!plain.is_automated());

        let noreply = SieveMessage::parse("noreply@shop.example", "bob@example.com", b"\r\n");
        assert!(noreply.is_automated());

        let auto = SieveMessage::parse(
            "carol@example.com",
            "bob@example.com",
            b"Auto-Submitted: auto-replied\r\n\r\n",
        );
        assert!(auto.is_automated());

        let manual = SieveMessage::parse(
            "carol@example.com",
            "bob@example.com",
            b"Auto-Submitted: no\r\n\r\n",
        );
        assert!(!manual.is_automated());
    }

    #[test]
    fn address_extraction() {
        assert_eq!(extract_address("Alice <alice@example.com>"), "alice@example.com");
        assert_eq!(extract_address("  bob@example.com "), "bob@example.com");
    }
}
