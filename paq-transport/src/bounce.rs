//! Bounce (DSN) generation per RFC 3464: a small template producing
//! `multipart/report` with a human part, a `message/delivery-status`
//! part and the original headers, all CRLF-terminated.

use rand::Rng;

const HEADER_EXCERPT_LIMIT: usize = 4096;
const TRUNCATION_MARKER: &str = "[... headers truncated ...]";

/// Senders that never get a bounce: the null reverse-path and the
/// usual machine mailboxes. Everything is matched case-insensitively.
pub fn should_bounce(sender: &str) -> bool {
    if sender.is_empty() {
        return false;
    }
    let sender = sender.to_lowercase();
    let local = sender.split('@').next().unwrap_or("");
    !matches!(local, "postmaster" | "mailer-daemon" | "noreply" | "no-reply")
}

/// SMTP reply code → RFC 3463 enhanced status code.
pub fn status_code_for(reply_code: u16) -> &'static str {
    match reply_code {
        550 => "5.1.1",
        551 => "5.1.6",
        552 => "5.2.2",
        553 => "5.1.3",
        554 => "5.7.1",
        _ => "5.0.0",
    }
}

pub struct BounceInput<'a> {
    /// Our hostname, used for From, Reporting-MTA and Message-ID.
    pub hostname: &'a str,
    pub original_sender: &'a str,
    pub failed_recipients: &'a [String],
    pub reply_code: u16,
    pub reply_text: &'a str,
    /// The undeliverable message; only its header block is echoed.
    pub original_message: &'a [u8],
}

/// Renders the complete bounce message.
pub fn build_bounce(input: &BounceInput<'_>) -> Vec<u8> {
    let boundary = format!("paq-{}", hex::encode(rand::thread_rng().gen::<[u8; 12]>()));
    let status = status_code_for(input.reply_code);
    let date = chrono::Utc::now().to_rfc2822();
    let msg_id = format!(
        "<{}.bounce@{}>",
        crate::queue::gen_message_id(),
        input.hostname
    );
    let diagnostic = sanitize_line(input.reply_text, 500);

    let mut out = String::new();
    out.push_str(&format!(
        "From: Mail Delivery System <postmaster@{}>\r\n",
        input.hostname
    ));
    out.push_str(&format!("To: {}\r\n", input.original_sender));
    out.push_str("Subject: Undelivered Mail Returned to Sender\r\n");
    out.push_str(&format!("Date: {}\r\n", date));
    out.push_str(&format!("Message-ID: {}\r\n", msg_id));
    out.push_str("Auto-Submitted: auto-replied\r\n");
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str(&format!(
        "Content-Type: multipart/report; report-type=delivery-status; boundary=\"{}\"\r\n",
        boundary
    ));
    out.push_str("\r\n");

    // part 1: human readable
    out.push_str(&format!("--{}\r\n", boundary));
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    out.push_str("This is the mail system at host ");
    out.push_str(input.hostname);
    out.push_str(".\r\n\r\n");
    out.push_str(
        "I'm sorry to have to inform you that your message could not\r\n\
         be delivered to one or more recipients.\r\n\r\n",
    );
    for rcpt in input.failed_recipients {
        out.push_str(&format!(
            "<{}>: host said: {} {}\r\n",
            rcpt, input.reply_code, diagnostic
        ));
    }
    out.push_str("\r\n");

    // part 2: machine readable delivery status
    out.push_str(&format!("--{}\r\n", boundary));
    out.push_str("Content-Type: message/delivery-status\r\n\r\n");
    out.push_str(&format!("Reporting-MTA: dns; {}\r\n", input.hostname));
    out.push_str(&format!("Arrival-Date: {}\r\n", date));
    out.push_str("\r\n");
    for rcpt in input.failed_recipients {
        out.push_str(&format!("Final-Recipient: rfc822; {}\r\n", rcpt));
        out.push_str("Action: failed\r\n");
        out.push_str(&format!("Status: {}\r\n", status));
        out.push_str(&format!(
            "Diagnostic-Code: smtp; {} {}\r\n",
            input.reply_code, diagnostic
        ));
        out.push_str("\r\n");
    }

    // part 3: original headers, truncated
    out.push_str(&format!("--{}\r\n", boundary));
    out.push_str("Content-Type: text/rfc822-headers\r\n\r\n");
    out.push_str(&header_excerpt(input.original_message));
    out.push_str("\r\n");
    out.push_str(&format!("--{}--\r\n", boundary));

    out.into_bytes()
}

/// The original header block, CRLF-normalized and capped at 4 KiB with
/// a marker when cut.
fn header_excerpt(message: &[u8]) -> String {
    let mut out = String::new();
    for line in message.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        let text = String::from_utf8_lossy(line);
        if out.len() + text.len() + 2 > HEADER_EXCERPT_LIMIT {
            out.push_str(TRUNCATION_MARKER);
            out.push_str("\r\n");
            return out;
        }
        out.push_str(&text);
        out.push_str("\r\n");
    }
    out
}

/// Keeps diagnostic text on one short header-safe line.
fn sanitize_line(text: &str, max: usize) -> String {
    let mut cleaned: String = text
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    cleaned.truncate(max);
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_list() {
        assert!(!should_bounce(""));
        assert!(!should_bounce("postmaster@example.com"));
        assert!(!should_bounce("MAILER-DAEMON@example.com"));
        assert!(!should_bounce("NoReply@shop.example"));
        assert!(!should_bounce("no-reply@shop.example"));
        assert!(should_bounce("alice@example.com"));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_code_for(550), "5.1.1");
        assert_eq!(status_code_for(551), "5.1.6");
        assert_eq!(status_code_for(552), "5.2.2");
        assert_eq!(status_code_for(553), "5.1.3");
        assert_eq!(status_code_for(554), "5.7.1");
        assert_eq!(status_code_for(530), "5.0.0");
    }

    #[test]
    fn bounce_structure() {
        let recipients = vec!["bob@other.test".to_string()];
        let bounce = build_bounce(&BounceInput {
            hostname: "mail.example.com",
            original_sender: "alice@example.com",
            failed_recipients: &recipients,
            reply_code: 550,
            reply_text: "5.1.1 no such user",
            original_message: b"Subject: hi\r\nFrom: alice@example.com\r\n\r\nbody\r\n",
        });
        let text = String::from_utf8(bounce).unwrap();
        assert!(text.starts_with("From: Mail Delivery System <postmaster@mail.example.com>\r\n"));
        assert!(text.contains("To: alice@example.com\r\n"));
        assert!(text.contains("Subject: Undelivered Mail Returned to Sender\r\n"));
        assert!(text.contains("Auto-Submitted: auto-replied\r\n"));
        assert!(text.contains("multipart/report; report-type=delivery-status"));
        assert!(text.contains("Content-Type: message/delivery-status\r\n"));
        assert!(text.contains("Status: 5.1.1\r\n"));
        assert!(text.contains("Final-Recipient: rfc822; bob@other.test\r\n"));
        assert!(text.contains("Subject: hi\r\n"));
        // the body of the original message is not echoed
        assert!(!text.contains("\r\nbody"));
    }

    #[test]
    fn long_headers_are_truncated() {
        let mut original = Vec::new();
        for i in 0..200 {
            original.extend_from_slice(format!("X-Filler-{}: {}\r\n", i, "y".repeat(80)).as_bytes());
        }
        original.extend_from_slice(b"\r\nbody\r\n");
        let recipients = vec!["bob@other.test".to_string()];
        let bounce = build_bounce(&BounceInput {
            hostname: "mail.example.com",
            original_sender: "alice@example.com",
            failed_recipients: &recipients,
            reply_code: 554,
            reply_text: "rejected",
            original_message: &original,
        });
        let text = String::from_utf8(bounce).unwrap();
        assert!(text.contains(TRUNCATION_MARKER));
    }
}
