//! ENVELOPE construction per RFC 3501 §7.4.2: sender and reply-to fall
//! back to from; absent date/subject/in-reply-to/message-id are NIL.

use imap_codec::imap_types::core::{IString, NString};
use imap_codec::imap_types::envelope::{Address as ImapAddress, Envelope};
use mail_parser::{Address, HeaderValue, Message};

pub fn message_envelope(message: &Message<'_>) -> Envelope<'static> {
    let from = convert_addresses(message.from());

    Envelope {
        date: nstring(message.date().map(|d| d.to_rfc3339())),
        subject: nstring(message.subject().map(|s| s.to_string())),
        from: from.clone(),
        sender: {
            let sender = convert_addresses(message.sender());
            if sender.is_empty() {
                from.clone()
            } else {
                sender
            }
        },
        reply_to: {
            let reply_to = convert_addresses(message.reply_to());
            if reply_to.is_empty() {
                from.clone()
            } else {
                reply_to
            }
        },
        to: convert_addresses(message.to()),
        cc: convert_addresses(message.cc()),
        bcc: convert_addresses(message.bcc()),
        in_reply_to: nstring(header_text(message, "In-Reply-To")),
        message_id: nstring(message.message_id().map(|s| format!("<{}>", s))),
    }
}

fn convert_addresses(addr: Option<&Address<'_>>) -> Vec<ImapAddress<'static>> {
    let mut out = Vec::new();
    if let Some(addr) = addr {
        for a in addr.iter() {
            let spec = a.address.as_deref().unwrap_or("");
            let (local, host) = match spec.rsplit_once('@') {
                Some((l, h)) => (l, h),
                None => (spec, ""),
            };
            out.push(ImapAddress {
                name: nstring(a.name.as_ref().map(|n| n.to_string())),
                adl: NString(None),
                mailbox: nstring(Some(local.to_string())),
                host: nstring(Some(host.to_string())),
            });
        }
    }
    out
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

fn nstring(value: Option<String>) -> NString<'static> {
    NString(value.and_then(|v| IString::try_from(v).ok()))
}
