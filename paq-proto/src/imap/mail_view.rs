//! Builds the FETCH data items for one message.

use std::num::NonZeroU32;

use anyhow::{anyhow, bail, Result};
use chrono::{Offset, TimeZone, Utc};
use imap_codec::imap_types::core::{AString, NString};
use imap_codec::imap_types::datetime::DateTime;
use imap_codec::imap_types::fetch::{MessageDataItem, MessageDataItemName, Section};
use imap_codec::imap_types::response::Data;
use mail_parser::{Message, MessageParser, PartType};

use crate::imap::attributes::AttributesProxy;
use crate::imap::flags;
use crate::imap::imf_view;
use crate::imap::index::MailIndex;
use crate::imap::response::Body;

pub enum SeenFlag {
    DoNothing,
    MustAdd,
}

pub struct MailView<'a> {
    pub in_idx: &'a MailIndex<'a>,
    pub raw: Option<&'a [u8]>,
}

impl<'a> MailView<'a> {
    pub fn new(in_idx: &'a MailIndex<'a>, raw: Option<&'a [u8]>) -> Self {
        Self { in_idx, raw }
    }

    pub fn filter(&self, ap: &AttributesProxy) -> Result<(Body<'static>, SeenFlag)> {
        let mut seen = SeenFlag::DoNothing;
        let res_attrs = ap
            .attrs
            .iter()
            .map(|attr| match attr {
                MessageDataItemName::Uid => Ok(self.uid()),
                MessageDataItemName::Flags => Ok(self.flags()),
                MessageDataItemName::Rfc822Size => Ok(self.rfc_822_size()),
                MessageDataItemName::InternalDate => self.internal_date(),
                MessageDataItemName::Envelope => self.envelope(),
                MessageDataItemName::Rfc822 => {
                    seen = SeenFlag::MustAdd;
                    self.rfc822()
                }
                MessageDataItemName::Rfc822Header => self.rfc_822_header(),
                MessageDataItemName::Rfc822Text => {
                    seen = SeenFlag::MustAdd;
                    self.rfc_822_text()
                }
                MessageDataItemName::BodyExt {
                    section,
                    partial,
                    peek,
                } => {
                    if !peek && !self.in_idx.is_flag_set(paq_mail::flags::FLAG_SEEN) {
                        seen = SeenFlag::MustAdd;
                    }
                    self.body_ext(section, partial)
                }
                MessageDataItemName::Body | MessageDataItemName::BodyStructure => {
                    bail!("BODYSTRUCTURE is not supported")
                }
                other => bail!("FETCH item {:?} is not supported", other),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((
            Body::Data(Data::Fetch {
                seq: self.in_idx.i,
                items: res_attrs.try_into()?,
            }),
            seen,
        ))
    }

    fn uid(&self) -> MessageDataItem<'static> {
        MessageDataItem::Uid(self.in_idx.uid)
    }

    fn flags(&self) -> MessageDataItem<'static> {
        MessageDataItem::Flags(flags::fetch_flags(self.in_idx.row))
    }

    fn rfc_822_size(&self) -> MessageDataItem<'static> {
        MessageDataItem::Rfc822Size(self.in_idx.row.size_bytes as u32)
    }

    fn internal_date(&self) -> Result<MessageDataItem<'static>> {
        let dt = Utc
            .fix()
            .timestamp_opt(self.in_idx.row.internal_date / 1000, 0)
            .earliest()
            .ok_or(anyhow!("unable to represent internal date"))?;
        let dt = DateTime::try_from(dt).map_err(|e| anyhow!("internal date: {}", e))?;
        Ok(MessageDataItem::InternalDate(dt))
    }

    fn raw(&self) -> Result<&[u8]> {
        self.raw
            .ok_or_else(|| anyhow!("message body was not loaded"))
    }

    fn parsed(&self) -> Result<Message<'_>> {
        MessageParser::new()
            .parse(self.raw()?)
            .ok_or_else(|| anyhow!("unparsable message"))
    }

    fn envelope(&self) -> Result<MessageDataItem<'static>> {
        Ok(MessageDataItem::Envelope(imf_view::message_envelope(
            &self.parsed()?,
        )))
    }

    fn rfc822(&self) -> Result<MessageDataItem<'static>> {
        let full: NString = self.raw()?.to_vec().try_into()?;
        Ok(MessageDataItem::Rfc822(full))
    }

    fn rfc_822_header(&self) -> Result<MessageDataItem<'static>> {
        let hdrs: NString = header_block(self.raw()?).to_vec().try_into()?;
        Ok(MessageDataItem::Rfc822Header(hdrs))
    }

    fn rfc_822_text(&self) -> Result<MessageDataItem<'static>> {
        let txt: NString = body_block(self.raw()?).to_vec().try_into()?;
        Ok(MessageDataItem::Rfc822Text(txt))
    }

    /// BODY[<section>]<<partial>> and BODY.PEEK[...]; the \Seen side
    /// effect is handled by the caller.
    fn body_ext(
        &self,
        section: &Option<Section<'static>>,
        partial: &Option<(u32, NonZeroU32)>,
    ) -> Result<MessageDataItem<'static>> {
        let raw = self.raw()?;
        let full = match section {
            None => Some(raw.to_vec()),
            Some(Section::Header(None)) => Some(header_block(raw).to_vec()),
            Some(Section::Text(None)) => Some(body_block(raw).to_vec()),
            Some(Section::HeaderFields(None, names)) => {
                Some(filter_headers(raw, names.as_ref(), true))
            }
            Some(Section::HeaderFieldsNot(None, names)) => {
                Some(filter_headers(raw, names.as_ref(), false))
            }
            Some(Section::Part(part)) => {
                let path: Vec<u32> = part.0.as_ref().iter().map(|n| n.get()).collect();
                part_bytes(&self.parsed()?, &path)
            }
            Some(other) => {
                tracing::debug!(section = ?other, "unsupported body section");
                None
            }
        };

        let (data, origin): (NString, Option<u32>) = match full {
            None => (NString(None), None),
            Some(bytes) => match partial {
                None => (bytes.try_into()?, None),
                Some((start, len)) => {
                    let start_idx = (*start as usize).min(bytes.len());
                    let end_idx = (start_idx + len.get() as usize).min(bytes.len());
                    (bytes[start_idx..end_idx].to_vec().try_into()?, Some(*start))
                }
            },
        };

        Ok(MessageDataItem::BodyExt {
            section: section.clone(),
            origin,
            data,
        })
    }
}

/// The header block including the delimiting blank line.
fn header_block(raw: &[u8]) -> &[u8] {
    match find_body_offset(raw) {
        Some(offset) => &raw[..offset],
        None => raw,
    }
}

/// Everything after the blank line.
fn body_block(raw: &[u8]) -> &[u8] {
    match find_body_offset(raw) {
        Some(offset) => &raw[offset..],
        None => &[],
    }
}

fn find_body_offset(raw: &[u8]) -> Option<usize> {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    raw.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

/// HEADER.FIELDS / HEADER.FIELDS.NOT over the raw header block,
/// folding-aware, with the delimiting blank line appended.
fn filter_headers(raw: &[u8], names: &[AString<'_>], include: bool) -> Vec<u8> {
    let wanted: Vec<String> = names
        .iter()
        .map(|n| String::from_utf8_lossy(n.as_ref()).to_lowercase())
        .collect();

    let mut out = Vec::new();
    let mut keeping = false;
    for line in header_block(raw).split_inclusive(|&b| b == b'\n') {
        let trimmed: &[u8] = {
            let l = line.strip_suffix(b"\n").unwrap_or(line);
            l.strip_suffix(b"\r").unwrap_or(l)
        };
        if trimmed.is_empty() {
            break;
        }
        if line.starts_with(b" ") || line.starts_with(b"\t") {
            if keeping {
                out.extend_from_slice(line);
            }
            continue;
        }
        let name = match trimmed.iter().position(|&b| b == b':') {
            Some(colon) => String::from_utf8_lossy(&trimmed[..colon]).trim().to_lowercase(),
            None => String::new(),
        };
        keeping = wanted.contains(&name) == include;
        if keeping {
            out.extend_from_slice(line);
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Resolves a numeric section path (`1`, `2.1`, ...) to decoded part
/// content, best effort: multipart children by position, a lone `1` on
/// a non-multipart message is the message body itself.
fn part_bytes(message: &Message<'_>, path: &[u32]) -> Option<Vec<u8>> {
    let mut part_id: usize = 0;
    for (depth, &step) in path.iter().enumerate() {
        let part = message.part(part_id)?;
        match &part.body {
            PartType::Multipart(children) => {
                part_id = *children.get(step.checked_sub(1)? as usize)?;
            }
            _ if depth == 0 && step == 1 => {
                // single-part message: section 1 is the body
            }
            _ => return None,
        }
    }
    let part = message.part(part_id)?;
    match &part.body {
        PartType::Text(t) => Some(t.as_bytes().to_vec()),
        PartType::Html(t) => Some(t.as_bytes().to_vec()),
        PartType::Binary(b) | PartType::InlineBinary(b) => Some(b.to_vec()),
        PartType::Message(_) | PartType::Multipart(_) => Some(part.contents().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: a@a.a\r\nSubject: hi\r\nX-Skip: y\r\n\r\nbody text\r\n";

    #[test]
    fn header_body_split() {
        assert_eq!(
            header_block(RAW),
            b"From: a@a.a\r\nSubject: hi\r\nX-Skip: y\r\n\r\n"
        );
        assert_eq!(body_block(RAW), b"body text\r\n");
    }

    #[test]
    fn header_field_filtering() {
        let names = vec![AString::try_from("subject").unwrap()];
        let kept = filter_headers(RAW, &names, true);
        assert_eq!(kept, b"Subject: hi\r\n\r\n");
        let dropped = filter_headers(RAW, &names, false);
        assert!(String::from_utf8_lossy(&dropped).contains("From: a@a.a"));
        assert!(!String::from_utf8_lossy(&dropped).contains("Subject"));
    }
}
