//! FETCH / SEARCH / LIST response decoding on top of the value tokenizer.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::rfc2047::decode_encoded_words;
use super::{parse_line, ImapValue};
use crate::model::{clean_message_id, parse_references, Address, Attachment, Message};

/// Decoded pieces of one untagged FETCH response, before assembly into a
/// [`Message`].
#[derive(Debug, Default)]
pub struct RawFetch {
    pub uid: u32,
    pub flags: Vec<String>,
    pub envelope: Option<ImapValue>,
    pub bodystructure: Option<ImapValue>,
    /// Literal from a `BODY[HEADER...]` section.
    pub header_block: String,
    /// Literal from `BODY[]` (full RFC 822 message).
    pub body_full: String,
    /// Literal from `BODY[TEXT]`.
    pub body_text: String,
}

/// Splits one `* n FETCH (...)` line into its keyed items. Lines that are not
/// fetch responses yield None.
pub fn parse_fetch_line(line: &str) -> Option<RawFetch> {
    let values = parse_line(line);
    let mut iter = values.iter();
    // "* <seq> FETCH" prefix.
    let star = iter.next()?;
    if star.as_str() != "*" {
        return None;
    }
    let _seq = iter.next()?;
    if !iter.next()?.as_str().eq_ignore_ascii_case("FETCH") {
        return None;
    }
    let items = iter.next()?.as_list();

    let mut raw = RawFetch::default();
    let mut i = 0;
    while i < items.len() {
        let key = items.get(i).map(|v| v.as_str().to_ascii_uppercase());
        let Some(key) = key else { break };
        let value = items.get(i + 1);
        match key.as_str() {
            "UID" => raw.uid = value.and_then(|v| v.as_u32()).unwrap_or(0),
            "FLAGS" => {
                raw.flags = value
                    .map(|v| {
                        v.as_list()
                            .iter()
                            .filter(|f| !f.as_str().is_empty())
                            .map(|f| f.as_str().to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            }
            "ENVELOPE" => raw.envelope = value.cloned(),
            "BODYSTRUCTURE" | "BODY" if matches!(value, Some(ImapValue::List(_))) => {
                raw.bodystructure = value.cloned()
            }
            _ if key.starts_with("BODY[") => {
                let section = key
                    .trim_start_matches("BODY[")
                    .split(']')
                    .next()
                    .unwrap_or("");
                let text = value.map(|v| v.as_str().to_string()).unwrap_or_default();
                if section.starts_with("HEADER") {
                    raw.header_block = text;
                } else if section == "TEXT" {
                    raw.body_text = text;
                } else if section.is_empty() {
                    raw.body_full = text;
                }
            }
            _ => {}
        }
        i += 2;
    }
    Some(raw)
}

/// Assembles a [`Message`] from one decoded fetch. Missing or malformed
/// fields degrade to empty values; only a missing UID drops the message.
pub fn message_from_fetch(raw: &RawFetch, folder: &str, account_id: &str) -> Option<Message> {
    if raw.uid == 0 {
        return None;
    }

    let mut msg = Message {
        uid: raw.uid,
        folder: folder.to_string(),
        account_id: account_id.to_string(),
        flags: raw.flags.clone(),
        ..Message::default()
    };

    if let Some(env) = &raw.envelope {
        apply_envelope(&mut msg, env.as_list());
        msg.envelope = env.to_string();
    }

    if let Some(bs) = &raw.bodystructure {
        msg.has_attachments = has_attachments(bs);
        let mut attachments = Vec::new();
        collect_attachments(bs, "", &mut attachments);
        msg.attachments = attachments;
        msg.bodystructure = bs.to_string();
    }

    if !raw.header_block.is_empty() {
        msg.headers = raw.header_block.clone();
        apply_header_block(&mut msg, &raw.header_block);
    }

    if !raw.body_full.is_empty() {
        let (text, html) = extract_bodies(raw.body_full.as_bytes());
        msg.body_text = text;
        msg.body_html = html;
    } else if !raw.body_text.is_empty() {
        msg.body_text = raw.body_text.clone();
    }

    msg.derive_fields();
    Some(msg)
}

/// Decodes a batch of response lines from a FETCH into messages. Lines that
/// fail to decode are logged and skipped; they never abort the batch.
pub fn messages_from_fetch_lines(lines: &[String], folder: &str, account_id: &str) -> Vec<Message> {
    let mut out = Vec::new();
    for line in lines {
        if !line.to_ascii_uppercase().contains(" FETCH ") {
            continue;
        }
        match parse_fetch_line(line).and_then(|raw| message_from_fetch(&raw, folder, account_id)) {
            Some(msg) => out.push(msg),
            None => warn!(folder = %folder, "Skipping undecodable fetch response line"),
        }
    }
    debug!(folder = %folder, count = out.len(), "Decoded fetch batch");
    out
}

/// ENVELOPE is (date subject from sender reply-to to cc bcc in-reply-to
/// message-id); any element may be NIL.
fn apply_envelope(msg: &mut Message, env: &[ImapValue]) {
    let field = |i: usize| env.get(i).map(|v| v.as_str()).unwrap_or("");

    msg.date = parse_envelope_date(field(0));
    msg.subject = decode_encoded_words(field(1));
    msg.sender = addresses(env.get(2)).into_iter().next().unwrap_or_default();
    msg.reply_to = addresses(env.get(4));
    msg.to = addresses(env.get(5));
    msg.cc = addresses(env.get(6));
    msg.bcc = addresses(env.get(7));
    msg.in_reply_to = clean_message_id(field(8));
    msg.message_id = clean_message_id(field(9));
}

fn parse_envelope_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// An address list is a list of (name adl mailbox host) quadruples. Parts
/// missing name or mailbox/host emit empty strings instead of failing.
fn addresses(value: Option<&ImapValue>) -> Vec<Address> {
    let Some(ImapValue::List(items)) = value else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in items {
        let quad = item.as_list();
        if quad.is_empty() {
            continue;
        }
        let part = |i: usize| quad.get(i).map(|v| v.as_str()).unwrap_or("");
        let name = decode_encoded_words(part(0));
        let mailbox = part(2);
        let host = part(3);
        // RFC 3501 group syntax markers carry neither mailbox nor host.
        if mailbox.is_empty() && host.is_empty() && name.is_empty() {
            continue;
        }
        let email = if !mailbox.is_empty() && !host.is_empty() {
            format!("{}@{}", mailbox, host)
        } else if !mailbox.is_empty() {
            mailbox.to_string()
        } else {
            String::new()
        };
        out.push(Address { name, email });
    }
    out
}

fn is_multipart(parts: &[ImapValue]) -> bool {
    matches!(parts.first(), Some(ImapValue::List(_)))
}

/// More than one body part means the message carries something beyond its
/// main text part.
pub fn has_attachments(bs: &ImapValue) -> bool {
    let parts = bs.as_list();
    is_multipart(parts)
        && parts
            .iter()
            .filter(|p| matches!(p, ImapValue::List(_)))
            .count()
            > 1
}

/// Walks a BODYSTRUCTURE tree collecting attachment-bearing leaf parts.
/// Part ids are dotted paths ("2", "2.1") as used in FETCH section specs.
fn collect_attachments(value: &ImapValue, prefix: &str, out: &mut Vec<Attachment>) {
    let parts = value.as_list();
    if parts.is_empty() {
        return;
    }

    if is_multipart(parts) {
        let mut index = 0;
        for child in parts {
            if matches!(child, ImapValue::List(_)) {
                index += 1;
                let part_id = if prefix.is_empty() {
                    index.to_string()
                } else {
                    format!("{}.{}", prefix, index)
                };
                collect_attachments(child, &part_id, out);
            }
        }
        return;
    }

    // Leaf: (type subtype (params...) content-id description encoding size
    //        ...extensions incl. (disposition (params...)))
    let field = |i: usize| parts.get(i).map(|v| v.as_str()).unwrap_or("");
    let content_type = format!("{}/{}", field(0), field(1)).to_ascii_lowercase();
    let name_param = param(parts.get(2), "NAME");
    let content_id = clean_message_id(field(3));
    let size = parts.get(6).and_then(|v| v.as_u32()).unwrap_or(0);

    let mut disposition = String::new();
    let mut disp_filename = String::new();
    for ext in parts.iter().skip(7) {
        let ext_items = ext.as_list();
        if let Some(first) = ext_items.first() {
            let kind = first.as_str().to_ascii_lowercase();
            if kind == "attachment" || kind == "inline" {
                disposition = kind;
                disp_filename = param(ext_items.get(1), "FILENAME");
                break;
            }
        }
    }

    let filename = if !disp_filename.is_empty() {
        disp_filename
    } else {
        name_param
    };

    let is_attachment = disposition == "attachment" || !filename.is_empty();
    let is_inline = disposition == "inline";
    if !is_attachment && !(is_inline && !content_id.is_empty()) {
        return;
    }

    out.push(Attachment {
        filename: decode_encoded_words(&filename),
        content_type,
        size,
        part_id: if prefix.is_empty() { "1".to_string() } else { prefix.to_string() },
        is_inline,
        content_id,
        downloaded: false,
        local_path: String::new(),
    });
}

/// Looks up one key in an alternating key/value parameter list.
fn param(params: Option<&ImapValue>, key: &str) -> String {
    let Some(ImapValue::List(items)) = params else {
        return String::new();
    };
    let mut i = 0;
    while i + 1 < items.len() {
        if items[i].as_str().eq_ignore_ascii_case(key) {
            return items[i + 1].as_str().to_string();
        }
        i += 2;
    }
    String::new()
}

/// Pulls thread-linkage headers out of a raw header block.
fn apply_header_block(msg: &mut Message, block: &str) {
    let Ok((headers, _)) = mailparse::parse_headers(block.as_bytes()) else {
        return;
    };
    let get = |name: &str| -> String {
        headers
            .iter()
            .find(|h| h.get_key().eq_ignore_ascii_case(name))
            .map(|h| h.get_value())
            .unwrap_or_default()
    };

    let references = get("References");
    if !references.is_empty() {
        msg.references = parse_references(&references);
    }
    let in_reply_to = get("In-Reply-To");
    if !in_reply_to.is_empty() {
        if let Some(id) = parse_references(&in_reply_to).into_iter().next() {
            msg.in_reply_to = id;
        }
    }
    if msg.message_id.is_empty() {
        msg.message_id = clean_message_id(&get("Message-ID"));
    }
    if msg.subject.is_empty() {
        let subject = get("Subject");
        if !subject.is_empty() {
            msg.subject = decode_encoded_words(&subject);
        }
    }
    // The in-reply-to parent belongs on the reference chain even when the
    // References header is missing.
    if !msg.in_reply_to.is_empty() && !msg.references.contains(&msg.in_reply_to) {
        msg.references.push(msg.in_reply_to.clone());
    }
}

/// Extracts text/plain and text/html bodies from a full RFC 822 payload.
fn extract_bodies(raw: &[u8]) -> (String, String) {
    let Ok(parsed) = mailparse::parse_mail(raw) else {
        return (String::from_utf8_lossy(raw).into_owned(), String::new());
    };
    let mut text = String::new();
    let mut html = String::new();
    walk_parts(&parsed, &mut text, &mut html);
    (text, html)
}

fn walk_parts(part: &mailparse::ParsedMail, text: &mut String, html: &mut String) {
    if part.subparts.is_empty() {
        let mime = part.ctype.mimetype.to_ascii_lowercase();
        if mime == "text/plain" && text.is_empty() {
            *text = part.get_body().unwrap_or_default();
        } else if mime == "text/html" && html.is_empty() {
            *html = part.get_body().unwrap_or_default();
        }
        return;
    }
    for sub in &part.subparts {
        walk_parts(sub, text, html);
    }
}

/// UIDs from `* SEARCH n n n ...` lines. MODSEQ modifiers and other
/// parenthesized trailers are ignored.
pub fn parse_search_uids(lines: &[String]) -> Vec<u32> {
    let mut out = Vec::new();
    for line in lines {
        let values = parse_line(line);
        let mut saw_search = false;
        for value in values {
            if saw_search {
                if let Some(uid) = value.as_u32() {
                    out.push(uid);
                }
            } else if value.as_str().eq_ignore_ascii_case("SEARCH") {
                saw_search = true;
            }
        }
    }
    out
}

/// Folder names from `* LIST (attrs) delim name` lines, in server order.
/// Folders flagged \Noselect are dropped.
pub fn parse_folder_list(lines: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for line in lines {
        let values = parse_line(line);
        let list_pos = values
            .iter()
            .position(|v| v.as_str().eq_ignore_ascii_case("LIST"));
        let Some(pos) = list_pos else { continue };

        if let Some(attrs) = values.get(pos + 1) {
            let noselect = attrs
                .as_list()
                .iter()
                .any(|a| a.as_str().eq_ignore_ascii_case("\\Noselect"));
            if noselect {
                continue;
            }
        }
        if let Some(name) = values.last() {
            let name = name.as_str().to_string();
            if !name.is_empty() && !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_line() -> String {
        concat!(
            "* 12 FETCH (UID 4101 FLAGS (\\Seen \\Answered) ",
            "ENVELOPE (\"Tue, 14 Jul 2026 10:52:37 +0200\" ",
            "\"=?UTF-8?Q?Caf=C3=A9_plans?=\" ",
            "((\"Alice A\" NIL \"alice\" \"example.com\")) ",
            "((\"Alice A\" NIL \"alice\" \"example.com\")) ",
            "NIL ",
            "((NIL NIL \"bob\" \"example.org\") (\"Carol\" NIL \"carol\" NIL)) ",
            "NIL NIL \"<parent@example.com>\" \"<child@example.com>\") ",
            "BODYSTRUCTURE ((\"text\" \"plain\" (\"charset\" \"utf-8\") NIL NIL \"7bit\" 345 12 NIL NIL NIL) ",
            "(\"application\" \"pdf\" (\"name\" \"q3.pdf\") NIL NIL \"base64\" 1024 NIL ",
            "(\"attachment\" (\"filename\" \"q3.pdf\")) NIL) \"mixed\") ",
            "BODY[HEADER.FIELDS (REFERENCES IN-REPLY-TO MESSAGE-ID)] {55}",
            "References: <root@example.com> <parent@example.com>\r\n\r\n)",
        )
        .to_string()
    }

    #[test]
    fn decodes_full_fetch_line() {
        let raw = parse_fetch_line(&fetch_line()).expect("fetch line");
        assert_eq!(raw.uid, 4101);
        assert_eq!(raw.flags, vec!["\\Seen", "\\Answered"]);

        let msg = message_from_fetch(&raw, "INBOX", "a@x.com").expect("message");
        assert_eq!(msg.subject, "Café plans");
        assert_eq!(msg.sender.email, "alice@example.com");
        assert_eq!(msg.sender.name, "Alice A");
        assert_eq!(msg.to.len(), 2);
        assert_eq!(msg.to[0].email, "bob@example.org");
        assert_eq!(msg.to[0].name, "");
        // Missing host degrades to the bare mailbox, not a failure.
        assert_eq!(msg.to[1].email, "carol");
        assert_eq!(msg.message_id, "child@example.com");
        assert_eq!(msg.in_reply_to, "parent@example.com");
        assert!(msg.is_read);
        assert!(msg.is_answered);
        assert!(!msg.is_flagged);
        assert!(msg.has_attachments);
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].filename, "q3.pdf");
        assert_eq!(msg.attachments[0].content_type, "application/pdf");
        assert_eq!(msg.attachments[0].part_id, "2");
        assert_eq!(
            msg.references,
            vec!["root@example.com", "parent@example.com"]
        );
        assert!(msg.date.is_some());
    }

    #[test]
    fn malformed_envelope_degrades_to_empty_fields() {
        let line = "* 3 FETCH (UID 9 ENVELOPE (NIL NIL NIL) FLAGS ())";
        let raw = parse_fetch_line(line).expect("fetch line");
        let msg = message_from_fetch(&raw, "INBOX", "a@x.com").expect("message");
        assert_eq!(msg.uid, 9);
        assert_eq!(msg.subject, "");
        assert_eq!(msg.sender, Address::default());
        assert!(msg.to.is_empty());
        assert!(!msg.is_read);
    }

    #[test]
    fn missing_uid_drops_message_without_error() {
        let line = "* 3 FETCH (FLAGS (\\Seen))";
        let raw = parse_fetch_line(line).expect("fetch line");
        assert!(message_from_fetch(&raw, "INBOX", "a@x.com").is_none());
    }

    #[test]
    fn single_part_bodystructure_has_no_attachments() {
        let line = "* 1 FETCH (UID 5 BODYSTRUCTURE (\"text\" \"plain\" (\"charset\" \"utf-8\") NIL NIL \"7bit\" 200 10))";
        let raw = parse_fetch_line(line).expect("fetch line");
        let msg = message_from_fetch(&raw, "INBOX", "a@x.com").expect("message");
        assert!(!msg.has_attachments);
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn search_lines_yield_uids_ignoring_modseq() {
        let lines = vec!["* SEARCH 101 102 205 (MODSEQ 9387530)".to_string()];
        assert_eq!(parse_search_uids(&lines), vec![101, 102, 205]);
        assert!(parse_search_uids(&["* SEARCH".to_string()]).is_empty());
    }

    #[test]
    fn folder_list_skips_noselect_and_keeps_order() {
        let lines = vec![
            "* LIST (\\HasNoChildren) \"/\" \"INBOX\"".to_string(),
            "* LIST (\\Noselect \\HasChildren) \"/\" \"[Gmail]\"".to_string(),
            "* LIST (\\HasNoChildren) \"/\" \"Archive/2026\"".to_string(),
        ];
        assert_eq!(parse_folder_list(&lines), vec!["INBOX", "Archive/2026"]);
    }
}
