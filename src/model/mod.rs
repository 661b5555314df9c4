//! Mail domain model: value types for messages, attachments and threads, plus
//! the pure derivations (subject normalization, reference extraction, display
//! dates) the rest of the engine builds on.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub email: String,
}

impl Address {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Display name, falling back to the address itself.
    pub fn display(&self) -> &str {
        if self.name.is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u32,
    pub part_id: String,
    pub is_inline: bool,
    pub content_id: String,
    pub downloaded: bool,
    pub local_path: String,
}

/// One cached message. Identity key is (uid, folder, account_id).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub uid: u32,
    pub folder: String,
    pub account_id: String,
    pub message_id: String,
    pub subject: String,
    pub sender: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub date: Option<DateTime<Utc>>,
    pub flags: Vec<String>,
    pub is_read: bool,
    pub is_flagged: bool,
    pub is_deleted: bool,
    pub is_draft: bool,
    pub is_answered: bool,
    pub has_attachments: bool,
    pub body_text: String,
    pub body_html: String,
    /// Raw header block as fetched from the server, when available.
    pub headers: String,
    /// Wire snapshots kept for diagnostics and re-parsing.
    pub envelope: String,
    pub bodystructure: String,
    /// Normalized subject used for conversation grouping.
    pub thread_subject: String,
    /// Ordered, de-duplicated message-id tokens from References.
    pub references: Vec<String>,
    pub in_reply_to: String,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Re-derives the flag booleans and thread-linkage fields from the raw
    /// `flags`, `subject` and `headers` currently set on the message.
    pub fn derive_fields(&mut self) {
        self.is_read = has_flag(&self.flags, "\\Seen");
        self.is_flagged = has_flag(&self.flags, "\\Flagged");
        self.is_deleted = has_flag(&self.flags, "\\Deleted");
        self.is_draft = has_flag(&self.flags, "\\Draft");
        self.is_answered = has_flag(&self.flags, "\\Answered");
        self.thread_subject = normalize_subject(&self.subject);
    }
}

pub fn has_flag(flags: &[String], flag: &str) -> bool {
    flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
}

/// A conversation derived from a message set. Rebuilt on demand, never stored
/// as authoritative state.
#[derive(Clone, Debug, Default)]
pub struct Thread {
    /// Normalized subject shared by the membership (or seeded by the first
    /// member when grouping happened via reference chains).
    pub subject: String,
    /// Members sorted by date ascending; undated members first.
    pub messages: Vec<Message>,
    /// Participant email -> display name. Later entries overwrite earlier
    /// names for the same address.
    pub participants: HashMap<String, String>,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub unread_count: usize,
    pub is_flagged: bool,
    pub has_attachments: bool,
}

static REPLY_PREFIX: Lazy<Regex> = Lazy::new(|| {
    // Localized reply/forward markers, optionally numbered ("Re[2]:"), ending
    // in an ASCII or fullwidth colon.
    Regex::new(r"(?i)^\s*(re|fwd|fw|aw|antw|wg|sv|回复|回覆|转发|答复|轉寄)(\s*\[\d+\])?\s*[:：]\s*")
        .unwrap()
});

static TRAILING_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*(\[[^\[\]]*\]|\([^()]*\))\s*$").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strips leading reply/forward prefixes (repeatedly) and trailing bracketed
/// or parenthesized list tags, collapsing interior whitespace.
///
/// `normalize_subject("Fwd: Re: Budget [Internal]")` == `"Budget"`.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim().to_string();

    loop {
        let stripped = REPLY_PREFIX.replace(&s, "").into_owned();
        if stripped == s {
            break;
        }
        s = stripped;
    }

    // Trailing tags are only stripped while a non-empty core remains, so a
    // subject that is nothing but a tag survives.
    while let Some(m) = TRAILING_TAG.find(&s) {
        let remainder = s[..m.start()].trim_end();
        if remainder.is_empty() {
            break;
        }
        s.truncate(m.start());
    }

    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

static MSG_ID_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^<>]+)>").unwrap());

/// Extracts `<...>` message-id tokens from a References or In-Reply-To header
/// value, de-duplicating while preserving first-seen order. Tokens are
/// returned without the surrounding angle brackets.
pub fn parse_references(header: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for cap in MSG_ID_TOKEN.captures_iter(header) {
        let id = cap[1].trim().to_string();
        if !id.is_empty() && seen.insert(id.clone()) {
            out.push(id);
        }
    }
    out
}

/// Strips angle brackets and whitespace from a single message-id so stored
/// ids compare equal to reference tokens.
pub fn clean_message_id(raw: &str) -> String {
    raw.trim().trim_start_matches('<').trim_end_matches('>').trim().to_string()
}

/// Buckets a timestamp for list display, relative to wall-clock now.
pub fn display_date(ts: DateTime<Utc>) -> String {
    format_display_date(ts, Utc::now())
}

/// Same-day -> "HH:MM", yesterday -> "Yesterday", under a week -> weekday
/// name, under a year -> "Mon DD", otherwise "Mon DD, YYYY".
pub fn format_display_date(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let days = (now.date_naive() - ts.date_naive()).num_days();
    if days <= 0 {
        ts.format("%H:%M").to_string()
    } else if days == 1 {
        "Yesterday".to_string()
    } else if days < 7 {
        ts.format("%A").to_string()
    } else if days < 365 {
        ts.format("%b %d").to_string()
    } else {
        ts.format("%b %d, %Y").to_string()
    }
}
