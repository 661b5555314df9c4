//! IMAP response parser.
//!
//! Wire fragments (ENVELOPE, BODYSTRUCTURE, FLAGS, literal header/body
//! blocks) are decoded into domain [`Message`](crate::model::Message) values
//! by a small recursive-descent reader rather than index arithmetic, so
//! malformed input degrades structurally: unparsable fields become empty
//! strings or empty lists, never a panic or a lost batch.

mod envelope;
mod rfc2047;

pub use envelope::{
    message_from_fetch, messages_from_fetch_lines, parse_fetch_line, parse_folder_list,
    parse_search_uids, RawFetch,
};
pub use rfc2047::decode_encoded_words;

use std::fmt;

/// One node of a parenthesized IMAP response structure.
#[derive(Clone, Debug, PartialEq)]
pub enum ImapValue {
    Nil,
    /// Bare atom, including bracketed sections like `BODY[HEADER]`.
    Atom(String),
    /// Quoted string or literal contents.
    Text(String),
    List(Vec<ImapValue>),
}

impl ImapValue {
    pub fn as_str(&self) -> &str {
        match self {
            ImapValue::Atom(s) | ImapValue::Text(s) => s,
            _ => "",
        }
    }

    pub fn as_list(&self) -> &[ImapValue] {
        match self {
            ImapValue::List(items) => items,
            _ => &[],
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ImapValue::Nil)
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_str().parse().ok()
    }
}

impl fmt::Display for ImapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImapValue::Nil => write!(f, "NIL"),
            ImapValue::Atom(s) => write!(f, "{}", s),
            ImapValue::Text(s) => write!(f, "{:?}", s),
            ImapValue::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Cursor over one response line. Literal markers `{N}` are expected to be
/// followed inline by the N literal bytes, which is how the transport splices
/// responses back together.
pub struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\r') | Some(b'\n')) {
            self.pos += 1;
        }
    }

    pub fn at_end(&mut self) -> bool {
        self.skip_spaces();
        self.pos >= self.input.len()
    }

    /// Reads the next value. Returns `None` at end of input or at a stray
    /// closing parenthesis (which is consumed by the enclosing list reader).
    pub fn read_value(&mut self) -> Option<ImapValue> {
        self.skip_spaces();
        match self.peek()? {
            b'(' => {
                self.advance();
                Some(self.read_list())
            }
            b')' => None,
            b'"' => {
                self.advance();
                Some(ImapValue::Text(self.read_quoted()))
            }
            b'{' => {
                self.advance();
                Some(ImapValue::Text(self.read_literal()))
            }
            _ => Some(self.read_atom()),
        }
    }

    fn read_list(&mut self) -> ImapValue {
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                // Tolerate a missing close paren at end of input.
                None => break,
                Some(b')') => {
                    self.advance();
                    break;
                }
                _ => match self.read_value() {
                    Some(v) => items.push(v),
                    None => break,
                },
            }
        }
        ImapValue::List(items)
    }

    fn read_quoted(&mut self) -> String {
        let mut out = Vec::new();
        while let Some(b) = self.advance() {
            match b {
                b'\\' => {
                    // IMAP backslash escaping: \" and \\ only, but pass
                    // anything else through rather than failing.
                    if let Some(esc) = self.advance() {
                        out.push(esc);
                    }
                }
                b'"' => break,
                _ => out.push(b),
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn read_literal(&mut self) -> String {
        let mut digits = String::new();
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() {
                digits.push(b as char);
                self.advance();
            } else {
                break;
            }
        }
        // Closing brace, plus at most one CRLF in case the caller kept the
        // wire form instead of splicing bytes directly after the marker.
        if self.peek() == Some(b'}') {
            self.advance();
        }
        if self.peek() == Some(b'\r') {
            self.advance();
            if self.peek() == Some(b'\n') {
                self.advance();
            }
        }

        let len: usize = digits.parse().unwrap_or(0);
        let end = (self.pos + len).min(self.input.len());
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        String::from_utf8_lossy(bytes).into_owned()
    }

    fn read_atom(&mut self) -> ImapValue {
        let start = self.pos;
        let mut bracket_depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'[' => bracket_depth += 1,
                b']' => bracket_depth = bracket_depth.saturating_sub(1),
                // Inside a bracketed section (BODY[HEADER.FIELDS (...)]),
                // spaces and parens belong to the atom.
                b' ' | b'(' | b')' | b'\r' | b'\n' if bracket_depth == 0 => break,
                _ => {}
            }
            self.advance();
        }
        if self.pos == start {
            // Guarantee progress on garbage input.
            self.advance();
            return ImapValue::Atom(String::new());
        }
        let raw = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        if raw.eq_ignore_ascii_case("NIL") {
            ImapValue::Nil
        } else {
            ImapValue::Atom(raw)
        }
    }
}

/// Tokenizes a whole response line into a flat value sequence.
pub fn parse_line(line: &str) -> Vec<ImapValue> {
    let mut cursor = Cursor::new(line.as_bytes());
    let mut out = Vec::new();
    while !cursor.at_end() {
        match cursor.read_value() {
            Some(v) => out.push(v),
            // Stray ')' at top level: skip it and continue.
            None => {
                cursor.advance();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_lists_with_quoted_strings() {
        let values = parse_line(r#"(("Alice A" NIL "alice" "example.com") NIL)"#);
        assert_eq!(values.len(), 1);
        let outer = values[0].as_list();
        assert_eq!(outer.len(), 2);
        let addr = outer[0].as_list();
        assert_eq!(addr[0].as_str(), "Alice A");
        assert!(addr[1].is_nil());
        assert_eq!(addr[2].as_str(), "alice");
        assert!(outer[1].is_nil());
    }

    #[test]
    fn quoted_strings_honor_backslash_escapes() {
        let values = parse_line(r#""say \"hi\" \\ there""#);
        assert_eq!(values[0].as_str(), r#"say "hi" \ there"#);
    }

    #[test]
    fn literals_consume_exactly_their_length() {
        let values = parse_line("{5}hello WORLD");
        assert_eq!(values[0].as_str(), "hello");
        assert_eq!(values[1].as_str(), "WORLD");
    }

    #[test]
    fn bracketed_atoms_keep_embedded_sections() {
        let values = parse_line("BODY[HEADER.FIELDS (REFERENCES IN-REPLY-TO)] {4}abcd");
        assert_eq!(
            values[0].as_str(),
            "BODY[HEADER.FIELDS (REFERENCES IN-REPLY-TO)]"
        );
        assert_eq!(values[1].as_str(), "abcd");
    }

    #[test]
    fn malformed_input_degrades_instead_of_panicking() {
        // Unterminated list and truncated literal.
        let values = parse_line("(A (B \"unterminated {99}short");
        assert_eq!(values.len(), 1);
        let outer = values[0].as_list();
        assert_eq!(outer[0].as_str(), "A");
        // Stray closers and unmatched openers must terminate.
        let _ = parse_line(")))(((");
    }

    #[test]
    fn nil_atom_is_case_insensitive() {
        assert!(parse_line("nil")[0].is_nil());
        assert!(parse_line("NIL")[0].is_nil());
    }
}
