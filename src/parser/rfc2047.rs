//! RFC 2047 encoded-word decoding for header fields.
//!
//! Subjects and display names arrive as `=?charset?Q?...?=` or
//! `=?charset?B?...?=` words. Decoding is best-effort: a word that fails to
//! decode is kept verbatim, and non-UTF-8 charsets degrade lossily rather
//! than erroring.

use base64::Engine;

/// Decodes all encoded words in a header value. Whitespace between two
/// consecutive encoded words is dropped, per RFC 2047.
pub fn decode_encoded_words(text: &str) -> String {
    if !text.contains("=?") {
        return text.to_string();
    }

    let mut result = String::new();
    let mut remaining = text;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        if !before.is_empty() && !(last_was_encoded && before.trim().is_empty()) {
            result.push_str(before);
            last_was_encoded = false;
        }

        match find_word_end(&remaining[start..]) {
            Some(len) => {
                let word = &remaining[start..start + len];
                if let Some(decoded) = decode_word(word) {
                    result.push_str(&decoded);
                    last_was_encoded = true;
                } else {
                    result.push_str(word);
                    last_was_encoded = false;
                }
                remaining = &remaining[start + len..];
            }
            None => {
                result.push_str(&remaining[start..]);
                return result;
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Length of the encoded word starting at the beginning of `s`
/// (`=?charset?enc?payload?=`), or None when unterminated.
fn find_word_end(s: &str) -> Option<usize> {
    let mut question_count = 0;
    for (i, ch) in s[2..].char_indices() {
        if ch == '?' {
            question_count += 1;
            if question_count == 2 {
                let rest = &s[2 + i + 1..];
                let closing = rest.find("?=")?;
                return Some(2 + i + 1 + closing + 2);
            }
        }
    }
    None
}

fn decode_word(word: &str) -> Option<String> {
    if !word.starts_with("=?") || !word.ends_with("?=") {
        return None;
    }
    let inner = &word[2..word.len() - 2];
    let parts: Vec<&str> = inner.splitn(3, '?').collect();
    if parts.len() != 3 {
        return None;
    }

    let bytes = match parts[1].to_ascii_uppercase().as_str() {
        "Q" => {
            // RFC 2047 Q differs from plain quoted-printable only in mapping
            // underscore to space.
            let unfolded = parts[2].replace('_', " ");
            quoted_printable::decode(unfolded.as_bytes(), quoted_printable::ParseMode::Robust)
                .ok()?
        }
        "B" => base64::engine::general_purpose::STANDARD
            .decode(parts[2].as_bytes())
            .ok()?,
        _ => return None,
    };

    // Charsets are decoded as UTF-8 with lossy fallback; the cache keeps the
    // envelope snapshot if the original ever matters.
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_q_encoded_subject() {
        assert_eq!(
            decode_encoded_words("=?UTF-8?Q?Caf=C3=A9_update?="),
            "Café update"
        );
    }

    #[test]
    fn decodes_b_encoded_subject() {
        assert_eq!(decode_encoded_words("=?utf-8?B?SGVsbG8gd29ybGQ=?="), "Hello world");
    }

    #[test]
    fn drops_whitespace_between_consecutive_words() {
        assert_eq!(
            decode_encoded_words("=?UTF-8?Q?one?= =?UTF-8?Q?two?="),
            "onetwo"
        );
    }

    #[test]
    fn keeps_plain_text_and_broken_words_verbatim() {
        assert_eq!(decode_encoded_words("plain subject"), "plain subject");
        assert_eq!(decode_encoded_words("=?UTF-8?X?bogus?="), "=?UTF-8?X?bogus?=");
        assert_eq!(decode_encoded_words("=?truncated"), "=?truncated");
    }

    #[test]
    fn mixes_plain_and_encoded_segments() {
        assert_eq!(
            decode_encoded_words("Fwd: =?UTF-8?B?w6l0w6k=?= report"),
            "Fwd: été report"
        );
    }
}
