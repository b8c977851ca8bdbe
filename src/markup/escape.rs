//! Character data escaping and entity resolution.

use std::fmt::Write as _;

use bytes::BytesMut;

use super::MarkupError;

/// Append `text` to `out`, escaping markup-significant and non-printable characters.
///
/// `<`, `>` and `&` use the predefined entities. Anything outside printable
/// ASCII, other than tab, line feed and carriage return, becomes a
/// hexadecimal character reference.
pub fn escape_into(out: &mut BytesMut, text: &str) {
    let bytes = text.as_bytes();
    let mut clean = 0;
    for (index, ch) in text.char_indices() {
        if is_safe(ch) {
            continue;
        }
        out.extend_from_slice(&bytes[clean..index]);
        match ch {
            '<' => out.extend_from_slice(b"&lt;"),
            '>' => out.extend_from_slice(b"&gt;"),
            '&' => out.extend_from_slice(b"&amp;"),
            other => {
                // Writing into BytesMut cannot fail.
                let _ = write!(out, "&#x{:X};", u32::from(other));
            }
        }
        clean = index + ch.len_utf8();
    }
    out.extend_from_slice(&bytes[clean..]);
}

/// Escape `text` into a new string.
#[must_use]
pub fn escape(text: &str) -> String {
    let mut out = BytesMut::with_capacity(text.len());
    escape_into(&mut out, text);
    // Input was UTF-8 and every replacement is ASCII.
    String::from_utf8_lossy(&out).into_owned()
}

/// Resolve predefined entities and numeric character references.
///
/// `offset` is reported in errors and should point at the enclosing token.
pub fn unescape(raw: &str, offset: usize) -> Result<String, MarkupError> {
    if !raw.contains('&') {
        return Ok(raw.to_owned());
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let Some(semi) = tail.find(';') else {
            return Err(MarkupError::UnknownEntity {
                entity: tail.chars().take(16).collect(),
                offset,
            });
        };
        let entity = &tail[..semi];
        let ch = resolve_entity(entity).ok_or_else(|| MarkupError::UnknownEntity {
            entity: entity.to_owned(),
            offset,
        })?;
        out.push(ch);
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

const fn is_safe(ch: char) -> bool {
    matches!(ch, '\t' | '\n' | '\r' | ' '..='~') && !matches!(ch, '<' | '>' | '&')
}

fn resolve_entity(entity: &str) -> Option<char> {
    match entity {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let digits = entity.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(escape("a<b & c>d"), "a&lt;b &amp; c&gt;d");
    }

    #[test]
    fn escapes_non_ascii_as_references() {
        assert_eq!(escape("caf\u{e9}"), "caf&#xE9;");
        assert_eq!(escape("tab\tok\n"), "tab\tok\n");
        assert_eq!(escape("\u{1F600}"), "&#x1F600;");
    }

    #[test]
    fn unescape_resolves_entities() {
        let text = unescape("&lt;a&gt; &amp; &quot;&apos; &#65;&#x42;", 0).unwrap();
        assert_eq!(text, "<a> & \"' AB");
    }

    #[test]
    fn unescape_rejects_unknown_entity() {
        let err = unescape("&nbsp;", 7).unwrap_err();
        assert_eq!(
            err,
            MarkupError::UnknownEntity {
                entity: "nbsp".to_owned(),
                offset: 7
            }
        );
        assert!(unescape("a & b", 0).is_err());
        assert!(unescape("&#xD800;", 0).is_err());
    }

    #[test]
    fn escape_then_unescape_is_identity() {
        let original = "x < y && \u{e9}t\u{e9} > \"hiver\"";
        assert_eq!(unescape(&escape(original), 0).unwrap(), original);
    }
}
