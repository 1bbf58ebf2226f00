//! IRCv3 message tag value escaping.
//!
//! Reference: <https://ircv3.net/specs/extensions/message-tags>

/// Escape a tag value for the wire.
pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Unescape a tag value from the wire.
///
/// A trailing lone backslash is dropped and unknown escapes collapse to
/// the escaped character, as message-tags specifies.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

/// Encode `key=value` pairs joined with `;`, escaping each value.
///
/// This is the payload format of the bouncer's LISTBUFFERS / LISTNETWORKS
/// replies, which reuse tag escaping outside an actual tags section.
pub fn encode_tag_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (key, value) in pairs {
        if !out.is_empty() {
            out.push(';');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(&escape_tag_value(value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for v in ["plain", "a b", "semi;colon", "back\\slash", "nl\nhere"] {
            assert_eq!(unescape_tag_value(&escape_tag_value(v)), v);
        }
    }

    #[test]
    fn trailing_backslash_dropped() {
        assert_eq!(unescape_tag_value("abc\\"), "abc");
    }

    #[test]
    fn pairs_are_escaped() {
        let encoded = encode_tag_pairs([("buffer", "#rust"), ("topic", "one; two")]);
        assert_eq!(encoded, "buffer=#rust;topic=one\\:\\stwo");
    }
}
