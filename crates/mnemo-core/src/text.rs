//! Field-string helpers shared by the collection and the sync handler.
//!
//! Note fields travel as a single `\x1f`-delimited string, and the cached
//! sort field / duplicate checksum are computed over HTML-stripped text.

use regex::Regex;
use sha1::{Digest, Sha1};

/// Separator used to flatten a note's ordered field list into one string.
pub const FIELD_SEPARATOR: char = '\u{1f}';

/// The time in integer seconds since the epoch.
pub fn int_time() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The time in integer milliseconds since the epoch.
pub fn int_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn split_fields(flds: &str) -> Vec<String> {
    flds.split(FIELD_SEPARATOR).map(str::to_string).collect()
}

pub fn join_fields(fields: &[String]) -> String {
    fields.join("\u{1f}")
}

/// Parse a tag string into individual tags.
pub fn split_tags(tags: &str) -> Vec<String> {
    tags.replace('\u{3000}', " ")
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// SHA-1 hex digest of arbitrary bytes; media rows are addressed by this.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 32-bit unsigned number from the first 8 hex digits of the SHA-1 of the
/// HTML-stripped field. Used for duplicate detection on field 0.
pub fn field_checksum(data: &str) -> i64 {
    let digest = checksum(strip_html_media(data).as_bytes());
    i64::from_str_radix(&digest[..8], 16).unwrap_or(0)
}

/// Strip HTML, but keep media filenames so they still participate in the
/// sort field and checksum.
pub fn strip_html_media(text: &str) -> String {
    let re_media =
        Regex::new(r#"(?i)<img[^>]+src=["']?([^"'>]+)["']?[^>]*>"#).expect("valid regex");
    strip_html(&re_media.replace_all(text, " $1 "))
}

pub fn strip_html(text: &str) -> String {
    let re_comment = Regex::new(r"(?s)<!--.*?-->").expect("valid regex");
    let re_style = Regex::new(r"(?si)<style.*?>.*?</style>").expect("valid regex");
    let re_script = Regex::new(r"(?si)<script.*?>.*?</script>").expect("valid regex");
    let re_tag = Regex::new(r"(?s)<.*?>").expect("valid regex");

    let text = re_comment.replace_all(text, "");
    let text = re_style.replace_all(&text, "");
    let text = re_script.replace_all(&text, "");
    let text = re_tag.replace_all(&text, "");
    entities_to_text(&text)
}

/// Decode numeric character references and `&nbsp;`. Named entities other
/// than nbsp are left untouched, matching the wire-compatible behaviour of
/// the sort-field cache.
fn entities_to_text(html: &str) -> String {
    let html = html.replace("&nbsp;", " ");
    let re_ent = Regex::new(r"&#?\w+;").expect("valid regex");
    re_ent
        .replace_all(&html, |caps: &regex::Captures<'_>| {
            let ent = &caps[0];
            let decoded = if let Some(hex) = ent.strip_prefix("&#x").and_then(|s| s.strip_suffix(';')) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = ent.strip_prefix("&#").and_then(|s| s.strip_suffix(';')) {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                None
            };
            decoded.map_or_else(|| ent.to_string(), |c| c.to_string())
        })
        .into_owned()
}

/// Globally-unique note guid: a random 64-bit number in a compact base-85
/// style alphabet.
pub fn guid64() -> String {
    const TABLE: &[u8] = b"abcdefghijklmnopqrstuvwxyz\
ABCDEFGHIJKLMNOPQRSTUVWXYZ\
0123456789\
!#$%&()*+,-./:;<=>?@[]^_`{|}~";
    let (hi, lo) = uuid::Uuid::new_v4().as_u64_pair();
    let mut num = hi ^ lo;
    let mut buf = Vec::new();
    while num > 0 {
        let (next, idx) = (num / TABLE.len() as u64, num % TABLE.len() as u64);
        buf.push(TABLE[idx as usize]);
        num = next;
    }
    buf.reverse();
    String::from_utf8(buf).expect("ascii alphabet")
}

/// Render a list of ids as a parenthesised SQL IN-list: `(1,2,3)`.
///
/// Ids are i64 values formatted directly, so the result is safe to splice
/// into a statement. An empty list yields `(0)` so the clause stays valid.
pub fn ids_to_sql(ids: &[i64]) -> String {
    if ids.is_empty() {
        return "(0)".to_string();
    }
    let inner: Vec<String> = ids.iter().map(ToString::to_string).collect();
    format!("({})", inner.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fields_round_trip() {
        let fields = vec!["front".to_string(), "back".to_string(), String::new()];
        assert_eq!(split_fields(&join_fields(&fields)), fields);
    }

    #[test]
    fn tags_split_on_spaces_and_ideographic_space() {
        assert_eq!(
            split_tags("a  b\u{3000}c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_tags("").is_empty());
    }

    #[test]
    fn checksum_is_sha1_hex() {
        assert_eq!(checksum(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn field_checksum_strips_html() {
        assert_eq!(field_checksum("<b>abc</b>"), field_checksum("abc"));
        // first 8 hex digits of sha1("abc")
        assert_eq!(field_checksum("abc"), 0xa999_3e36);
    }

    #[test]
    fn strip_html_media_keeps_filenames() {
        let s = strip_html_media(r#"hello <img src="cat.jpg"> world"#);
        assert!(s.contains("cat.jpg"));
        assert!(!s.contains("<img"));
    }

    #[test]
    fn numeric_entities_decode() {
        assert_eq!(strip_html("&#65;&#x42;&nbsp;x"), "AB x");
        // unknown named entities pass through
        assert_eq!(strip_html("&foo;"), "&foo;");
    }

    #[test]
    fn guid_is_nonempty_and_distinct() {
        let a = guid64();
        let b = guid64();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn ids_to_sql_formats() {
        assert_eq!(ids_to_sql(&[1, 2, 3]), "(1,2,3)");
        assert_eq!(ids_to_sql(&[]), "(0)");
    }
}
