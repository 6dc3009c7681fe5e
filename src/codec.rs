//! Line codec for the shared store.
//!
//! A record is an ordered list of byte strings. Each field is base64-encoded
//! and the fields are joined with [`SEPARATOR`], which contains `_` and `:`
//! and therefore never occurs inside standard base64 output. An empty field
//! is written as [`EMPTY_FIELD`] so that `[]` and `[""]` stay distinct.
//!
//! The folding transform wraps an entire serialized store (newlines included)
//! into fixed-width base64 lines for transports that mangle long lines.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::{Error, Result};

pub const SEPARATOR: &str = "_n_::_n_";
pub const EMPTY_FIELD: &str = "=";
pub const DEFAULT_FOLD_WIDTH: usize = 120;

pub fn encode_line<F: AsRef<[u8]>>(fields: &[F]) -> String {
    let mut line = String::new();
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            line.push_str(SEPARATOR);
        }
        let field = field.as_ref();
        if field.is_empty() {
            line.push_str(EMPTY_FIELD);
        } else {
            STANDARD.encode_string(field, &mut line);
        }
    }
    line
}

pub fn decode_line(line: &str) -> Result<Vec<Vec<u8>>> {
    if line.is_empty() {
        return Ok(Vec::new());
    }
    line.split(SEPARATOR)
        .map(|field| {
            if field == EMPTY_FIELD {
                Ok(Vec::new())
            } else {
                STANDARD.decode(field).map_err(Error::from)
            }
        })
        .collect()
}

/// Decodes a line whose fields are all expected to be UTF-8 text.
pub fn decode_text_line(line: &str) -> Result<Vec<String>> {
    decode_line(line)?
        .into_iter()
        .map(|field| String::from_utf8(field).map_err(|_| Error::Corrupt("field is not utf-8")))
        .collect()
}

/// Encodes `text` as base64 and hard-wraps it every `width` columns.
pub fn fold(text: &str, width: usize) -> String {
    let width = width.max(4);
    let encoded = STANDARD.encode(text.as_bytes());
    // base64 output is ASCII, so byte chunks are valid UTF-8.
    encoded
        .as_bytes()
        .chunks(width)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn unfold(folded: &str) -> Result<String> {
    let joined: String = folded.lines().map(str::trim).collect();
    let bytes = STANDARD.decode(joined.as_bytes())?;
    String::from_utf8(bytes).map_err(|_| Error::Corrupt("folded store is not utf-8"))
}

/// Whether `content` looks like the output of [`fold`] rather than plain
/// encoded lines.
///
/// Every plain store starts with a header of at least two fields, so a
/// non-empty store without any separator can only be folded.
pub fn is_folded(content: &str) -> bool {
    let trimmed = content.trim();
    !trimmed.is_empty() && !trimmed.contains(SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(fields: Vec<Vec<u8>>) {
        let line = encode_line(&fields);
        assert!(!line.contains('\n'));
        assert_eq!(decode_line(&line).unwrap(), fields);
    }

    #[test]
    fn round_trips_awkward_fields() {
        round_trip(vec![]);
        round_trip(vec![b"".to_vec()]);
        round_trip(vec![b"".to_vec(), b"".to_vec()]);
        round_trip(vec![b"plain".to_vec(), b"".to_vec(), b"tail".to_vec()]);
        round_trip(vec![SEPARATOR.as_bytes().to_vec(), b"a_n_::_n_b".to_vec()]);
        round_trip(vec![b"line one\nline two\r\n".to_vec()]);
        round_trip(vec![vec![0u8, 255, 10, 13, 0x5f, 0x3a], EMPTY_FIELD.as_bytes().to_vec()]);
    }

    #[test]
    fn text_lines_reject_invalid_utf8() {
        let line = encode_line(&[vec![0xffu8, 0xfe]]);
        assert!(decode_text_line(&line).is_err());
        let line = encode_line(&["ok", "fine"]);
        assert_eq!(decode_text_line(&line).unwrap(), vec!["ok", "fine"]);
    }

    #[test]
    fn rejects_garbage_fields() {
        assert!(decode_line("not base64!").is_err());
    }

    #[test]
    fn fold_wraps_and_restores_exact_bytes() {
        let text = format!("{}\n{}\n", encode_line(&["1", "[a]"]), "x".repeat(500));
        let folded = fold(&text, 40);
        assert!(folded.lines().all(|line| line.len() <= 40));
        assert!(folded.lines().count() > 1);
        assert!(is_folded(&folded));
        assert_eq!(unfold(&folded).unwrap(), text);
    }

    #[test]
    fn plain_store_is_not_folded() {
        let text = encode_line(&["1700000000000", "[1:2]"]);
        assert!(!is_folded(&text));
        assert!(!is_folded(""));
        assert!(!is_folded("\n\n"));
    }
}
