//! Offset-based page cursors shared by the SQL backends.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::DbError;

pub(crate) fn encode_offset(offset: u64) -> String {
    STANDARD.encode(offset.to_string())
}

pub(crate) fn decode_offset(page_state: Option<&str>) -> Result<u64, DbError> {
    let Some(state) = page_state else {
        return Ok(0);
    };
    let bytes = STANDARD
        .decode(state)
        .map_err(|_| DbError::InvalidPageState(state.to_string()))?;
    std::str::from_utf8(&bytes)
        .ok()
        .and_then(|text| text.parse::<u64>().ok())
        .ok_or_else(|| DbError::InvalidPageState(state.to_string()))
}

/// Wraps `query` so it yields one row past the page end, which tells
/// whether another page exists.
pub(crate) fn paged_query(query: &str, limit_placeholder: &str, offset_placeholder: &str) -> String {
    let inner = query.trim().trim_end_matches(';');
    format!("SELECT * FROM ({inner}) AS shoal_page LIMIT {limit_placeholder} OFFSET {offset_placeholder}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_encode_to_opaque_state() {
        assert_eq!(encode_offset(2), "Mg==");
        assert_eq!(decode_offset(Some("Mg==")).expect("decode"), 2);
        assert_eq!(decode_offset(None).expect("start"), 0);
    }

    #[test]
    fn garbage_state_is_rejected() {
        assert!(matches!(
            decode_offset(Some("not base64!")),
            Err(DbError::InvalidPageState(_))
        ));
        let words = STANDARD.encode("ten");
        assert!(decode_offset(Some(&words)).is_err());
    }

    #[test]
    fn paged_query_strips_trailing_semicolon() {
        assert_eq!(
            paged_query("SELECT id FROM t ORDER BY id;", "?", "?"),
            "SELECT * FROM (SELECT id FROM t ORDER BY id) AS shoal_page LIMIT ? OFFSET ?"
        );
    }
}
