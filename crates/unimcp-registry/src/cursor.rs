//! Opaque pagination cursors spanning heterogeneous upstreams.
//!
//! Wire form: `base64(clientName ":" upstreamCursor)`. The upstream half is
//! whatever the upstream handed out and is relayed back verbatim; the
//! client half names where the walk resumes, in lexical client order.
//!
//! Invalid cursors are not errors: callers reset to the start and warn.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Decoded cursor: resume at `client`, passing `upstream` to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub client: String,
    pub upstream: Option<String>,
}

const MAX_DECODED_LEN: usize = 1000;
const MAX_CLIENT_LEN: usize = 100;

/// Encode a cursor for the wire.
pub fn encode_cursor(client: &str, upstream: Option<&str>) -> String {
    let raw = match upstream {
        Some(upstream) => format!("{client}:{upstream}"),
        None => format!("{client}:"),
    };
    STANDARD.encode(raw)
}

/// Decode a wire cursor, or `None` when it is malformed.
///
/// Rules: valid base64; decoded length ≤ 1000; client half is 1–100 chars
/// of `[A-Za-z0-9_-]`.
pub fn decode_cursor(raw: &str) -> Option<Cursor> {
    let decoded = STANDARD.decode(raw).ok()?;
    if decoded.len() > MAX_DECODED_LEN {
        return None;
    }
    let text = String::from_utf8(decoded).ok()?;
    let (client, upstream) = text.split_once(':')?;
    if client.is_empty() || client.len() > MAX_CLIENT_LEN {
        return None;
    }
    if !client
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some(Cursor {
        client: client.to_string(),
        upstream: if upstream.is_empty() {
            None
        } else {
            Some(upstream.to_string())
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip() {
        let encoded = encode_cursor("fs", Some("page-2"));
        let cursor = decode_cursor(&encoded).unwrap();
        assert_eq!(cursor.client, "fs");
        assert_eq!(cursor.upstream.as_deref(), Some("page-2"));

        let encoded = encode_cursor("fs", None);
        let cursor = decode_cursor(&encoded).unwrap();
        assert_eq!(cursor.upstream, None);
    }

    #[test]
    fn upstream_half_may_contain_colons() {
        let encoded = encode_cursor("a", Some("x:y:z"));
        let cursor = decode_cursor(&encoded).unwrap();
        assert_eq!(cursor.upstream.as_deref(), Some("x:y:z"));
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(decode_cursor("not-base64!"), None);
        assert_eq!(decode_cursor(&STANDARD.encode("no-colon")), None);
        assert_eq!(decode_cursor(&STANDARD.encode(":empty-client")), None);
        assert_eq!(decode_cursor(&STANDARD.encode("bad name:x")), None);
    }

    #[test]
    fn oversized_cursors_rejected() {
        let long_client = "c".repeat(MAX_CLIENT_LEN + 1);
        assert_eq!(decode_cursor(&STANDARD.encode(format!("{long_client}:x"))), None);

        let long_tail = "t".repeat(MAX_DECODED_LEN);
        assert_eq!(decode_cursor(&STANDARD.encode(format!("c:{long_tail}"))), None);

        // At the limits, fine.
        let client = "c".repeat(MAX_CLIENT_LEN);
        assert!(decode_cursor(&STANDARD.encode(format!("{client}:x"))).is_some());
    }

    proptest::proptest! {
        #[test]
        fn encode_decode_identity(
            client in "[A-Za-z0-9_-]{1,100}",
            upstream in proptest::option::of("[ -~]{0,200}"),
        ) {
            let upstream_ref = upstream.as_deref().filter(|s| !s.is_empty());
            let cursor = decode_cursor(&encode_cursor(&client, upstream_ref)).unwrap();
            proptest::prop_assert_eq!(cursor.client, client);
            proptest::prop_assert_eq!(cursor.upstream.as_deref(), upstream_ref);
        }
    }
}
