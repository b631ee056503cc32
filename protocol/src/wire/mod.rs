//! # Wire Formats
//!
//! Everything that crosses the HTTP boundary in a SQRL exchange is either a
//! base64url blob or a CRLF-joined `key=value` block inside one. This module
//! owns both layers:
//!
//! - [`base64url`] — the padding-free base64url alphabet used everywhere.
//! - [`client`] — decoding the `client` POST parameter into a
//!   [`ClientRequest`].
//! - [`response`] — decoding the `server` POST parameter (echoed URL or
//!   structured block) and assembling the response body.
//!
//! ## The `client` / `server` / signature triangle
//!
//! Signatures are computed over the *transmitted* `client` and `server`
//! parameter strings concatenated, not over any re-serialization. The parsers
//! here therefore keep the raw parameter text alongside the decoded fields —
//! reconstructing the message from parsed fields would be a signature bug
//! waiting to happen.

pub mod base64url;
pub mod client;
pub mod response;

pub use client::ClientRequest;
pub use response::{ServerParam, ServerResponse};

use thiserror::Error;

/// Errors raised while decoding wire parameters.
///
/// Intentionally coarse. The protocol answer to any of these is the same
/// TIF combination (COMMAND_FAILED | CLIENT_FAILURE); the variants exist for
/// logs, not for the client.
#[derive(Debug, Error)]
pub enum WireError {
    /// The base64url payload did not decode.
    #[error("invalid base64url payload")]
    InvalidBase64,

    /// The decoded payload was not valid UTF-8.
    #[error("payload is not valid utf-8")]
    InvalidUtf8,

    /// A required field was absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field value was present but malformed.
    #[error("malformed field: {0}")]
    MalformedField(&'static str),
}

/// Splits a decoded CRLF `key=value` block into pairs.
///
/// Lines without an `=` are ignored rather than rejected — the format has
/// always been lax here and clients in the wild ship trailing newlines.
/// Bare `\n` separators are tolerated on input; we only ever emit `\r\n`.
pub(crate) fn parse_kv_block(block: &str) -> Vec<(String, String)> {
    block
        .split("\r\n")
        .flat_map(|chunk| chunk.split('\n'))
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let (k, v) = line.split_once('=')?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kv_block_crlf() {
        let pairs = parse_kv_block("ver=1\r\ncmd=query\r\nidk=abc");
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("ver".into(), "1".into()));
        assert_eq!(pairs[2], ("idk".into(), "abc".into()));
    }

    #[test]
    fn test_parse_kv_block_tolerates_bare_lf_and_blanks() {
        let pairs = parse_kv_block("ver=1\ncmd=ident\n\n");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].1, "ident");
    }

    #[test]
    fn test_parse_kv_block_value_may_contain_equals() {
        // base64url never contains '=', but qry values contain "?nut=".
        let pairs = parse_kv_block("qry=/sqrl/auth?nut=abc");
        assert_eq!(pairs[0].1, "/sqrl/auth?nut=abc");
    }
}
