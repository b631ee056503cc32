//! Base64url encoding as SQRL uses it: the URL-safe alphabet (`+`→`-`,
//! `/`→`_`) with padding stripped on encode and restored on decode as needed.
//!
//! Everything the protocol transmits — keys, signatures, the `client` and
//! `server` parameters, the whole response body — goes through these two
//! functions. Keep them boring.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use super::WireError;

/// Encode bytes as unpadded base64url.
pub fn encode<T: AsRef<[u8]>>(data: T) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode base64url, accepting (and discarding) trailing `=` padding.
///
/// Clients are required to strip padding, but some send it anyway and the
/// wire format says to restore it as needed — which for decoding means
/// ignoring it.
pub fn decode(s: &str) -> Result<Vec<u8>, WireError> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|_| WireError::InvalidBase64)
}

/// Decode base64url into a UTF-8 string.
pub fn decode_string(s: &str) -> Result<String, WireError> {
    String::from_utf8(decode(s)?).map_err(|_| WireError::InvalidUtf8)
}
