//! The `server` parameter and the response body.
//!
//! Both directions of the server side of the wire live here:
//!
//! - **Inbound**: the `server` POST parameter, which the client must echo
//!   from whatever the server last sent it. On the first round that is the
//!   full `sqrl://` URL the client scanned; on every later round it is the
//!   server's previous response body. [`ServerParam::parse`] distinguishes
//!   the two forms.
//! - **Outbound**: [`ServerResponse`], the CRLF `key=value` block the server
//!   returns, base64url-encoded without padding.
//!
//! The echo exists so the server can prove the client is answering *this*
//! server's latest message — the validator compares the echo against what
//! the generator would have produced.

use std::collections::HashMap;

use crate::tif::Tif;

use super::{base64url, parse_kv_block, WireError};

/// The decoded `server` parameter.
#[derive(Clone, Debug)]
pub enum ServerParam {
    /// First round: the literal `sqrl://` / `qrl://` URL the client scanned.
    Url(String),
    /// Later rounds: the previous response, decoded back into pairs.
    Pairs(HashMap<String, String>),
}

impl ServerParam {
    /// Decode the transmitted `server` parameter.
    ///
    /// The two forms are distinguished by scheme prefix: a decoded payload
    /// starting with `sqrl://` or `qrl://` is the echoed URL; anything else
    /// is parsed as a `key=value` block.
    pub fn parse(param: &str) -> Result<Self, WireError> {
        let text = base64url::decode_string(param)?;
        if text.starts_with("sqrl://") || text.starts_with("qrl://") {
            return Ok(ServerParam::Url(text));
        }
        let pairs: HashMap<String, String> = parse_kv_block(&text).into_iter().collect();
        if pairs.is_empty() {
            return Err(WireError::MalformedField("server"));
        }
        Ok(ServerParam::Pairs(pairs))
    }

    /// Field accessor for the structured form. `None` for the URL form.
    pub fn field(&self, key: &str) -> Option<&str> {
        match self {
            ServerParam::Url(_) => None,
            ServerParam::Pairs(pairs) => pairs.get(key).map(String::as_str),
        }
    }
}

/// The response block returned for every protocol round.
///
/// Field order on the wire is fixed (`ver`, `nut`, `tif`, `qry`, `sfn`,
/// then optionals) — clients shouldn't care, but fixture-comparing tests
/// and humans reading logs do.
#[derive(Clone, Debug)]
pub struct ServerResponse {
    /// Accepted protocol version(s).
    pub ver: String,
    /// The freshly minted nut for the next round.
    pub nut: String,
    /// Result mask for this round.
    pub tif: Tif,
    /// Server-relative query path for the next round (contains the nut).
    pub qry: String,
    /// Server friendly name, shown on the client's confirmation screen.
    pub sfn: String,
    /// The identity's server unlock key, included only when the protocol
    /// requires the client to perform an unlock or migration signature.
    pub suk: Option<String>,
    /// Free-form question for the client to present to the user. The
    /// engine never sets this; application layers may.
    pub ask: Option<String>,
}

impl ServerResponse {
    /// Render the CRLF block and base64url-encode it (no padding).
    ///
    /// This exact string is what the client must echo back as `server` on
    /// the next round, so it is also what response-nut validation will be
    /// checked against.
    pub fn to_body(&self) -> String {
        let mut lines = vec![
            format!("ver={}", self.ver),
            format!("nut={}", self.nut),
            format!("tif={}", self.tif.as_hex()),
            format!("qry={}", self.qry),
            format!("sfn={}", self.sfn),
        ];
        if let Some(suk) = &self.suk {
            lines.push(format!("suk={}", suk));
        }
        if let Some(ask) = &self.ask {
            lines.push(format!("ask={}", ask));
        }
        base64url::encode(lines.join("\r\n"))
    }
}
