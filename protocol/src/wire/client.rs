//! Decoding of the `client` POST parameter.
//!
//! The `client` parameter is a base64url blob of CRLF-joined `key=value`
//! lines carrying the protocol version, the ordered command list, the
//! client's keys, and option flags:
//!
//! ```text
//! ver=1
//! cmd=ident~lock
//! idk=<base64url Ed25519 public key>
//! pidk=<base64url previous key>        (optional)
//! suk=<base64url server unlock key>    (optional)
//! vuk=<base64url verify unlock key>    (optional)
//! opt=cps~suk                          (optional)
//! ```
//!
//! Commands chain with `~` and execute in order. Option flags chain with `~`
//! (some clients use spaces; both are accepted). The raw transmitted
//! parameter is retained on the parsed struct because every signature in the
//! request covers it byte-for-byte.

use super::{base64url, parse_kv_block, WireError};

/// A decoded `client` parameter. Ephemeral — lives for one request.
#[derive(Clone, Debug)]
pub struct ClientRequest {
    /// Protocol version the client speaks.
    pub ver: String,
    /// Command verbs in execution order (`cmd` split on `~`).
    pub commands: Vec<String>,
    /// The client's current identity key, as transmitted (base64url).
    pub idk: String,
    /// Previous identity key, present during identity migration.
    pub pidk: Option<String>,
    /// Server unlock key, present on create/migrate/unlock requests.
    pub suk: Option<String>,
    /// Verify unlock key, present on create/migrate/unlock requests.
    pub vuk: Option<String>,
    /// Option flags (`opt` split on `~` or space), preserved verbatim.
    pub opt: Vec<String>,
    /// The transmitted parameter string, exactly as received. Signature
    /// messages are built from this, never from the parsed fields.
    pub raw: String,
}

impl ClientRequest {
    /// Parse the transmitted `client` parameter.
    ///
    /// Requires `ver`, a non-empty `cmd` list, and `idk`; everything else
    /// is optional. Unknown keys are ignored — protocol extensions add keys
    /// and old servers are expected to skip them.
    pub fn parse(param: &str) -> Result<Self, WireError> {
        let text = base64url::decode_string(param)?;

        let mut ver = None;
        let mut cmd = None;
        let mut idk = None;
        let mut pidk = None;
        let mut suk = None;
        let mut vuk = None;
        let mut opt = Vec::new();

        for (key, value) in parse_kv_block(&text) {
            match key.as_str() {
                "ver" => ver = Some(value),
                "cmd" => cmd = Some(value),
                "idk" => idk = Some(value),
                "pidk" => pidk = Some(value),
                "suk" => suk = Some(value),
                "vuk" => vuk = Some(value),
                "opt" => {
                    opt = value
                        .split(['~', ' '])
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }

        let ver = ver.filter(|v| !v.is_empty()).ok_or(WireError::MissingField("ver"))?;
        let cmd = cmd.filter(|c| !c.is_empty()).ok_or(WireError::MissingField("cmd"))?;
        let idk = idk.filter(|k| !k.is_empty()).ok_or(WireError::MissingField("idk"))?;

        let commands: Vec<String> = cmd
            .split('~')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if commands.is_empty() {
            return Err(WireError::MalformedField("cmd"));
        }

        Ok(ClientRequest {
            ver,
            commands,
            idk,
            pidk: pidk.filter(|k| !k.is_empty()),
            suk: suk.filter(|k| !k.is_empty()),
            vuk: vuk.filter(|k| !k.is_empty()),
            opt,
            raw: param.to_string(),
        })
    }

    /// True when `verb` appears anywhere in the command chain.
    pub fn has_command(&self, verb: &str) -> bool {
        self.commands.iter().any(|c| c == verb)
    }

    /// True when the client set the given option flag.
    pub fn has_option(&self, flag: &str) -> bool {
        self.opt.iter().any(|o| o == flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_client(lines: &[&str]) -> String {
        base64url::encode(lines.join("\r\n"))
    }

    #[test]
    fn test_parse_minimal_query() {
        let param = encode_client(&["ver=1", "cmd=query", "idk=someKey"]);
        let req = ClientRequest::parse(&param).unwrap();
        assert_eq!(req.ver, "1");
        assert_eq!(req.commands, vec!["query"]);
        assert_eq!(req.idk, "someKey");
        assert!(req.pidk.is_none());
        assert_eq!(req.raw, param);
    }

    #[test]
    fn test_parse_chained_commands_preserve_order() {
        let param = encode_client(&["ver=1", "cmd=ident~lock", "idk=k"]);
        let req = ClientRequest::parse(&param).unwrap();
        assert_eq!(req.commands, vec!["ident", "lock"]);
        assert!(req.has_command("lock"));
        assert!(!req.has_command("query"));
    }

    #[test]
    fn test_parse_full_migration_request() {
        let param = encode_client(&[
            "ver=1",
            "cmd=ident",
            "idk=newKey",
            "pidk=oldKey",
            "suk=sukVal",
            "vuk=vukVal",
            "opt=cps~suk",
        ]);
        let req = ClientRequest::parse(&param).unwrap();
        assert_eq!(req.pidk.as_deref(), Some("oldKey"));
        assert_eq!(req.suk.as_deref(), Some("sukVal"));
        assert_eq!(req.vuk.as_deref(), Some("vukVal"));
        assert!(req.has_option("cps"));
        assert!(req.has_option("suk"));
        assert!(!req.has_option("hardlock"));
    }

    #[test]
    fn test_space_separated_options() {
        let param = encode_client(&["ver=1", "cmd=query", "idk=k", "opt=cps suk"]);
        let req = ClientRequest::parse(&param).unwrap();
        assert!(req.has_option("cps"));
        assert!(req.has_option("suk"));
    }

    #[test]
    fn test_missing_required_fields() {
        let no_idk = encode_client(&["ver=1", "cmd=query"]);
        assert!(matches!(
            ClientRequest::parse(&no_idk),
            Err(WireError::MissingField("idk"))
        ));

        let no_cmd = encode_client(&["ver=1", "idk=k"]);
        assert!(matches!(
            ClientRequest::parse(&no_cmd),
            Err(WireError::MissingField("cmd"))
        ));

        let no_ver = encode_client(&["cmd=query", "idk=k"]);
        assert!(matches!(
            ClientRequest::parse(&no_ver),
            Err(WireError::MissingField("ver"))
        ));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let param = encode_client(&["ver=1", "cmd=query", "idk=k", "btn=2"]);
        assert!(ClientRequest::parse(&param).is_ok());
    }

    #[test]
    fn test_garbage_base64_is_rejected() {
        assert!(matches!(
            ClientRequest::parse("!!not-base64!!"),
            Err(WireError::InvalidBase64)
        ));
    }
}
