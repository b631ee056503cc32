//! # Request Validation
//!
//! Every inbound protocol round passes through four independent checks
//! before any command may run:
//!
//! 1. **Server echo** — the `server` parameter must be exactly what this
//!    server last sent for the presented nut (the scanned URL on round one,
//!    the previous response body afterwards). This proves the client is
//!    answering our latest message, not a replayed or spliced one.
//! 2. **Nut validity** — the nut must exist, be unconsumed, and be fresh.
//! 3. **IP association** — informational: does the requesting IP match the
//!    one recorded when the nut was minted.
//! 4. **Signatures** — delegated to the injected [`SignatureVerifier`].
//!
//! The validator decides; the handler translates decisions into TIF bits.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;

use crate::config::SqrlConfig;
use crate::crypto::SignatureVerifier;
use crate::generator::{auth_qry, auth_url};
use crate::nut::{ip_tag, NutStatus};
use crate::store::{NutBackend, StoreResult};
use crate::tif::Tif;
use crate::wire::{base64url, ServerParam};

/// Stateless checker over injected collaborators.
pub struct Validator {
    config: SqrlConfig,
    backend: NutBackend,
    verifier: Arc<dyn SignatureVerifier>,
}

impl Validator {
    pub fn new(
        config: SqrlConfig,
        backend: NutBackend,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Validator {
            config,
            backend,
            verifier,
        }
    }

    /// Check the client's server-echo against what we actually sent.
    ///
    /// `secure` is the transport the request arrived over; it must match
    /// the configured requirement in both echo forms.
    pub fn validate_server(
        &self,
        server: &ServerParam,
        nut: &str,
        secure: bool,
    ) -> StoreResult<bool> {
        if secure != self.config.secure {
            tracing::debug!(secure, "transport does not match configuration");
            return Ok(false);
        }

        match server {
            ServerParam::Url(url) => Ok(url == &auth_url(&self.config, nut)),
            ServerParam::Pairs(_) => {
                let (Some(ver), Some(echoed_nut), Some(tif), Some(qry)) = (
                    server.field("ver"),
                    server.field("nut"),
                    server.field("tif"),
                    server.field("qry"),
                ) else {
                    return Ok(false);
                };

                if ver != self.config.accepted_versions {
                    return Ok(false);
                }
                if echoed_nut != nut {
                    return Ok(false);
                }
                if qry != auth_qry(&self.config, nut) {
                    return Ok(false);
                }

                // The echoed TIF must match what we recorded when minting
                // this nut. The token format carries the low byte, so the
                // comparison covers what both sides can represent.
                if let Some(record) = self.backend.lookup(nut)? {
                    let Some(echoed) = Tif::from_hex(tif) else {
                        return Ok(false);
                    };
                    if echoed.bits() & 0xFF != record.action.bits() & 0xFF {
                        return Ok(false);
                    }
                }

                Ok(true)
            }
        }
    }

    /// Classify a presented nut.
    pub fn validate_nut(&self, nut: &str, signing_key: Option<&str>) -> StoreResult<NutStatus> {
        let Some(record) = self.backend.lookup(nut)? else {
            return Ok(NutStatus::Invalid);
        };
        if record.superseded {
            // A consumed nut is as good as no nut.
            return Ok(NutStatus::Invalid);
        }
        if record.created < Utc::now() - self.config.nonce_max_age() {
            return Ok(NutStatus::Expired);
        }
        if let (Some(presented), Some(bound)) = (signing_key, record.key.as_deref()) {
            if presented != bound {
                return Ok(NutStatus::KeyMismatch);
            }
        }
        Ok(NutStatus::Valid)
    }

    /// Verify a base64url signature over `message` with a base64url key.
    pub fn validate_signature(&self, message: &[u8], key: &str, signature: &str) -> bool {
        let (Ok(key_bytes), Ok(sig_bytes)) = (base64url::decode(key), base64url::decode(signature))
        else {
            return false;
        };
        self.verifier.verify(message, &sig_bytes, &key_bytes)
    }

    /// Whether the requesting IP matches the IP recorded at mint time.
    /// Informational only — mismatches set no failure bit, they just leave
    /// IP_MATCH unset so the client can warn the user. A consumed nut has
    /// no usable record, in either backend.
    pub fn nut_ip_matches(&self, nut: &str, ip: IpAddr) -> StoreResult<bool> {
        Ok(match self.backend.lookup(nut)? {
            Some(record) if !record.superseded => ip_tag(record.ip) == ip_tag(ip),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Verifier;
    use crate::nut::NutRecord;
    use crate::store::{MemoryStore, NonceStore};
    use crate::wire::base64url;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn config() -> SqrlConfig {
        SqrlConfig {
            domain: "example.com".into(),
            authentication_path: "/sqrl/auth".into(),
            secure: true,
            ..SqrlConfig::default()
        }
    }

    fn setup() -> (Validator, std::sync::Arc<MemoryStore>) {
        let store = std::sync::Arc::new(MemoryStore::new());
        let backend = NutBackend::stateful(store.clone());
        (
            Validator::new(config(), backend, Arc::new(Ed25519Verifier)),
            store,
        )
    }

    fn seed_nut(store: &MemoryStore, nut: &str, action: Tif) -> NutRecord {
        let record = {
            let mut r = NutRecord::new(nut.into(), "127.0.0.1".parse().unwrap(), action);
            r.key = None;
            r
        };
        store.store_nonce(&record).unwrap();
        record
    }

    #[test]
    fn test_validate_server_url_form() {
        let (validator, store) = setup();
        seed_nut(&store, "abc", Tif::NONE);

        let good = ServerParam::Url("sqrl://example.com/sqrl/auth?nut=abc".into());
        assert!(validator.validate_server(&good, "abc", true).unwrap());

        let wrong_nut = ServerParam::Url("sqrl://example.com/sqrl/auth?nut=xyz".into());
        assert!(!validator.validate_server(&wrong_nut, "abc", true).unwrap());

        // Insecure transport against a secure configuration.
        assert!(!validator.validate_server(&good, "abc", false).unwrap());
    }

    #[test]
    fn test_validate_server_structured_form() {
        let (validator, store) = setup();
        seed_nut(&store, "abc", Tif::ID_MATCH | Tif::IP_MATCH);

        let body = crate::wire::ServerResponse {
            ver: "1".into(),
            nut: "abc".into(),
            tif: Tif::ID_MATCH | Tif::IP_MATCH,
            qry: "/sqrl/auth?nut=abc".into(),
            sfn: "Example".into(),
            suk: None,
            ask: None,
        }
        .to_body();
        let pairs = ServerParam::parse(&body).unwrap();
        assert!(validator.validate_server(&pairs, "abc", true).unwrap());
    }

    #[test]
    fn test_validate_server_structured_rejects_mismatches() {
        let (validator, store) = setup();
        seed_nut(&store, "abc", Tif::ID_MATCH);

        let make = |ver: &str, nut: &str, tif: Tif, qry: &str| {
            let body = crate::wire::ServerResponse {
                ver: ver.into(),
                nut: nut.into(),
                tif,
                qry: qry.into(),
                sfn: "Example".into(),
                suk: None,
                ask: None,
            }
            .to_body();
            ServerParam::parse(&body).unwrap()
        };

        // Recorded TIF was ID_MATCH; an echo claiming something else fails.
        let bad_tif = make("1", "abc", Tif::COMMAND_FAILED, "/sqrl/auth?nut=abc");
        assert!(!validator.validate_server(&bad_tif, "abc", true).unwrap());

        let bad_ver = make("2", "abc", Tif::ID_MATCH, "/sqrl/auth?nut=abc");
        assert!(!validator.validate_server(&bad_ver, "abc", true).unwrap());

        let bad_qry = make("1", "abc", Tif::ID_MATCH, "/other?nut=abc");
        assert!(!validator.validate_server(&bad_qry, "abc", true).unwrap());

        let bad_nut = make("1", "zzz", Tif::ID_MATCH, "/sqrl/auth?nut=abc");
        assert!(!validator.validate_server(&bad_nut, "abc", true).unwrap());
    }

    #[test]
    fn test_validate_nut_statuses() {
        let (validator, store) = setup();

        // Unknown nut.
        assert_eq!(
            validator.validate_nut("missing", None).unwrap(),
            NutStatus::Invalid
        );

        // Fresh nut.
        seed_nut(&store, "fresh", Tif::NONE);
        assert_eq!(
            validator.validate_nut("fresh", None).unwrap(),
            NutStatus::Valid
        );

        // Superseded nut.
        let mut successor = NutRecord::new("succ".into(), "127.0.0.1".parse().unwrap(), Tif::NONE);
        successor.previous = Some("fresh".into());
        store.store_nonce(&successor).unwrap();
        assert_eq!(
            validator.validate_nut("fresh", None).unwrap(),
            NutStatus::Invalid
        );

        // Expired nut.
        let mut old = NutRecord::new("old".into(), "127.0.0.1".parse().unwrap(), Tif::NONE);
        old.created = Utc::now() - chrono::Duration::minutes(30);
        store.store_nonce(&old).unwrap();
        assert_eq!(
            validator.validate_nut("old", None).unwrap(),
            NutStatus::Expired
        );
    }

    #[test]
    fn test_validate_nut_key_binding() {
        let (validator, store) = setup();
        let mut record = NutRecord::new("bound".into(), "127.0.0.1".parse().unwrap(), Tif::NONE);
        record.key = Some("ownerKey".into());
        store.store_nonce(&record).unwrap();

        assert_eq!(
            validator.validate_nut("bound", Some("ownerKey")).unwrap(),
            NutStatus::Valid
        );
        assert_eq!(
            validator.validate_nut("bound", Some("thiefKey")).unwrap(),
            NutStatus::KeyMismatch
        );
        // No key presented: the binding is not checked.
        assert_eq!(
            validator.validate_nut("bound", None).unwrap(),
            NutStatus::Valid
        );
    }

    #[test]
    fn test_nut_ip_matches() {
        let (validator, store) = setup();
        seed_nut(&store, "abc", Tif::NONE);

        assert!(validator
            .nut_ip_matches("abc", "127.0.0.1".parse().unwrap())
            .unwrap());
        assert!(!validator
            .nut_ip_matches("abc", "10.0.0.9".parse().unwrap())
            .unwrap());
        assert!(!validator
            .nut_ip_matches("missing", "127.0.0.1".parse().unwrap())
            .unwrap());
    }

    #[test]
    fn test_validate_signature_delegates() {
        let (validator, _) = setup();
        let kp = SigningKey::generate(&mut OsRng);
        let msg = b"clientparam-serverparam";
        let sig = kp.sign(msg);

        let key_b64 = base64url::encode(kp.verifying_key().as_bytes());
        let sig_b64 = base64url::encode(sig.to_bytes());

        assert!(validator.validate_signature(msg, &key_b64, &sig_b64));
        assert!(!validator.validate_signature(b"other message", &key_b64, &sig_b64));
        assert!(!validator.validate_signature(msg, &key_b64, "not-base64!!"));
    }
}
