//! # Nonce & URL Generation
//!
//! The generator mints the one-time nut for the next protocol round and
//! builds the query path / URL that carries it. One generator lives per
//! request: the first mint is memoized so that the `nut=` response field and
//! the `qry` field are guaranteed to name the same token.
//!
//! URL assembly is plain free functions ([`auth_qry`] / [`auth_url`]) shared
//! with the validator, which must reproduce them exactly to check the
//! client's server-echo.

use std::net::IpAddr;

use crate::config::SqrlConfig;
use crate::store::{NutBackend, StoreResult};
use crate::tif::Tif;

// ---------------------------------------------------------------------------
// URL Helpers
// ---------------------------------------------------------------------------

/// Length of the path portion of the key domain, when there is one.
///
/// A domain of `example.com/app` scopes client key derivation to the domain
/// root while the auth endpoint lives under `/app`; the `x=` parameter tells
/// the client how many characters of path belong to the key domain.
pub fn domain_path_len(domain: &str) -> Option<usize> {
    domain.find('/').map(|i| domain.len() - i)
}

/// The server-relative query path for a given nut, e.g.
/// `/sqrl/auth?nut=abc123` or `/sqrl/auth?nut=abc123&x=4`.
pub fn auth_qry(config: &SqrlConfig, nut: &str) -> String {
    let mut qry = format!("{}?nut={}", config.authentication_path, nut);
    if let Some(x) = domain_path_len(&config.domain) {
        qry.push_str(&format!("&x={}", x));
    }
    qry
}

/// The full URL a client scans or follows, e.g.
/// `sqrl://example.com/sqrl/auth?nut=abc123`. The scheme encodes the
/// transport requirement: `sqrl` for secure deployments, `qrl` otherwise.
pub fn auth_url(config: &SqrlConfig, nut: &str) -> String {
    let scheme = if config.secure { "sqrl" } else { "qrl" };
    format!("{}://{}{}", scheme, config.domain, auth_qry(config, nut))
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Mints the next nut for one request and remembers it.
pub struct Generator {
    config: SqrlConfig,
    backend: NutBackend,
    ip: IpAddr,
    minted: Option<String>,
}

impl Generator {
    pub fn new(config: SqrlConfig, backend: NutBackend, ip: IpAddr) -> Self {
        Generator {
            config,
            backend,
            ip,
            minted: None,
        }
    }

    /// The nut for the next round.
    ///
    /// Memoized: the first call mints (or reuses an active session nonce,
    /// see below) and every later call in the same request returns the same
    /// value. With no action bits and no predecessor — an initial page
    /// load — an already-active session nonce is reused when the backend
    /// has one, so refreshing a login page does not grow the nonce table.
    pub fn get_nonce(
        &mut self,
        action: Tif,
        key: Option<&str>,
        previous: Option<&str>,
    ) -> StoreResult<String> {
        if let Some(nut) = &self.minted {
            return Ok(nut.clone());
        }

        if action.is_empty() && previous.is_none() {
            if let Some(active) = self.backend.active_session_nonce()? {
                self.minted = Some(active.clone());
                return Ok(active);
            }
        }

        let nut = self
            .backend
            .mint(&self.config, action, key, previous, self.ip)?;
        tracing::debug!(tif = %action, chained = previous.is_some(), "minted nut");
        self.minted = Some(nut.clone());
        Ok(nut)
    }

    /// The `qry` response field for the (memoized) next-round nut.
    pub fn generate_qry(&mut self) -> StoreResult<String> {
        let nut = self.get_nonce(Tif::NONE, None, None)?;
        Ok(auth_qry(&self.config, &nut))
    }

    /// The full authentication URL for the (memoized) next-round nut.
    /// This is what login pages render (typically as a QR code).
    pub fn get_url(&mut self) -> StoreResult<String> {
        let nut = self.get_nonce(Tif::NONE, None, None)?;
        Ok(auth_url(&self.config, &nut))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NutBackend};
    use std::sync::Arc;

    fn config() -> SqrlConfig {
        SqrlConfig {
            domain: "example.com".into(),
            authentication_path: "/sqrl/auth".into(),
            ..SqrlConfig::default()
        }
    }

    fn generator(config: SqrlConfig) -> Generator {
        let backend = NutBackend::stateful(Arc::new(MemoryStore::new()));
        Generator::new(config, backend, "127.0.0.1".parse().unwrap())
    }

    #[test]
    fn test_qry_without_path_extension() {
        let cfg = config();
        assert_eq!(auth_qry(&cfg, "abc"), "/sqrl/auth?nut=abc");
        assert_eq!(domain_path_len(&cfg.domain), None);
    }

    #[test]
    fn test_qry_with_path_extension() {
        let cfg = SqrlConfig {
            domain: "example.com/app".into(),
            ..config()
        };
        assert_eq!(domain_path_len(&cfg.domain), Some(4));
        assert_eq!(auth_qry(&cfg, "abc"), "/sqrl/auth?nut=abc&x=4");
    }

    #[test]
    fn test_url_scheme_tracks_transport_requirement() {
        let cfg = config();
        assert_eq!(auth_url(&cfg, "abc"), "sqrl://example.com/sqrl/auth?nut=abc");

        let insecure = SqrlConfig {
            secure: false,
            ..config()
        };
        assert_eq!(
            auth_url(&insecure, "abc"),
            "qrl://example.com/sqrl/auth?nut=abc"
        );
    }

    #[test]
    fn test_get_nonce_is_memoized() {
        let mut gen = generator(config());
        let first = gen.get_nonce(Tif::NONE, None, None).unwrap();
        let second = gen.get_nonce(Tif::ID_MATCH, Some("key"), None).unwrap();
        assert_eq!(first, second, "one nut per request, whatever is asked later");
    }

    #[test]
    fn test_generate_qry_names_the_minted_nut() {
        let mut gen = generator(config());
        let nut = gen.get_nonce(Tif::NONE, None, None).unwrap();
        let qry = gen.generate_qry().unwrap();
        assert_eq!(qry, format!("/sqrl/auth?nut={}", nut));
        let url = gen.get_url().unwrap();
        assert!(url.ends_with(&qry));
    }

    #[test]
    fn test_active_session_nonce_is_reused() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        // First page load mints into the session.
        let backend = NutBackend::Stateful {
            store: store.clone(),
            session: Some("web-session".into()),
        };
        let first = Generator::new(cfg.clone(), backend.clone(), ip)
            .get_nonce(Tif::NONE, None, None)
            .unwrap();

        // A page refresh with the same transport session reuses it.
        let again = Generator::new(cfg.clone(), backend, ip)
            .get_nonce(Tif::NONE, None, None)
            .unwrap();
        assert_eq!(first, again);

        // A protocol round (action bits set) always mints fresh.
        let backend = NutBackend::Stateful {
            store,
            session: Some("web-session".into()),
        };
        let fresh = Generator::new(cfg, backend, ip)
            .get_nonce(Tif::ID_MATCH, None, Some(&first))
            .unwrap();
        assert_ne!(first, fresh);
    }
}
