//! # The Nut — One-Time Nonce
//!
//! Every SQRL round is identified by a "nut": an opaque one-time token the
//! server mints, hands to the client, and consumes exactly once when the
//! client signs its next request over it. A nut is never updated in place —
//! it is superseded by minting its chain successor.
//!
//! [`NutRecord`] is the server-side view of a nut regardless of backend: the
//! stateful store persists these rows directly, the stateless codec
//! reconstructs them from the encrypted token plus the session chain.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tif::Tif;

/// Outcome of validating a presented nut.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NutStatus {
    /// The nut exists, is fresh, and belongs to the presenting key.
    Valid,
    /// The nut exists but is older than the configured max age.
    Expired,
    /// No such nut — never minted, already consumed, or undecodable.
    Invalid,
    /// The nut is bound to a different identity key.
    KeyMismatch,
}

/// Server-side metadata for one nut.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NutRecord {
    /// The opaque token value itself.
    pub nut: String,
    /// When the nut was minted.
    pub created: DateTime<Utc>,
    /// The requesting IP at mint time.
    pub ip: IpAddr,
    /// TIF bits of the round that minted this nut; zero for an initial
    /// page-load nut.
    pub action: Tif,
    /// Identity key associated with the nut's round, if any.
    pub key: Option<String>,
    /// The predecessor nut this one superseded, if any.
    pub previous: Option<String>,
    /// Set once the nut's session has authenticated.
    pub verified: bool,
    /// Set when the round that minted this nut ended its session.
    pub kill_session: bool,
    /// Session the nut belongs to (always present in stateless mode).
    pub session: Option<String>,
    /// Set when a successor has been minted. A superseded nut never
    /// validates again.
    pub superseded: bool,
}

impl NutRecord {
    /// A fresh, unconsumed record minted now.
    pub fn new(nut: String, ip: IpAddr, action: Tif) -> Self {
        NutRecord {
            nut,
            created: Utc::now(),
            ip,
            action,
            key: None,
            previous: None,
            verified: false,
            kill_session: false,
            session: None,
            superseded: false,
        }
    }
}

/// Folds an IP address into the 32-bit tag the wire format carries.
///
/// IPv4 maps to its native 32-bit value. IPv6 doesn't fit in the token's
/// 8-hex-character IP field (the format predates IPv6 support), so it is
/// folded through SHA-256 and truncated — good enough for the equality
/// check the protocol performs, not reversible to an address.
pub fn ip_tag(ip: IpAddr) -> u32 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => {
            let digest = Sha256::digest(v6.octets());
            u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
        }
    }
}

/// The address form a tag round-trips to. IPv4 tags reconstruct their
/// address exactly; IPv6 tags reconstruct to the synthetic IPv4 carrying
/// the same tag value, which [`ip_tag`] maps back to itself.
pub fn ip_from_tag(tag: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(tag))
}
