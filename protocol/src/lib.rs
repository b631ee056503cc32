// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SQRL Protocol — Server Engine
//!
//! The server side of SQRL (Secure, Quick, Reliable Login): a client holds
//! an Ed25519 keypair derived from a per-domain seed and proves possession
//! of it across one or two HTTP round trips — no passwords, no shared
//! secrets, nothing for a breach to leak.
//!
//! This crate is the protocol engine only. It parses requests, enforces the
//! nonce ("nut") lifecycle and replay protection, verifies the request's
//! signatures, walks the transaction-status (TIF) state machine, and formats
//! responses. Everything stateful or environmental — identity rows, session
//! state, HTTP plumbing, even signature verification — is an injected
//! capability, which keeps the engine testable and the trust boundaries
//! visible.
//!
//! ## Architecture
//!
//! The modules mirror the actual concerns of a protocol round:
//!
//! - **config** — Protocol constants and the read-only server configuration.
//! - **tif** — The 9-bit transaction-status mask. Bit-exact; clients
//!   hard-code these values.
//! - **wire** — base64url and the CRLF `key=value` formats for the
//!   `client`/`server` parameters and the response body.
//! - **crypto** — The signature-verification capability. Don't roll your own.
//! - **nut** — The one-time nonce data model.
//! - **codec** — The stateless nut scheme: all round state sealed inside an
//!   encrypted token, replay-guarded by per-session nonce chains.
//! - **store** — Capability traits for identities, nonces, and sessions,
//!   plus an in-memory implementation.
//! - **storage** — The sled-backed implementation of those capabilities.
//! - **validator** — Server-echo, nut, IP, and signature checks.
//! - **generator** — Nonce minting and `qry`/URL assembly.
//! - **handler** — The per-request state machine tying it all together.
//!
//! ## Two deployment shapes
//!
//! A **stateful** deployment keeps a nut table ([`store::NonceStore`]) and
//! can reuse active login nonces across page refreshes. A **stateless**
//! deployment seals everything into the token via [`codec::NonceCodec`] and
//! needs only the lightweight session map. Both enforce the same invariant:
//! a nut is consumable at most once, and two requests racing on the same
//! nut cannot both win.
//!
//! ## Design Philosophy
//!
//! 1. Protocol failures are data (TIF bits), infrastructure failures are
//!    errors. Never confuse the two.
//! 2. Decoding untrusted input is total — bad tokens return not-found,
//!    they don't panic and they don't mutate anything.
//! 3. Signatures verify the bytes the client transmitted, never a
//!    reconstruction.
//! 4. If it touches an identity row, it has tests. Plural.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod generator;
pub mod handler;
pub mod nut;
pub mod storage;
pub mod store;
pub mod tif;
pub mod validator;
pub mod wire;

pub use codec::NonceCodec;
pub use config::SqrlConfig;
pub use handler::{HandlerError, ParamMap, RequestContext, RequestHandler};
pub use tif::Tif;
