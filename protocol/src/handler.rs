//! # Request Handler — the Protocol State Machine
//!
//! One [`RequestHandler`] lives per inbound protocol round. It parses the
//! request, runs the validation pipeline, dispatches the client's command
//! chain against the identity store, accumulates the TIF mask, and formats
//! the response.
//!
//! ## The pipeline
//!
//! ```text
//! required fields → server echo → IP bit → nut status → signatures
//!        │                                                  │
//!        └── any failure: terminal TIF bits ────────────────┘
//!                                                           │
//!                              dispatch: query / ident / lock (in order,
//!                              stops once COMMAND_FAILED is set)
//!                                                           │
//!                              response: fresh nut + qry + tif + suk rule
//! ```
//!
//! ## Atomicity
//!
//! Every command checks all of its preconditions before touching the store;
//! a failing command mutates nothing and sets COMMAND_FAILED, which also
//! stops the rest of the chain. Store failures are a different animal
//! entirely: they abort the request as a [`HandlerError`] so a partial
//! mutation is never dressed up as a protocol result.
//!
//! ## Command dispatch
//!
//! The verb set is a closed enum. Anything outside {`query`, `ident`,
//! `lock`} is ignored — verbs are never resolved into method names or any
//! other open-ended lookup.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::config::SqrlConfig;
use crate::crypto::SignatureVerifier;
use crate::generator::Generator;
use crate::nut::NutStatus;
use crate::store::{IdentityStatus, IdentityStore, NutBackend, StoreError};
use crate::tif::Tif;
use crate::validator::Validator;
use crate::wire::{ClientRequest, ServerParam, ServerResponse};

/// Request parameters as the transport hands them over: the query string
/// map for GET and the form body map for POST.
pub type ParamMap = HashMap<String, String>;

/// Transport facts about the request.
#[derive(Clone, Copy, Debug)]
pub struct RequestContext {
    /// The requesting client's IP address.
    pub remote_ip: IpAddr,
    /// Whether the request arrived over the secure transport.
    pub secure: bool,
}

/// Fatal request failures — storage and infrastructure only.
///
/// Protocol-level failures never land here; they are expressed through the
/// TIF mask in a normal response.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The closed set of command verbs this server executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Query,
    Ident,
    Lock,
}

impl Command {
    /// Map a wire verb onto the enum. Unknown verbs map to `None` and are
    /// skipped by dispatch.
    fn from_verb(verb: &str) -> Option<Command> {
        match verb {
            "query" => Some(Command::Query),
            "ident" => Some(Command::Ident),
            "lock" => Some(Command::Lock),
            _ => None,
        }
    }
}

/// Per-request protocol state machine.
pub struct RequestHandler {
    config: SqrlConfig,
    identities: Arc<dyn IdentityStore>,
    backend: NutBackend,
    validator: Validator,
    generator: Generator,
    ctx: RequestContext,

    tif: Tif,
    request_nut: Option<String>,
    client: Option<ClientRequest>,
    /// The nut the response should supersede; only set when the presented
    /// nut was actually found (valid or expired). Chaining onto a nut that
    /// never existed, or was already consumed, would either fail or hand an
    /// attacker a way to burn someone else's nonce.
    chain_to: Option<String>,
    /// Identity key committed after all signatures verified.
    auth_key: Option<String>,
    /// Whether a valid `urs` signature accompanied this request.
    urs_verified: bool,
    /// Whether a command in this round logged the session in.
    logged_in: bool,
}

impl RequestHandler {
    pub fn new(
        config: SqrlConfig,
        identities: Arc<dyn IdentityStore>,
        backend: NutBackend,
        verifier: Arc<dyn SignatureVerifier>,
        ctx: RequestContext,
    ) -> Self {
        let validator = Validator::new(config.clone(), backend.clone(), verifier);
        let generator = Generator::new(config.clone(), backend.clone(), ctx.remote_ip);
        RequestHandler {
            config,
            identities,
            backend,
            validator,
            generator,
            ctx,
            tif: Tif::NONE,
            request_nut: None,
            client: None,
            chain_to: None,
            auth_key: None,
            urs_verified: false,
            logged_in: false,
        }
    }

    /// The TIF mask accumulated so far. Final once
    /// [`parse_request`](Self::parse_request) returns.
    pub fn tif(&self) -> Tif {
        self.tif
    }

    /// Whether this round authenticated its session.
    pub fn logged_in(&self) -> bool {
        self.logged_in
    }

    /// Parse and execute one protocol round.
    ///
    /// Never fails on client misbehavior — that is what the TIF mask is
    /// for. Errors mean the store broke underneath us.
    pub fn parse_request(&mut self, get: &ParamMap, post: &ParamMap) -> Result<(), HandlerError> {
        // Step 1: required fields. Without them there is nothing to
        // validate and nothing to dispatch.
        let (Some(nut), Some(client_param), Some(server_param), Some(ids)) = (
            get.get("nut"),
            post.get("client"),
            post.get("server"),
            post.get("ids"),
        ) else {
            tracing::debug!("request missing required fields");
            self.fail_client();
            return Ok(());
        };
        self.request_nut = Some(nut.clone());

        // Steps 2-3: decode the two transmitted blocks.
        let Ok(server) = ServerParam::parse(server_param) else {
            self.fail_client();
            return Ok(());
        };
        let client = match ClientRequest::parse(client_param) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(error = %e, "client parameter rejected");
                self.fail_client();
                return Ok(());
            }
        };

        // Step 4: the server echo must be exactly what we last sent for
        // this nut.
        if !self
            .validator
            .validate_server(&server, nut, self.ctx.secure)?
        {
            tracing::debug!("server echo mismatch");
            self.client = Some(client);
            self.fail_client();
            return Ok(());
        }

        // Step 5: informational IP bit, set before nut validation so even
        // failure responses carry it when the nut is known.
        if self.validator.nut_ip_matches(nut, self.ctx.remote_ip)? {
            self.tif |= Tif::IP_MATCH;
        }

        // Step 6: nut status.
        match self.validator.validate_nut(nut, Some(&client.idk))? {
            NutStatus::Valid => {
                self.chain_to = Some(nut.clone());
            }
            NutStatus::Expired => {
                // Recoverable: the response carries a fresh nut chained to
                // this one, and the client retries.
                self.chain_to = Some(nut.clone());
                self.client = Some(client);
                self.tif |= Tif::COMMAND_FAILED | Tif::TRANSIENT_ERROR;
                return Ok(());
            }
            NutStatus::KeyMismatch => {
                self.client = Some(client);
                self.tif |= Tif::COMMAND_FAILED | Tif::CLIENT_FAILURE | Tif::BAD_ID_ASSOCIATION;
                return Ok(());
            }
            NutStatus::Invalid => {
                self.client = Some(client);
                self.fail_client();
                return Ok(());
            }
        }

        // Step 7: signatures, all over the concatenation of the two
        // parameters exactly as transmitted. Reconstructing the message
        // from parsed fields would verify something the client never
        // signed.
        let mut message = Vec::with_capacity(client_param.len() + server_param.len());
        message.extend_from_slice(client_param.as_bytes());
        message.extend_from_slice(server_param.as_bytes());

        if !self.validator.validate_signature(&message, &client.idk, ids) {
            tracing::debug!("ids signature failed");
            self.client = Some(client);
            self.fail_client();
            return Ok(());
        }

        if let Some(pidk) = client.pidk.clone() {
            let Some(pids) = post.get("pids") else {
                self.client = Some(client);
                self.fail_client();
                return Ok(());
            };
            if !self.validator.validate_signature(&message, &pidk, pids) {
                tracing::debug!("pids signature failed");
                self.client = Some(client);
                self.fail_client();
                return Ok(());
            }
        }

        if let Some(urs) = post.get("urs") {
            // The unlock-request signature verifies against the VUK we
            // hold for the previous identity during migration, or against
            // the VUK the client supplied otherwise.
            let target_vuk = match &client.pidk {
                Some(pidk) => self.identities.get_vuk(pidk)?,
                None => client.vuk.clone(),
            };
            let verified = match target_vuk {
                Some(vuk) => self.validator.validate_signature(&message, &vuk, urs),
                None => false,
            };
            if !verified {
                tracing::debug!("urs signature failed");
                self.client = Some(client);
                self.fail_client();
                return Ok(());
            }
            self.urs_verified = true;
        }

        // Step 8: all checks passed — commit the parsed request.
        self.auth_key = Some(client.idk.clone());
        self.client = Some(client.clone());

        // Step 9: dispatch the command chain in order.
        let nut = nut.clone();
        for verb in &client.commands {
            if self.tif.contains(Tif::COMMAND_FAILED) {
                break;
            }
            match Command::from_verb(verb) {
                Some(Command::Query) => self.cmd_query(&client)?,
                Some(Command::Ident) => self.cmd_ident(&client, &nut)?,
                Some(Command::Lock) => self.cmd_lock(&client, &nut)?,
                None => {
                    tracing::debug!(verb = verb.as_str(), "ignoring unknown verb");
                }
            }
        }

        Ok(())
    }

    /// Build the response body (base64url, unpadded): the next nut, the
    /// uppercase-hex TIF, the query path, and the `suk` when the protocol
    /// obliges us to reveal it.
    pub fn response_message(&mut self) -> Result<String, HandlerError> {
        let nut = self.generator.get_nonce(
            self.tif,
            self.auth_key.as_deref(),
            self.chain_to.as_deref(),
        )?;
        let qry = self.generator.generate_qry()?;
        let suk = self.response_suk()?;

        let response = ServerResponse {
            ver: self.config.accepted_versions.clone(),
            nut,
            tif: self.tif,
            qry,
            sfn: self.config.friendly_name.clone(),
            suk,
            ask: None,
        };

        tracing::debug!(tif = ?self.tif, "protocol round complete");
        Ok(response.to_body())
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// `query` — a read-only probe: what does this server know about the
    /// presented identity?
    fn cmd_query(&mut self, client: &ClientRequest) -> Result<(), HandlerError> {
        match self.identities.check_identity_key(&client.idk)? {
            IdentityStatus::Active => {
                self.tif |= Tif::ID_MATCH;
            }
            IdentityStatus::Locked => {
                self.tif |= Tif::ID_MATCH | Tif::SQRL_DISABLED;
            }
            IdentityStatus::Unknown => {
                if let Some(pidk) = &client.pidk {
                    if self.identities.check_identity_key(pidk)? == IdentityStatus::Active {
                        self.tif |= Tif::PREVIOUS_ID_MATCH;
                        return Ok(());
                    }
                }
                if !self.config.anon_allowed {
                    self.tif |= Tif::FUNCTION_NOT_SUPPORTED | Tif::COMMAND_FAILED;
                }
            }
        }
        Ok(())
    }

    /// `ident` — the authenticating command: log in, create, migrate, or
    /// unlock, depending on what the store knows about the key.
    fn cmd_ident(&mut self, client: &ClientRequest, nut: &str) -> Result<(), HandlerError> {
        match self.identities.check_identity_key(&client.idk)? {
            IdentityStatus::Active => {
                self.backend.log_session_in(nut)?;
                self.logged_in = true;
                self.tif |= Tif::ID_MATCH;
            }

            IdentityStatus::Unknown => match &client.pidk {
                // Previous-key migration: the old identity re-keys itself.
                Some(pidk) => {
                    if self.identities.check_identity_key(pidk)? != IdentityStatus::Active {
                        self.fail_client();
                        return Ok(());
                    }
                    let (Some(suk), Some(vuk)) = (&client.suk, &client.vuk) else {
                        self.fail_client();
                        return Ok(());
                    };
                    // The rekey must be authorized by the unlock request
                    // signature under the old identity's VUK.
                    if !self.urs_verified {
                        self.fail_client();
                        return Ok(());
                    }
                    self.identities
                        .update_identity_key(pidk, &client.idk, suk, vuk)?;
                    self.backend.log_session_in(nut)?;
                    self.logged_in = true;
                    self.tif |= Tif::ID_MATCH | Tif::PREVIOUS_ID_MATCH;
                    tracing::info!("identity migrated to a new key");
                }

                // Anonymous creation.
                None => {
                    if !self.config.anon_allowed {
                        self.tif |= Tif::FUNCTION_NOT_SUPPORTED | Tif::COMMAND_FAILED;
                        return Ok(());
                    }
                    let (Some(suk), Some(vuk)) = (&client.suk, &client.vuk) else {
                        self.fail_client();
                        return Ok(());
                    };
                    self.identities.create_identity(&client.idk, suk, vuk)?;
                    self.backend.log_session_in(nut)?;
                    self.logged_in = true;
                    self.tif |= Tif::ID_MATCH;
                    tracing::info!("new identity registered");
                }
            },

            IdentityStatus::Locked => {
                // Unlock: requires the client to present the SUK and the
                // matching VUK for the locked identity.
                let stored_vuk = self.identities.get_vuk(&client.idk)?;
                let authorized = matches!(
                    (&client.suk, &client.vuk, stored_vuk.as_deref()),
                    (Some(_), Some(vuk), Some(stored)) if vuk == stored
                );
                if !authorized {
                    self.fail_client();
                    return Ok(());
                }
                self.identities.unlock_identity_key(&client.idk)?;
                self.backend.log_session_in(nut)?;
                self.logged_in = true;
                self.tif |= Tif::ID_MATCH;
                tracing::info!("identity unlocked");
            }
        }
        Ok(())
    }

    /// `lock` — disable the identity and kill its session. The client can
    /// re-enable later via `ident` with its unlock keys.
    fn cmd_lock(&mut self, client: &ClientRequest, nut: &str) -> Result<(), HandlerError> {
        match self.identities.check_identity_key(&client.idk)? {
            IdentityStatus::Active | IdentityStatus::Locked => {
                self.identities.lock_identity_key(&client.idk)?;
                self.backend.end_session(nut)?;
                self.tif |= Tif::ID_MATCH | Tif::SQRL_DISABLED;
                tracing::info!("identity locked");
            }
            IdentityStatus::Unknown => {
                self.fail_client();
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn fail_client(&mut self) {
        self.tif |= Tif::COMMAND_FAILED | Tif::CLIENT_FAILURE;
    }

    /// The conditional `suk` disclosure: a locked identity's client needs
    /// its SUK to build an unlock request (unless this very round locked
    /// it), and a migrating client needs the previous identity's SUK
    /// (unless this very round completed the migration).
    fn response_suk(&self) -> Result<Option<String>, HandlerError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };

        if self.tif.contains(Tif::SQRL_DISABLED) && !client.has_command("lock") {
            return Ok(self.identities.get_suk(&client.idk)?);
        }

        if self.tif.contains(Tif::PREVIOUS_ID_MATCH) && !client.has_command("ident") {
            if let Some(pidk) = &client.pidk {
                return Ok(self.identities.get_suk(pidk)?);
            }
        }

        Ok(None)
    }
}
