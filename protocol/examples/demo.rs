//! Walks a complete SQRL login in-process: mint a page nut, probe with
//! `query`, authenticate with `ident`, and watch the login page's poll flip
//! to authenticated.
//!
//! Run with: `cargo run --example demo -p sqrl-protocol`

use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use sqrl_protocol::crypto::Ed25519Verifier;
use sqrl_protocol::generator::Generator;
use sqrl_protocol::handler::{ParamMap, RequestContext, RequestHandler};
use sqrl_protocol::store::{IdentityStore, MemoryStore, NutBackend};
use sqrl_protocol::tif::Tif;
use sqrl_protocol::wire::{base64url, ServerParam};
use sqrl_protocol::SqrlConfig;

fn main() {
    let config = SqrlConfig {
        domain: "demo.example.com".into(),
        nonce_salt: "demo-salt".into(),
        friendly_name: "Demo Server".into(),
        ..SqrlConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let backend = NutBackend::stateful(store.clone());
    let verifier = Arc::new(Ed25519Verifier);
    let ctx = RequestContext {
        remote_ip: "203.0.113.5".parse().unwrap(),
        secure: true,
    };

    // A client identity that enrolled earlier.
    let kp = SigningKey::generate(&mut OsRng);
    let idk = base64url::encode(kp.verifying_key().as_bytes());
    store.create_identity(&idk, "demo-suk", "demo-vuk").unwrap();

    // --- The login page mints a nut and renders the URL ---
    let mut gen = Generator::new(config.clone(), backend.clone(), ctx.remote_ip);
    let url = gen.get_url().unwrap();
    let page_nut = gen.get_nonce(Tif::NONE, None, None).unwrap();
    println!("login page URL : {}", url);

    // --- Round 1: the client scans the URL and sends `query` ---
    let (tif, body) = round(&config, &store, &backend, &verifier, ctx, &kp, &idk,
        &page_nut, &base64url::encode(&url), "query");
    println!("query  round   : tif={} ({:?})", tif.as_hex(), tif);

    // --- Round 2: the client confirms and sends `ident` ---
    let next_nut = field(&body, "nut");
    let (tif, _) = round(&config, &store, &backend, &verifier, ctx, &kp, &idk,
        &next_nut, &body, "ident");
    println!("ident  round   : tif={} ({:?})", tif.as_hex(), tif);

    // --- The login page polls with its original nut ---
    let authed = backend.session_authenticated(&page_nut).unwrap();
    println!("page poll      : authenticated={}", authed);
    assert!(authed);
}

#[allow(clippy::too_many_arguments)]
fn round(
    config: &SqrlConfig,
    store: &Arc<MemoryStore>,
    backend: &NutBackend,
    verifier: &Arc<Ed25519Verifier>,
    ctx: RequestContext,
    kp: &SigningKey,
    idk: &str,
    nut: &str,
    server_echo: &str,
    cmd: &str,
) -> (Tif, String) {
    let client_param = base64url::encode(
        [
            "ver=1".to_string(),
            format!("cmd={}", cmd),
            format!("idk={}", idk),
        ]
        .join("\r\n"),
    );
    let mut message = client_param.clone().into_bytes();
    message.extend_from_slice(server_echo.as_bytes());
    let ids = base64url::encode(kp.sign(&message).to_bytes());

    let mut get = ParamMap::new();
    get.insert("nut".into(), nut.to_string());
    let mut post = ParamMap::new();
    post.insert("client".into(), client_param);
    post.insert("server".into(), server_echo.to_string());
    post.insert("ids".into(), ids);

    let mut handler = RequestHandler::new(
        config.clone(),
        store.clone(),
        backend.clone(),
        verifier.clone(),
        ctx,
    );
    handler.parse_request(&get, &post).unwrap();
    let body = handler.response_message().unwrap();
    (handler.tif(), body)
}

fn field(body: &str, key: &str) -> String {
    ServerParam::parse(body)
        .ok()
        .and_then(|p| p.field(key).map(str::to_string))
        .expect("field present")
}
