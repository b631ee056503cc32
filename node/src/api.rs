//! # HTTP API
//!
//! Builds the axum router that exposes the SQRL server over HTTP. All
//! handlers share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path           | Description                                  |
//! |--------|----------------|----------------------------------------------|
//! | GET    | `/health`      | Liveness probe                               |
//! | GET    | `/sqrl/nut`    | Mint a login nut + URL for page rendering    |
//! | POST   | `/sqrl/auth`   | The protocol endpoint clients POST to        |
//! | GET    | `/sqrl/status` | Has this nut's session authenticated yet?    |
//!
//! The auth endpoint speaks the SQRL wire format: query parameter `nut`,
//! form body `client`/`server`/`ids` (plus optional `pids`/`urs`), and a
//! base64url response body. Everything else is JSON for the login page's
//! benefit.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use sqrl_protocol::crypto::SignatureVerifier;
use sqrl_protocol::generator::Generator;
use sqrl_protocol::handler::{ParamMap, RequestContext, RequestHandler};
use sqrl_protocol::store::{IdentityStore, NutBackend};
use sqrl_protocol::tif::Tif;
use sqrl_protocol::SqrlConfig;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state for all request handlers.
///
/// Cheap to clone — everything is behind an `Arc` or already shared.
#[derive(Clone)]
pub struct AppState {
    /// Protocol configuration, fixed at startup.
    pub config: SqrlConfig,
    /// Identity persistence.
    pub identities: Arc<dyn IdentityStore>,
    /// Nonce backend (stateful table or stateless codec).
    pub backend: NutBackend,
    /// Signature verification capability.
    pub verifier: Arc<dyn SignatureVerifier>,
    /// Prometheus metric handles.
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/sqrl/nut", get(nut_handler))
        .route("/sqrl/auth", post(auth_handler))
        .route("/sqrl/status", get(status_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// `/health` response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// `/sqrl/nut` response body: what a login page needs to render the QR
/// link and start polling.
#[derive(Debug, Serialize, Deserialize)]
pub struct NutResponse {
    /// The freshly minted nut.
    pub nut: String,
    /// The full `sqrl://` URL for the client to scan or follow.
    pub url: String,
}

/// `/sqrl/status` query parameters.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub nut: String,
}

/// `/sqrl/status` response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub authenticated: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Whether the request arrived over a secure transport. TLS terminates in
/// front of this server, so we trust the forwarded-proto header when
/// present and fall back to the configured expectation otherwise.
fn request_secure(headers: &HeaderMap, config: &SqrlConfig) -> bool {
    match headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()) {
        Some(proto) => proto.eq_ignore_ascii_case("https"),
        None => config.secure,
    }
}

/// Liveness probe.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// Mints a login nut and the URL a login page renders.
async fn nut_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let mut generator = Generator::new(state.config.clone(), state.backend.clone(), addr.ip());
    let (url, nut) = match generator
        .get_url()
        .and_then(|url| Ok((url, generator.get_nonce(Tif::NONE, None, None)?)))
    {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "failed to mint login nut");
            return (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
        }
    };
    state.metrics.nuts_issued_total.inc();
    tracing::debug!(client = %addr.ip(), "login nut issued");
    Json(NutResponse { nut, url }).into_response()
}

/// The protocol endpoint. Always answers 200 with a protocol response
/// body unless the store itself failed — client misbehavior is reported
/// inside the TIF mask, not via HTTP status codes.
async fn auth_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ParamMap>,
    Form(form): Form<ParamMap>,
) -> impl IntoResponse {
    let timer = state.metrics.auth_latency_seconds.start_timer();
    state.metrics.auth_rounds_total.inc();

    let ctx = RequestContext {
        remote_ip: addr.ip(),
        secure: request_secure(&headers, &state.config),
    };
    let mut handler = RequestHandler::new(
        state.config.clone(),
        state.identities.clone(),
        state.backend.clone(),
        state.verifier.clone(),
        ctx,
    );

    let outcome = handler
        .parse_request(&query, &form)
        .and_then(|()| handler.response_message());
    timer.observe_duration();

    match outcome {
        Ok(body) => {
            let tif = handler.tif();
            if tif.contains(Tif::COMMAND_FAILED) {
                state.metrics.auth_failures_total.inc();
            }
            if handler.logged_in() {
                state.metrics.logins_total.inc();
                tracing::info!(client = %addr.ip(), tif = %tif, "session authenticated");
            }
            (
                StatusCode::OK,
                [("content-type", "application/x-www-form-urlencoded")],
                body,
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, client = %addr.ip(), "auth round aborted");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}

/// Poll endpoint for login pages: has the session behind this nut
/// authenticated yet?
async fn status_handler(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    match state.backend.session_authenticated(&query.nut) {
        Ok(authenticated) => Json(StatusResponse { authenticated }).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "status poll failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NodeMetrics;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use ed25519_dalek::{Signer, SigningKey};
    use http_body_util::BodyExt;
    use rand::rngs::OsRng;
    use sqrl_protocol::store::MemoryStore;
    use sqrl_protocol::wire::{base64url, ServerParam};
    use tower::ServiceExt;

    fn test_state(store: Arc<MemoryStore>) -> AppState {
        let config = SqrlConfig {
            domain: "test.example.com".into(),
            nonce_salt: "api-test-salt".into(),
            ..SqrlConfig::default()
        };
        AppState {
            config,
            identities: store.clone(),
            backend: NutBackend::stateful(store),
            verifier: Arc::new(sqrl_protocol::crypto::Ed25519Verifier),
            metrics: Arc::new(NodeMetrics::new()),
        }
    }

    fn app(state: AppState) -> Router {
        create_router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))))
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(Arc::new(MemoryStore::new()));
        let response = app(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn test_full_login_over_http() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());

        // Enroll an identity.
        let kp = SigningKey::generate(&mut OsRng);
        let idk = base64url::encode(kp.verifying_key().as_bytes());
        store.create_identity(&idk, "suk", "vuk").unwrap();

        // The login page fetches a nut.
        let response = app(state.clone())
            .oneshot(Request::get("/sqrl/nut").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let nut_resp: NutResponse = serde_json::from_str(&body_string(response).await).unwrap();

        // The client signs and POSTs a query round.
        let client_param = base64url::encode(
            ["ver=1".to_string(), "cmd=query".into(), format!("idk={}", idk)].join("\r\n"),
        );
        let server_param = base64url::encode(&nut_resp.url);
        let mut message = client_param.clone().into_bytes();
        message.extend_from_slice(server_param.as_bytes());
        let ids = base64url::encode(kp.sign(&message).to_bytes());

        let form = format!("client={}&server={}&ids={}", client_param, server_param, ids);
        let response = app(state.clone())
            .oneshot(
                Request::post(format!("/sqrl/auth?nut={}", nut_resp.nut))
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        let parsed = ServerParam::parse(&body).unwrap();
        // ID_MATCH | IP_MATCH.
        assert_eq!(parsed.field("tif"), Some("5"));
        assert!(parsed.field("nut").is_some());
    }

    #[tokio::test]
    async fn test_auth_rejects_garbage_with_tif_not_http_error() {
        let state = test_state(Arc::new(MemoryStore::new()));
        let response = app(state)
            .oneshot(
                Request::post("/sqrl/auth?nut=bogus")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("client=zzz&server=zzz&ids=zzz"))
                    .unwrap(),
            )
            .await
            .unwrap();
        // Protocol failures are data, not HTTP errors.
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let parsed = ServerParam::parse(&body).unwrap();
        assert_eq!(parsed.field("tif"), Some("C0"));
    }

    #[tokio::test]
    async fn test_status_poll_unknown_nut() {
        let state = test_state(Arc::new(MemoryStore::new()));
        let response = app(state)
            .oneshot(
                Request::get("/sqrl/status?nut=never-minted")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: StatusResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(!status.authenticated);
    }
}
