//! End-to-end gateway tests driven through the router, no sockets.

use anyhow::bail;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use picoclaw::agent::{AgentProcessor, AgentRequest};
use picoclaw::config::Config;
use picoclaw::gateway::{build_router, build_state, AppState};
use picoclaw::identity::AuthMethod;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

/// Records the last request it saw and replies (or fails) on command.
struct MockAgent {
    last_request: Mutex<Option<AgentRequest>>,
    fail: bool,
}

impl MockAgent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            last_request: Mutex::new(None),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            last_request: Mutex::new(None),
            fail: true,
        })
    }

    fn last(&self) -> Option<AgentRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentProcessor for MockAgent {
    async fn process(&self, request: AgentRequest) -> anyhow::Result<String> {
        *self.last_request.lock().unwrap() = Some(request);
        if self.fail {
            bail!("agent exploded");
        }
        Ok("processed".to_string())
    }
}

fn gateway(require_pairing: bool, jwt_secret: Option<&str>, agent: Arc<MockAgent>) -> (AppState, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.config_path = dir.path().join("config.toml");
    config.workspace_dir = dir.path().join("workspace");
    config.gateway.require_pairing = require_pairing;
    config.gateway.jwt_secret = jwt_secret.map(str::to_string);
    let state = build_state(config, agent).unwrap();
    (state, dir)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn pair_request(code: &str) -> Request<Body> {
    Request::post("/pair")
        .header("X-Pairing-Code", code)
        .body(Body::empty())
        .unwrap()
}

fn webhook_json(token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::post("/webhook").header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn signed_token(sub: &str, secret: &str) -> String {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &serde_json::json!({"sub": sub, "exp": chrono::Utc::now().timestamp() + 3600}),
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn pairing_lifecycle() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(true, None, agent);
    let code = state.pairing.current_code().unwrap();
    let app = build_router(state.clone());

    // Wrong code: 403, and the code survives for a correct retry.
    let response = app.clone().oneshot(pair_request("000000")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(state.pairing.current_code().is_some());

    // Correct code: 200 with a pc_ token.
    let response = app.clone().oneshot(pair_request(&code)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["paired"], true);
    let token = json["token"].as_str().unwrap().to_string();
    assert!(token.starts_with("pc_"));

    // Replay: 410 Gone, and a fresh code was minted for the console.
    let response = app.clone().oneshot(pair_request(&code)).await.unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
    let fresh = state.pairing.current_code().unwrap();
    assert_ne!(fresh, code);

    // The issued token authorizes webhook traffic.
    let response = app
        .oneshot(webhook_json(Some(&token), serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn pairing_persists_hashed_token_to_config() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(true, None, agent);
    let code = state.pairing.current_code().unwrap();
    let app = build_router(state.clone());

    let response = app.oneshot(pair_request(&code)).await.unwrap();
    let json = json_body(response).await;
    let token = json["token"].as_str().unwrap();

    let saved = std::fs::read_to_string(&state.config.lock().config_path).unwrap();
    // Only the hash lands on disk, never the plaintext.
    assert!(!saved.contains(token));
    let persisted = &state.config.lock().gateway.paired_tokens;
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].len(), 64);
}

#[tokio::test]
async fn webhook_rejects_unauthenticated_when_pairing_required() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(true, None, agent.clone());
    let app = build_router(state);

    let response = app
        .clone()
        .oneshot(webhook_json(None, serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("unauthorized"));

    let response = app
        .oneshot(webhook_json(Some("pc_bogus"), serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(agent.last().is_none());
}

#[tokio::test]
async fn bootstrap_window_closes_after_first_pairing() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, None, agent.clone());
    let code = state.pairing.current_code().unwrap();
    let app = build_router(state);

    // No credentials exist yet and pairing is optional: anonymous access.
    let response = app
        .clone()
        .oneshot(webhook_json(None, serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(agent.last().unwrap().identity.method, AuthMethod::Bootstrap);

    // First credential closes the window for good.
    let response = app.clone().oneshot(pair_request(&code)).await.unwrap();
    let token = json_body(response).await["token"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(webhook_json(None, serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(webhook_json(Some(&token), serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        agent.last().unwrap().identity.method,
        AuthMethod::PairedToken
    );
}

#[tokio::test]
async fn health_reports_paired_after_exchange() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(true, None, agent);
    let code = state.pairing.current_code().unwrap();
    let app = build_router(state);

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_body(response).await["paired"], false);

    app.clone().oneshot(pair_request(&code)).await.unwrap();

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_body(response).await["paired"], true);
}

#[tokio::test]
async fn webhook_rejects_empty_message_without_files() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, None, agent.clone());
    let app = build_router(state);

    let response = app
        .clone()
        .oneshot(webhook_json(None, serde_json::json!({"message": "   "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(webhook_json(None, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(agent.last().is_none());
}

#[tokio::test]
async fn webhook_rejects_invalid_json() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, None, agent);
    let app = build_router(state);

    let response = app
        .oneshot(
            Request::post("/webhook")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn file_only_multipart_gets_placeholder_message() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, None, agent.clone());
    let app = build_router(state);

    let boundary = "testboundary42";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"receipt.jpg\"\r\n\
         Content-Type: image/jpeg\r\n\r\n\
         fakejpegbytes\r\n\
         --{boundary}--\r\n"
    );
    let response = app
        .oneshot(
            Request::post("/webhook")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = agent.last().unwrap();
    assert_eq!(request.message, "Process the attached receipt");
    assert_eq!(request.media_paths.len(), 1);
    assert!(request.media_paths[0]
        .to_string_lossy()
        .contains("receipt.jpg"));
    assert_eq!(std::fs::read(&request.media_paths[0]).unwrap(), b"fakejpegbytes");
}

#[tokio::test]
async fn multipart_upload_larger_than_two_megabytes_accepted() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, None, agent.clone());
    let app = build_router(state);

    // Well past axum's built-in 2 MB extractor default, under the 20 MiB cap.
    let payload = vec![0x5au8; 3 * 1024 * 1024];
    let boundary = "testboundary44";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"message\"\r\n\r\n\
             scan this\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"big-receipt.jpg\"\r\n\
             Content-Type: image/jpeg\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&payload);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let response = app
        .oneshot(
            Request::post("/webhook")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = agent.last().unwrap();
    assert_eq!(request.message, "scan this");
    assert_eq!(request.media_paths.len(), 1);
    assert_eq!(
        std::fs::metadata(&request.media_paths[0]).unwrap().len(),
        payload.len() as u64
    );
}

#[tokio::test]
async fn truncated_multipart_body_is_rejected() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, None, agent.clone());
    let app = build_router(state);

    // Body ends mid-part, no closing boundary: nothing must be dispatched.
    let boundary = "testboundary45";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"receipt.jpg\"\r\n\
         Content-Type: image/jpeg\r\n\r\n\
         partialbyt"
    );
    let response = app
        .oneshot(
            Request::post("/webhook")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(agent.last().is_none());
}

#[tokio::test]
async fn multipart_message_and_business_id_are_parsed() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, Some("shared-secret"), agent.clone());
    let app = build_router(state.clone());

    let token = signed_token("maria", "shared-secret");
    let boundary = "testboundary43";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"message\"\r\n\r\n\
         categorize this\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"business_id\"\r\n\r\n\
         biz-7\r\n\
         --{boundary}--\r\n"
    );
    let response = app
        .oneshot(
            Request::post("/webhook")
                .header("authorization", format!("Bearer {token}"))
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = agent.last().unwrap();
    assert_eq!(request.message, "categorize this");
    assert_eq!(request.session_key, "user:maria");
    assert_eq!(request.identity.business_id.as_deref(), Some("biz-7"));

    // The JWT caller's business auth was persisted for later heartbeats.
    let auth = state.state.active_auth();
    assert_eq!(auth["biz-7"].jwt_token, token);
    assert_eq!(auth["biz-7"].channel, "api");
    assert_eq!(auth["biz-7"].chat_id, "mobile-client");
}

#[tokio::test]
async fn jwt_business_auth_not_recorded_for_opaque_tokens() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, Some("shared-secret"), agent);
    let code = state.pairing.current_code().unwrap();
    let app = build_router(state.clone());

    let response = app.clone().oneshot(pair_request(&code)).await.unwrap();
    let token = json_body(response).await["token"].as_str().unwrap().to_string();

    let response = app
        .oneshot(webhook_json(
            Some(&token),
            serde_json::json!({"message": "hi", "business_id": "biz-9"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // business_id travels with the request but no auth entry is written
    // without a signed token behind it.
    assert!(state.state.active_auth().is_empty());
}

#[tokio::test]
async fn agent_failure_maps_to_500() {
    let agent = MockAgent::failing();
    let (state, _dir) = gateway(false, None, agent);
    let app = build_router(state);

    let response = app
        .oneshot(webhook_json(None, serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = json_body(response).await;
    assert_eq!(json["error"], "Agent processing failed");
    assert!(json.get("response").is_none());
}

#[tokio::test]
async fn successful_webhook_reports_model() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(false, None, agent.clone());
    let app = build_router(state);

    let response = app
        .oneshot(webhook_json(None, serde_json::json!({"message": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["response"], "processed");
    assert_eq!(json["model"], "default");

    let request = agent.last().unwrap();
    assert_eq!(request.channel, "api");
    assert_eq!(request.chat_id, "mobile-client");
    assert!(request.session_key.starts_with("api:"));
}

#[tokio::test]
async fn expired_jwt_is_rejected_with_reason() {
    let agent = MockAgent::new();
    let (state, _dir) = gateway(true, Some("shared-secret"), agent);
    let app = build_router(state);

    let stale = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &serde_json::json!({"sub": "maria", "exp": chrono::Utc::now().timestamp() - 60}),
        &jsonwebtoken::EncodingKey::from_secret(b"shared-secret"),
    )
    .unwrap();

    let response = app
        .oneshot(webhook_json(Some(&stale), serde_json::json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("expired"));
}
