use crate::config::ApiConfig;
use crate::counter_store::CounterStore;
use crate::event_adapter::EventAdapter;
use crate::storage_layout::StorageLayout;
use crate::telegram::{BotApi, Update};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Header carrying the `secret_token` registered with `setWebhook`
pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub adapter: Arc<EventAdapter>,
    pub bot: Arc<dyn BotApi>,
    pub layout: StorageLayout,
    pub counters: Arc<CounterStore>,
    pub webhook_secret: String,
    pub public_host: Option<String>,
    /// In-flight update dispatches, drained on shutdown
    pub tasks: TaskTracker,
}

impl AppState {
    /// Public URL Telegram should deliver updates to
    pub fn webhook_url(&self) -> Option<String> {
        self.public_host
            .as_deref()
            .map(|host| format!("https://{}/webhook/{}", host, self.webhook_secret))
    }

    /// Both the path segment and the secret-token header must match
    fn is_authorized(&self, path_secret: &str, headers: &HeaderMap) -> bool {
        let expected = self.webhook_secret.as_bytes();
        let header = headers
            .get(SECRET_TOKEN_HEADER)
            .map(|value| value.as_bytes())
            .unwrap_or_default();

        // Both comparisons always run.
        let path_ok = constant_time_eq(path_secret.as_bytes(), expected);
        let header_ok = constant_time_eq(header, expected);
        !expected.is_empty() && path_ok & header_ok
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Webhook registration response; never contains the secret
#[derive(Debug, Serialize)]
pub struct SetWebhookResponse {
    pub host: String,
    pub registered: bool,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/webhook/:secret", post(receive_update))
        .route("/set_webhook", get(set_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "partybox-intake"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.layout.check_writable().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "storage": "writable",
                "known_users": state.counters.known_users()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "storage": "unwritable",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept a Telegram update and process it in the background
async fn receive_update(
    State(state): State<AppState>,
    Path(secret): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, (StatusCode, Json<ErrorResponse>)> {
    // Checked before the body is parsed; forged updates learn nothing.
    if !state.is_authorized(&secret, &headers) {
        warn!("Webhook called without a valid secret");
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        ));
    }

    let update: Update = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Malformed update");
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Malformed update".to_string(),
                code: "BAD_UPDATE".to_string(),
            }),
        )
    })?;

    // Telegram redelivers when the response is slow; reply first.
    let adapter = state.adapter.clone();
    state
        .tasks
        .spawn(async move { adapter.dispatch(update).await });

    Ok("OK")
}

/// Register the webhook with Telegram
#[instrument(skip(state))]
async fn set_webhook(
    State(state): State<AppState>,
) -> Result<Json<SetWebhookResponse>, (StatusCode, Json<ErrorResponse>)> {
    let url = state.webhook_url().ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "telegram.public_host is not configured".to_string(),
                code: "NO_PUBLIC_HOST".to_string(),
            }),
        )
    })?;

    let registered = state
        .bot
        .set_webhook(&url, &state.webhook_secret)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to register webhook");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: "Failed to register webhook".to_string(),
                    code: "WEBHOOK_ERROR".to_string(),
                }),
            )
        })?;

    let host = state.public_host.clone().unwrap_or_default();
    info!(host = %host, registered = registered, "Webhook registration requested");
    Ok(Json(SetWebhookResponse { host, registered }))
}

/// Start the webhook server; returns once `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting webhook server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Webhook server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;
    use crate::intake::IntakePipeline;
    use crate::storage_layout::UserId;
    use crate::telegram::MockBotApi;
    use crate::transform::MockPhotoTransform;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SECRET: &str = "9f2c4e1a7b3d5f60";
    const ADMIN: i64 = 1;

    fn state(root: &TempDir, bot: MockBotApi, public_host: Option<&str>) -> AppState {
        let layout = StorageLayout::new(root.path());
        let counters = Arc::new(CounterStore::new(layout.clone()));
        let mut transform = MockPhotoTransform::new();
        transform.expect_apply().returning(|raw| Ok(raw.to_vec()));
        let intake = Arc::new(IntakePipeline::new(
            layout.clone(),
            counters.clone(),
            Arc::new(transform),
            15,
            Duration::from_secs(5),
        ));
        let bot: Arc<dyn BotApi> = Arc::new(bot);
        let adapter = Arc::new(EventAdapter::new(
            bot.clone(),
            intake,
            counters.clone(),
            ArchiveBuilder::new(layout.clone()),
            Some(UserId(ADMIN)),
        ));

        AppState {
            adapter,
            bot,
            layout,
            counters,
            webhook_secret: SECRET.to_string(),
            public_host: public_host.map(String::from),
            tasks: TaskTracker::new(),
        }
    }

    fn update_request(path_secret: &str, header: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/webhook/{}", path_secret))
            .header("content-type", "application/json");
        if let Some(token) = header {
            builder = builder.header(SECRET_TOKEN_HEADER, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn download_all_body() -> String {
        serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 1,
                "chat": {"id": ADMIN},
                "from": {"id": ADMIN},
                "text": "/download_all"
            }
        })
        .to_string()
    }

    /// Bot that counts the archives it is asked to send
    fn counting_bot(sent: Arc<AtomicUsize>) -> MockBotApi {
        let mut bot = MockBotApi::new();
        bot.expect_send_document().returning(move |_, _, _, _| {
            sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bot.expect_send_message().returning(|_, _| Ok(()));
        bot
    }

    async fn seeded_state(root: &TempDir, bot: MockBotApi) -> AppState {
        let state = state(root, bot, None);
        state.layout.ensure_namespace(UserId(2)).await.unwrap();
        state.layout.write_photo(UserId(2), 1, b"guest photo").unwrap();
        state
    }

    #[test]
    fn test_webhook_url() {
        let root = TempDir::new().unwrap();
        let state = state(&root, MockBotApi::new(), Some("bot.example.com"));
        assert_eq!(
            state.webhook_url(),
            Some(format!("https://bot.example.com/webhook/{}", SECRET))
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[tokio::test]
    async fn test_webhook_accepts_known_secret() {
        let root = TempDir::new().unwrap();
        let router = create_router(state(&root, MockBotApi::new(), None));

        let response = router
            .oneshot(update_request(SECRET, Some(SECRET), r#"{"update_id": 1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_rejects_unknown_secret() {
        let root = TempDir::new().unwrap();
        let router = create_router(state(&root, MockBotApi::new(), None));

        let response = router
            .oneshot(update_request("guess", Some("guess"), r#"{"update_id": 1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_forged_privileged_update_sends_nothing() {
        let root = TempDir::new().unwrap();
        let sent = Arc::new(AtomicUsize::new(0));
        let state = seeded_state(&root, counting_bot(sent.clone())).await;
        let tasks = state.tasks.clone();
        let router = create_router(state);

        let forged = [
            update_request("telegram", None, &download_all_body()),
            update_request(SECRET, None, &download_all_body()),
            update_request(SECRET, Some("telegram"), &download_all_body()),
            update_request("telegram", Some(SECRET), &download_all_body()),
        ];
        for request in forged {
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        tasks.close();
        tasks.wait().await;
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_authenticated_privileged_update_is_dispatched() {
        let root = TempDir::new().unwrap();
        let sent = Arc::new(AtomicUsize::new(0));
        let state = seeded_state(&root, counting_bot(sent.clone())).await;
        let tasks = state.tasks.clone();
        let router = create_router(state);

        let response = router
            .oneshot(update_request(SECRET, Some(SECRET), &download_all_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        tasks.close();
        tasks.wait().await;
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_update_is_bad_request() {
        let root = TempDir::new().unwrap();
        let router = create_router(state(&root, MockBotApi::new(), None));

        let response = router
            .oneshot(update_request(SECRET, Some(SECRET), "not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_set_webhook_registers_public_url_with_secret_token() {
        let root = TempDir::new().unwrap();
        let mut bot = MockBotApi::new();
        bot.expect_set_webhook()
            .withf(|url, token| {
                url == format!("https://bot.example.com/webhook/{}", SECRET) && token == SECRET
            })
            .times(1)
            .returning(|_, _| Ok(true));
        let router = create_router(state(&root, bot, Some("bot.example.com")));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/set_webhook")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(!body.contains(SECRET));
    }

    #[tokio::test]
    async fn test_set_webhook_without_public_host() {
        let root = TempDir::new().unwrap();
        let router = create_router(state(&root, MockBotApi::new(), None));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/set_webhook")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_readiness() {
        let root = TempDir::new().unwrap();
        let router = create_router(state(&root, MockBotApi::new(), None));

        let response = router
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
