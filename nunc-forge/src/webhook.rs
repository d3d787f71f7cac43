//! Webhook endpoint for on-demand provisioning.
//!
//! This module provides:
//! - GitHub webhook payload parsing
//! - HMAC-SHA256 signature validation
//! - Axum HTTP handlers for the webhook and health endpoints

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::provisioner::{JobEvent, ProvisionOutcome, Provisioner};

/// GitHub webhook event types we care about
const WORKFLOW_JOB_EVENT: &str = "workflow_job";
const PING_EVENT: &str = "ping";

/// GitHub workflow_job webhook payload (partial - only fields we need)
#[derive(Debug, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: String,
    pub workflow_job: WorkflowJob,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl From<WorkflowJobEvent> for JobEvent {
    fn from(event: WorkflowJobEvent) -> Self {
        JobEvent {
            action: event.action,
            labels: event.workflow_job.labels,
        }
    }
}

/// Shared state for webhook handlers
pub struct WebhookState {
    pub secret: String,
    pub provisioner: Arc<Provisioner>,
}

/// Validate HMAC-SHA256 signature from GitHub.
///
/// GitHub sends the signature in the `X-Hub-Signature-256` header as `sha256=<hex>`.
pub fn validate_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };

    type HmacSha256 = Hmac<Sha256>;
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };

    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Build the HTTP router: `GET /health` and `POST <webhook_path>`.
pub fn http_router(state: Arc<WebhookState>, webhook_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(webhook_path, post(handle_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Handle incoming GitHub webhook.
async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !validate_signature(&state.secret, &body, signature) {
        warn!("Webhook signature validation failed");
        return StatusCode::UNAUTHORIZED;
    }

    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match event_type {
        PING_EVENT => {
            info!("Received webhook ping");
            StatusCode::OK
        }
        WORKFLOW_JOB_EVENT => {
            let event: WorkflowJobEvent = match serde_json::from_slice(&body) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Failed to parse webhook payload: {}", e);
                    return StatusCode::BAD_REQUEST;
                }
            };

            info!(
                "Received workflow_job.{} for job {} with labels {:?}",
                event.action, event.workflow_job.id, event.workflow_job.labels
            );

            match state.provisioner.handle_event(&JobEvent::from(event)).await {
                Ok(ProvisionOutcome::Ignored) => StatusCode::OK,
                Ok(outcome) => {
                    debug!("Provisioned: {:?}", outcome);
                    StatusCode::OK
                }
                Err(e) => {
                    error!("GitHub webhook error: {}", e);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        }
        other => {
            warn!("Unexpected webhook event type: {:?}", other);
            StatusCode::BAD_REQUEST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{BootstrapSettings, Bootstrapper};
    use crate::config::InstanceSizes;
    use crate::runner_state::RunnerStore;
    use crate::testing::{FakeExecutor, FakeProvider, FakeRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn sign(secret: &str, payload: &[u8]) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn app() -> (Router, Arc<RunnerStore>, Arc<FakeProvider>) {
        let store = Arc::new(RunnerStore::new());
        let provider = Arc::new(FakeProvider::new());
        let bootstrapper = Arc::new(Bootstrapper::new(
            store.clone(),
            provider.clone(),
            Arc::new(FakeRegistry::new()),
            Arc::new(FakeExecutor::new()),
            BootstrapSettings {
                repository: "octo/widgets".parse().unwrap(),
                max_attempts: 1,
                base_delay: Duration::from_millis(175),
                ssh_grace: Duration::ZERO,
                session_timeout: Duration::from_secs(60),
                runner_version: "2.320.0".into(),
            },
        ));
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            provider.clone(),
            bootstrapper,
            InstanceSizes {
                amd64: "cpx21".into(),
                arm64: "cax21".into(),
            },
        ));
        let state = Arc::new(WebhookState {
            secret: SECRET.into(),
            provisioner,
        });
        (http_router(state, "/github-webhook"), store, provider)
    }

    fn delivery(event: &str, body: &str, signature: Option<String>) -> Request<Body> {
        let signature = signature.unwrap_or_else(|| sign(SECRET, body.as_bytes()));
        Request::builder()
            .method("POST")
            .uri("/github-webhook")
            .header("X-GitHub-Event", event)
            .header("X-Hub-Signature-256", signature)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn queued(labels: &[&str]) -> String {
        serde_json::json!({
            "action": "queued",
            "workflow_job": { "id": 12345, "name": "build", "labels": labels },
            "repository": { "full_name": "octo/widgets" }
        })
        .to_string()
    }

    #[test]
    fn test_validate_signature() {
        let payload = b"test payload";
        let header = sign(SECRET, payload);

        assert!(validate_signature(SECRET, payload, &header));
        assert!(!validate_signature("wrong-secret", payload, &header));
        assert!(!validate_signature(SECRET, b"wrong payload", &header));
    }

    #[test]
    fn test_validate_signature_github_example() {
        // Official test values from GitHub webhook documentation
        let secret = "It's a Secret to Everybody";
        let payload = b"Hello, World!";
        let expected_signature =
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";

        assert!(validate_signature(secret, payload, expected_signature));
    }

    #[test]
    fn test_validate_signature_invalid_format() {
        let payload = b"test payload";

        // Missing sha256= prefix
        assert!(!validate_signature(SECRET, payload, "abc123"));

        // Invalid hex
        assert!(!validate_signature(SECRET, payload, "sha256=notvalidhex!"));

        assert!(!validate_signature(SECRET, payload, ""));
    }

    #[test]
    fn test_parse_workflow_job_event() {
        let event: WorkflowJobEvent =
            serde_json::from_str(&queued(&["self-hosted", "arm64"])).unwrap();
        assert_eq!(event.workflow_job.id, 12345);

        let job = JobEvent::from(event);
        assert_eq!(job, JobEvent::new("queued", &["self-hosted", "arm64"]));
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_rejects_bad_signature() {
        let (app, store, _) = app();
        let body = queued(&["self-hosted", "arm64"]);
        let response = app
            .oneshot(delivery("workflow_job", &body, Some(sign("other", body.as_bytes()))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_ping_is_accepted() {
        let (app, _, _) = app();
        let response = app
            .oneshot(delivery("ping", r#"{"zen":"Keep it simple."}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unexpected_event_type() {
        let (app, _, _) = app();
        let response = app.oneshot(delivery("push", "{}", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (app, _, _) = app();
        let response = app
            .oneshot(delivery("workflow_job", r#"{"action": "queued"}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_queued_job_creates_runner() {
        let (app, store, provider) = app();
        let response = app
            .oneshot(delivery("workflow_job", &queued(&["self-hosted", "arm64"]), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(provider.created_names(), vec!["arm64-0"]);
        assert_eq!(store.snapshot().await[0].id, "arm64-0");
    }

    #[tokio::test]
    async fn test_github_hosted_job_is_ignored() {
        let (app, store, provider) = app();
        let response = app
            .oneshot(delivery("workflow_job", &queued(&["ubuntu-latest"]), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(provider.created_names().is_empty());
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_is_server_error() {
        let (app, store, provider) = app();
        provider.fail_create.store(true, Ordering::SeqCst);

        let response = app
            .oneshot(delivery("workflow_job", &queued(&["self-hosted", "amd64"]), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(store.snapshot().await.is_empty());
    }
}
