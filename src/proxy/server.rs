//! Proxy server setup and initialization

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use super::{
    anthropic_handler, health, list_models, metrics, openai_handler, stats, version, ProxyState,
};
use crate::config::Config;

/// Build the router: health, proxy endpoints, Anthropic path, and the
/// OpenAI passthrough catch-all
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(health))
        .route("/proxy/metrics", get(metrics))
        .route("/proxy/version", get(version))
        .route("/proxy/stats", get(stats))
        .route("/v1/models", get(list_models))
        .route("/v1/messages", post(anthropic_handler))
        .route("/v1/messages/*rest", post(anthropic_handler))
        .fallback(openai_handler)
        .with_state(state)
}

/// Start the proxy server
pub async fn start_proxy(
    config: Config,
    state: ProxyState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    tracing::info!("proxy listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("server error")?;

    tracing::info!("proxy server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationController;
    use crate::metrics::Metrics;
    use crate::orchestrator::fake::FakeOrchestrator;
    use crate::registry::profile::test_profile;
    use crate::registry::StaticRegistry;
    use axum::Json;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Instant;

    /// Minimal OpenAI-speaking backend that echoes the requested model
    async fn spawn_stub_backend() -> u16 {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(request): Json<Value>| async move {
                Json(json!({
                    "id": "chatcmpl-stub",
                    "object": "chat.completion",
                    "created": 0,
                    "model": request["model"],
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "pong"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
                }))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        port
    }

    async fn spawn_proxy(
        orchestrator: Arc<FakeOrchestrator>,
        backend_port: u16,
    ) -> (u16, Arc<ActivationController>) {
        let config = Config {
            backend_host: "127.0.0.1".to_string(),
            backend_port,
            startup_timeout: std::time::Duration::from_millis(500),
            readiness_poll_interval: std::time::Duration::from_millis(10),
            ..Config::default()
        };
        let registry = Arc::new(StaticRegistry::new(vec![
            test_profile("model-a", "org/model-a"),
            test_profile("model-b", "org/model-b"),
        ]));
        let metrics = Arc::new(Metrics::new());
        let controller = Arc::new(ActivationController::new(
            &config,
            "model-a".to_string(),
            orchestrator,
            registry.clone(),
            metrics.clone(),
        ));

        let state = ProxyState {
            client: reqwest::Client::new(),
            controller: controller.clone(),
            registry,
            metrics,
            config: Arc::new(config),
            started_at: Instant::now(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (port, controller)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_health_endpoints() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let (port, _) = spawn_proxy(orchestrator, 1).await;

        let client = reqwest::Client::new();
        for path in ["/health", "/readyz"] {
            let resp = client
                .get(format!("http://127.0.0.1:{}{}", port, path))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            assert_eq!(resp.text().await.unwrap(), "OK");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_model_switch_on_request() {
        let backend_port = spawn_stub_backend().await;
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let (port, controller) = spawn_proxy(orchestrator.clone(), backend_port).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/v1/chat/completions", port))
            .json(&json!({
                "model": "model-b",
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "pong");

        // Pod for A deleted, B created, active id updated
        assert_eq!(orchestrator.delete_count(), 1);
        assert_eq!(orchestrator.create_count(), 1);
        assert_eq!(controller.active_model().await, "model-b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_model_not_found_lists_available() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let (port, _) = spawn_proxy(orchestrator.clone(), 1).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/v1/chat/completions", port))
            .json(&json!({"model": "ghost", "messages": []}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "model_not_found");
        let ids: Vec<&str> = body["available_models"]["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["model-a", "model-b"]);
        // No pod was touched
        assert_eq!(orchestrator.delete_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_anthropic_buffered_round_trip() {
        let backend_port = spawn_stub_backend().await;
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.seed_pod("model-a", "fp");
        let (port, _) = spawn_proxy(orchestrator, backend_port).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/v1/messages", port))
            .header("x-api-key", "sk-test")
            .json(&json!({
                "model": "claude-sonnet-4-20250514",
                "max_tokens": 100,
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["type"], "message");
        assert_eq!(body["role"], "assistant");
        assert_eq!(body["content"][0]["text"], "pong");
        // The caller's model name comes back, not the backend's
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["stop_reason"], "end_turn");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loading_response_when_backend_never_ready() {
        let orchestrator = Arc::new(FakeOrchestrator::new().never_ready());
        let (port, _) = spawn_proxy(orchestrator, 1).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/v1/chat/completions", port))
            .json(&json!({
                "model": "model-a",
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .send()
            .await
            .unwrap();

        // Chat path gets a readable loading completion, not an error
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert!(body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap()
            .contains("starting up"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_non_chat_path_gets_503_with_retry_after() {
        let orchestrator = Arc::new(FakeOrchestrator::new().never_ready());
        let (port, _) = spawn_proxy(orchestrator, 1).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/v1/completions", port))
            .json(&json!({"model": "model-a", "prompt": "hi"}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 503);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "10");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_version_and_models_endpoints() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let (port, _) = spawn_proxy(orchestrator, 1).await;
        let client = reqwest::Client::new();

        let version: Value = client
            .get(format!("http://127.0.0.1:{}/proxy/version", port))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(version["version"], crate::config::VERSION);

        let models: Value = client
            .get(format!("http://127.0.0.1:{}/v1/models", port))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(models["object"], "list");
        assert_eq!(models["data"][0]["id"], "model-a");
    }
}
