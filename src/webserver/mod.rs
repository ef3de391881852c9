use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Extension;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer};

use crate::application::application::Application;

pub mod config;
pub mod health;
pub mod lmstudio;
pub mod tokens;
pub mod types;

pub type Router<S = ()> = axum::Router<S>;

/// Everything the editor talks to, nested under `/api`
pub fn router(app: Application) -> Router {
    let api = Router::new()
        .route("/health", get(health::health))
        .route("/config", get(config::get))
        .nest("/lmstudio", lmstudio_router())
        .nest("/tokens", tokens_router())
        .layer(Extension(app))
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new())
        // I want to set the bytes limit here to 20 MB
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024));

    Router::new().nest("/api", api)
}

fn lmstudio_router() -> Router {
    Router::new()
        .route("/models", get(lmstudio::models))
        .route("/probe", get(lmstudio::probe))
        .route("/model_info", get(lmstudio::model_info))
        .route("/completion", post(lmstudio::completion))
        .route("/chat", post(lmstudio::chat))
}

fn tokens_router() -> Router {
    Router::new()
        .route("/count", post(tokens::count))
        .route("/context_window", post(tokens::context_window))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use clap::Parser;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::application::application::Application;
    use crate::application::config::configuration::Configuration;

    use super::router;

    async fn application(base_url: &str, extra: &[&str]) -> Application {
        let mut args = vec!["--disable-tokenizer"];
        args.extend_from_slice(extra);
        application_with_tokenizer(base_url, &args).await
    }

    /// Uses the o200k ranks bundled with tiktoken
    async fn application_with_tokenizer(base_url: &str, extra: &[&str]) -> Application {
        let mut args = vec!["webserver", "--lmstudio-base-url", base_url];
        args.extend_from_slice(extra);
        Application::initialize(Configuration::parse_from(args))
            .await
            .expect("application to start")
    }

    async fn send(app: Application, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(app).oneshot(request).await.expect("to respond");
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_disabled_tokenizer() {
        let app = application("http://127.0.0.1:1", &[]).await;
        let (status, body) = send(app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "tokenizer": null}));
    }

    #[tokio::test]
    async fn config_exposes_lmstudio_settings() {
        let app = application("http://127.0.0.1:1", &["--lmstudio-model-id", "qwen"]).await;
        let (_, body) = send(app, get("/api/config")).await;
        assert_eq!(body["lmstudio_base_url"], "http://127.0.0.1:1");
        assert_eq!(body["lmstudio_model_id"], "qwen");
        assert_eq!(body["tokenizer_enabled"], false);
        assert_eq!(body["model_info_ttl_secs"], 300);
    }

    #[tokio::test]
    async fn model_info_is_resolved_once_per_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v0/models/qwen"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "qwen", "max_context_length": 32768})),
            )
            .expect(1)
            .mount(&server)
            .await;
        let app = application(&server.uri(), &[]).await;

        for _ in 0..2 {
            let (status, body) =
                send(app.clone(), get("/api/lmstudio/model_info?model_id=qwen")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["model_info"]["contextWindow"], 32768);
            assert_eq!(body["model_info"]["maxTokens"], -1);
        }
    }

    #[tokio::test]
    async fn model_info_is_null_when_the_server_is_down() {
        let app = application("http://127.0.0.1:1", &[]).await;
        let (status, body) = send(app, get("/api/lmstudio/model_info?model_id=qwen")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"model_info": null}));
    }

    #[tokio::test]
    async fn model_info_needs_a_model() {
        let app = application("http://127.0.0.1:1", &[]).await;
        let (status, body) = send(app, get("/api/lmstudio/model_info")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "user");
    }

    #[tokio::test]
    async fn models_and_probe_use_the_query_base_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": [{"id": "qwen"}, {"id": "llama"}]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v0/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "qwen"}])))
            .mount(&server)
            .await;
        let app = application("http://127.0.0.1:1", &[]).await;

        let uri = format!("/api/lmstudio/models?base_url={}", server.uri());
        let (_, body) = send(app.clone(), get(&uri)).await;
        assert_eq!(body, json!({"models": ["qwen", "llama"]}));

        let uri = format!("/api/lmstudio/probe?base_url={}", server.uri());
        let (_, body) = send(app.clone(), get(&uri)).await;
        assert_eq!(body, json!({"available": true}));

        let (_, body) = send(app, get("/api/lmstudio/probe")).await;
        assert_eq!(body, json!({"available": false}));
    }

    #[tokio::test]
    async fn completion_returns_the_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "model": "qwen",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello there"}}]
            })))
            .mount(&server)
            .await;
        let app = application(&server.uri(), &["--lmstudio-model-id", "qwen"]).await;

        let (status, body) = send(app, post("/api/lmstudio/completion", json!({"prompt": "hi"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"completion": "hello there"}));
    }

    #[tokio::test]
    async fn completion_failures_point_at_the_lmstudio_logs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;
        let app = application(&server.uri(), &[]).await;

        let (status, body) = send(
            app,
            post(
                "/api/lmstudio/completion",
                json!({"prompt": "hi", "model_id": "qwen"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "upstream_service");
        assert!(body["message"]
            .as_str()
            .expect("message")
            .contains("Please check the LM Studio developer logs to debug what went wrong"));
    }

    #[tokio::test]
    async fn chat_streams_deltas_then_done() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;
        let app = application(&server.uri(), &["--lmstudio-model-id", "qwen"]).await;

        let request = post(
            "/api/lmstudio/chat",
            json!({
                "system_prompt": "be brief",
                "messages": [{"role": "user", "content": "hi"}]
            }),
        );
        let response = router(app).oneshot(request).await.expect("to respond");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .expect("body");
        let events = String::from_utf8(bytes.to_vec())
            .expect("utf8")
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str::<Value>(data.trim()).expect("json event"))
            .collect::<Vec<_>>();

        let last = events.last().expect("events");
        assert_eq!(last["type"], "done");
        assert_eq!(last["answer"], "Hello");
        assert!(events
            .iter()
            .any(|event| event["type"] == "delta" && event["answer_up_until_now"] == "Hel"));
    }

    #[tokio::test]
    async fn counts_tokens_with_the_rough_estimate_when_disabled() {
        let app = application("http://127.0.0.1:1", &[]).await;
        let (status, body) = send(
            app,
            post(
                "/api/tokens/count",
                json!({"content": [{"type": "text", "text": "abcdefgh"}]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // ceil(8 / 4 * 1.5)
        assert_eq!(body, json!({"tokens": 3}));
    }

    #[tokio::test]
    async fn counts_tokens_with_the_bundled_encoder() {
        let app = application_with_tokenizer("http://127.0.0.1:1", &[]).await;
        let (_, body) = send(app.clone(), get("/api/health")).await;
        assert_eq!(body["tokenizer"], "uninitialized");

        let (status, body) = send(
            app.clone(),
            post(
                "/api/tokens/count",
                json!({"content": [
                    {"type": "text", "text": "Test response"},
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "ok"}
                ]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // "Test" and " response"
        assert_eq!(body, json!({"tokens": 2}));

        let (_, body) = send(app, get("/api/health")).await;
        assert_eq!(body, json!({"status": "ok", "tokenizer": "ready"}));
    }

    #[tokio::test]
    async fn context_window_distribution_with_labels() {
        let app = application("http://127.0.0.1:1", &[]).await;
        let (status, body) = send(
            app,
            post(
                "/api/tokens/context_window",
                json!({"context_window": 100000, "context_tokens": 11808}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reserved_for_output"], 8192);
        assert_eq!(body["available_size"], 80000);
        assert_eq!(body["labels"]["total"], "100.0k");
        assert_eq!(body["labels"]["available"], "80.0k");
    }

    #[tokio::test]
    async fn context_window_falls_back_to_defaults_for_unknown_models() {
        let app = application("http://127.0.0.1:1", &[]).await;
        let (_, body) = send(
            app,
            post(
                "/api/tokens/context_window",
                json!({"context_tokens": 0, "model_id": "qwen"}),
            ),
        )
        .await;
        assert_eq!(body["context_window"], 128000);
        assert_eq!(body["reserved_for_output"], 8192);
    }
}
