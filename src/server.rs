use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RagError;
use crate::pipeline::{Answer, RagPipeline};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<RagPipeline>,
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

pub fn router(pipeline: Arc<RagPipeline>) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/ask", post(ask_handler))
        .with_state(AppState { pipeline })
}

/// Binds `bind` and serves until ctrl-c.
pub async fn serve(pipeline: Arc<RagPipeline>, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "bankrag listening");
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn banner() -> Json<Value> {
    Json(json!({
        "message": "Banking documents RAG service is running.",
        "tip": "POST /ask with {\"query\": \"...\"}",
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ask_handler(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<Answer>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let pipeline = state.pipeline.clone();
    let result = tokio::task::spawn_blocking(move || pipeline.answer(&request.query))
        .await
        .map_err(|err| internal_error(anyhow!("answer task join error: {err}")))?;

    match result {
        Ok(answer) => Ok(Json(answer)),
        Err(RagError::EmptyQuery) => Err(bad_request("query must not be empty")),
        Err(err) => {
            if err.is_fatal() {
                tracing::error!(error = %err, "index unusable");
            }
            Err(internal_error(err.into()))
        }
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

/// Details go to the log only.
fn internal_error(err: anyhow::Error) -> ApiError {
    tracing::error!(error = format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: "internal error".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Page;
    use crate::config::Settings;
    use crate::document::DocId;
    use crate::embeddings::HashingEmbedder;
    use crate::generator::AnswerGenerator;
    use crate::index::IndexHandle;
    use crate::indexer::{build_snapshot, SourceDocument};
    use crate::pipeline::{RagPipeline, OUT_OF_SCOPE_MESSAGE};

    struct FixedGenerator;

    impl AnswerGenerator for FixedGenerator {
        fn generate(&self, _system: &str, _user: &str) -> anyhow::Result<String> {
            Ok("Το όριο φτάνει έως 5.000€.".to_string())
        }
    }

    fn test_pipeline() -> Arc<RagPipeline> {
        let embedder = Arc::new(HashingEmbedder::new(256));
        let documents = vec![SourceDocument {
            doc_id: DocId::CreditCards,
            source_file: DocId::CreditCards.file_name().to_string(),
            sha256: String::new(),
            pages: vec![Page {
                number: 1,
                text: "Το πιστωτικό όριο της κάρτας είναι έως 5.000€.".to_string(),
            }],
        }];
        let snapshot = build_snapshot(&documents, embedder.as_ref(), 700, 150, 64).unwrap();
        Arc::new(RagPipeline::new(
            &Settings::default(),
            embedder,
            Arc::new(FixedGenerator),
            IndexHandle::preloaded(snapshot),
        ))
    }

    async fn spawn_app() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(test_pipeline())).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn ask(base: &str, body: Value) -> (StatusCode, Value) {
        let resp = reqwest::Client::new()
            .post(format!("{base}/ask"))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.json().await.unwrap())
    }

    #[tokio::test]
    async fn health_and_banner() {
        let base = spawn_app().await;
        let health: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health, json!({ "status": "ok" }));

        let banner: Value = reqwest::get(format!("{base}/")).await.unwrap().json().await.unwrap();
        assert!(banner["message"].is_string());
        assert!(banner["tip"].as_str().unwrap().contains("/ask"));
    }

    #[tokio::test]
    async fn ask_returns_answer_and_sources_only() {
        let base = spawn_app().await;
        let query = json!({ "query": "Ποιο είναι το πιστωτικό όριο της κάρτας;" });
        let (status, body) = ask(&base, query).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answer"], "Το όριο φτάνει έως 5.000€.");
        assert_eq!(body["sources"][0]["doc_id"], "credit_cards");
        assert_eq!(body["sources"][0]["source_file"], "credit_cards.pdf");
        assert_eq!(body["sources"][0]["page"], 1);
        let keys: Vec<&String> = body.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["answer", "sources"]);
    }

    #[tokio::test]
    async fn refusal_is_a_normal_response() {
        let base = spawn_app().await;
        let (status, body) = ask(&base, json!({ "query": "τι crypto να αγοράσω;" })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answer"], OUT_OF_SCOPE_MESSAGE);
        assert_eq!(body["sources"], json!([]));
    }

    #[tokio::test]
    async fn blank_query_is_a_bad_request() {
        let base = spawn_app().await;
        let (status, body) = ask(&base, json!({ "query": "   " })).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "query must not be empty");
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let (status, Json(body)) = internal_error(anyhow!("OPENAI_API_KEY rejected"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "internal error");
    }
}
