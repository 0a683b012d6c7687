//! HTTP chat interface.
//!
//! - `GET /` serves the chat widget.
//! - `POST /api/chat` answers a question from the indexed documents.
//! - `POST /api/search` returns raw retrieval hits without generation.
//! - `POST /api/rebuild` runs a full rebuild or an incremental refresh.
//! - `GET /api/status`, `GET /api/stats`, `POST /api/cleanup` and `GET /health`.
//!
//! Failures are returned as `{ "kind", "message" }`; internal detail only goes to the log.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use docchat_core::{
    CategoryTag, DocumentStats, DocumentType, IndexReport, IndexStatus, QueryFilters,
    QueryResultItem, RagError, RagService, SourceCitation,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

const CHAT_PAGE: &str = include_str!("../static/index.html");

pub fn create_router(service: Arc<RagService>) -> Router {
    Router::new()
        .route("/", get(chat_page))
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/search", post(search))
        .route("/api/rebuild", post(rebuild))
        .route("/api/status", get(status))
        .route("/api/stats", get(stats))
        .route("/api/cleanup", post(cleanup))
        .with_state(service)
}

#[derive(Debug, Default, Deserialize)]
struct FilterParams {
    #[serde(default)]
    category_tag: Option<CategoryTag>,
    #[serde(default)]
    document_type: Option<DocumentType>,
    #[serde(default)]
    source_file: Option<String>,
}

impl From<FilterParams> for QueryFilters {
    fn from(params: FilterParams) -> Self {
        Self {
            category_tag: params.category_tag,
            document_type: params.document_type,
            source_file: params.source_file,
        }
    }
}

#[derive(Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(default)]
    filters: FilterParams,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
    sources: Vec<SourceCitation>,
    context_found: bool,
}

async fn chat_page() -> Html<&'static str> {
    Html(CHAT_PAGE)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn chat(
    State(service): State<Arc<RagService>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(request) = payload?;
    let filters = QueryFilters::from(request.filters);
    let answer = service.ask(&request.question, &filters).await?;
    tracing::info!(
        sources = answer.sources.len(),
        context_found = answer.context_found,
        "chat request completed"
    );
    Ok(Json(ChatResponse {
        answer: answer.answer,
        sources: answer.sources,
        context_found: answer.context_found,
    }))
}

#[derive(Deserialize)]
struct SearchRequest {
    question: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filters: FilterParams,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<QueryResultItem>,
}

async fn search(
    State(service): State<Arc<RagService>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Json(request) = payload?;
    let top_k = request.top_k.unwrap_or(service.settings().top_k);
    let results = service
        .search_similar(&request.question, top_k, &QueryFilters::from(request.filters))
        .await?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RebuildRequest {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    incremental: bool,
}

/// An empty body means a default rebuild; anything else must be a valid request.
fn parse_rebuild(body: &[u8]) -> Result<RebuildRequest, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RebuildRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|error| AppError(RagError::InvalidRequest(format!("rebuild request: {error}"))))
}

async fn rebuild(
    State(service): State<Arc<RagService>>,
    body: Bytes,
) -> Result<Json<IndexReport>, AppError> {
    let request = parse_rebuild(&body)?;
    let report = if request.incremental {
        service.refresh().await?
    } else {
        service.rebuild(request.force).await?
    };
    tracing::info!(
        mode = ?report.mode,
        collection = %report.collection,
        chunks = report.chunks,
        "rebuild request completed"
    );
    Ok(Json(report))
}

async fn status(State(service): State<Arc<RagService>>) -> Result<Json<IndexStatus>, AppError> {
    Ok(Json(service.status().await?))
}

async fn stats(State(service): State<Arc<RagService>>) -> Result<Json<DocumentStats>, AppError> {
    Ok(Json(service.document_stats().await?))
}

async fn cleanup(
    State(service): State<Arc<RagService>>,
) -> Result<Json<serde_json::Value>, AppError> {
    service.cleanup().await?;
    Ok(Json(json!({ "status": "cleaned" })))
}

#[derive(Debug)]
struct AppError(RagError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RagError::ModelUnavailable(_) | RagError::StoreUnavailable(_) | RagError::NotReady(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RagError::RebuildInProgress => StatusCode::CONFLICT,
            RagError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "request rejected");
        }
        let body = json!({
            "kind": self.0.kind(),
            "message": self.0.user_message(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(inner: RagError) -> Self {
        Self(inner)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self(RagError::InvalidRequest(rejection.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request},
    };
    use docchat_core::{
        CharacterNgramEmbedder, LanguageModel, LocalStore, ModelError, Settings,
    };
    use std::collections::HashMap;
    use std::path::Path;
    use tower::ServiceExt;

    struct EchoModel;

    #[async_trait]
    impl LanguageModel for EchoModel {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, _prompt: &str) -> Result<String, ModelError> {
            Ok("The board meets quarterly.".to_string())
        }
    }

    fn service(docs: &Path, storage: &Path) -> Arc<RagService> {
        let values: HashMap<&str, String> = [
            ("LLM_PROVIDER", "ollama".to_string()),
            ("VECTOR_STORE", "local".to_string()),
            ("DOCUMENT_PATH", docs.display().to_string()),
            ("INDEX_STORAGE_PATH", storage.display().to_string()),
            ("SIMILARITY_THRESHOLD", "0.1".to_string()),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|key| values.get(key).cloned()).expect("settings");
        let service = RagService::with_components(
            settings,
            Arc::new(LocalStore::in_memory()),
            Arc::new(CharacterNgramEmbedder::default()),
            Arc::new(EchoModel),
        )
        .expect("service");
        Arc::new(service)
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn chat_before_indexing_reports_not_ready() {
        let docs = tempfile::tempdir().expect("docs");
        let storage = tempfile::tempdir().expect("storage");
        let app = create_router(service(docs.path(), storage.path()));

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/chat",
                json!({ "question": "Who sits on the board?" }),
            ))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "not_ready");
    }

    #[tokio::test]
    async fn rebuild_then_chat_returns_sources() {
        let docs = tempfile::tempdir().expect("docs");
        let storage = tempfile::tempdir().expect("storage");
        std::fs::write(
            docs.path().join("board_charter.txt"),
            "The board meets quarterly and reviews risk.",
        )
        .expect("write");
        let app = create_router(service(docs.path(), storage.path()));

        let rebuilt = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/rebuild", json!({ "force": true })))
            .await
            .expect("router response");
        assert_eq!(rebuilt.status(), StatusCode::OK);
        assert_eq!(body_json(rebuilt).await["chunks"], 1);

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/chat",
                json!({ "question": "How often does the board meet?", "filters": { "category_tag": "governance" } }),
            ))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["context_found"], true);
        assert_eq!(body["answer"], "The board meets quarterly.");
        let source = body["sources"][0]["source_path"].as_str().unwrap_or_default();
        assert!(source.ends_with("board_charter.txt"));
    }

    #[tokio::test]
    async fn malformed_and_empty_questions_are_bad_requests() {
        let docs = tempfile::tempdir().expect("docs");
        let storage = tempfile::tempdir().expect("storage");
        std::fs::write(docs.path().join("a.txt"), "alpha").expect("write");
        let service = service(docs.path(), storage.path());
        service.rebuild(true).await.expect("rebuild");
        let app = create_router(service);

        let malformed = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/chat", json!({ "query": 1 })))
            .await
            .expect("router response");
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(malformed).await["kind"], "invalid_request");

        let empty = app
            .oneshot(json_request(Method::POST, "/api/chat", json!({ "question": "  " })))
            .await
            .expect("router response");
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_rebuild_is_rejected_and_empty_body_is_allowed() {
        let docs = tempfile::tempdir().expect("docs");
        let storage = tempfile::tempdir().expect("storage");
        std::fs::write(docs.path().join("a.txt"), "alpha").expect("write");
        let app = create_router(service(docs.path(), storage.path()));

        let empty = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/rebuild")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(empty.status(), StatusCode::OK);
        let built = body_json(empty).await;
        assert_eq!(built["mode"], "full");

        for body in [json!({ "force": "yes" }), json!({ "forced": true }), json!([1, 2])] {
            let rejected = app
                .clone()
                .oneshot(json_request(Method::POST, "/api/rebuild", body))
                .await
                .expect("router response");
            assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(rejected).await["kind"], "invalid_request");
        }

        let status = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).expect("request"))
            .await
            .expect("router response");
        assert_eq!(body_json(status).await["live_collection"], built["collection"]);
    }

    #[tokio::test]
    async fn status_and_health_respond() {
        let docs = tempfile::tempdir().expect("docs");
        let storage = tempfile::tempdir().expect("storage");
        let app = create_router(service(docs.path(), storage.path()));

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("router response");
        assert_eq!(health.status(), StatusCode::OK);

        let status = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).expect("request"))
            .await
            .expect("router response");
        assert_eq!(status.status(), StatusCode::OK);
        let body = body_json(status).await;
        assert_eq!(body["state"], "empty");
        assert_eq!(body["alias"], "esg_documents");
        assert_eq!(body["retrieval"]["top_k"], 5);
    }

    #[test]
    fn error_kinds_map_to_status_codes() {
        let cases = [
            (RagError::RebuildInProgress, StatusCode::CONFLICT),
            (
                RagError::StoreUnavailable("down".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RagError::ConfigurationMissing("OPENAI_API_KEY".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(AppError(error).into_response().status(), expected);
        }
    }
}
