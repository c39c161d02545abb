//! API routes
//!
//! Bot-style front end: every request names a session, and each session keeps
//! its own conversation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::conversation::Conversation;
use crate::core::{BufferSink, ChatEngine, ChatError, SessionRegistry, TurnReply};
use crate::tools::ToolDefinition;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(engine: ChatEngine, sessions: SessionRegistry) -> Self {
        Self {
            engine: Arc::new(engine),
            sessions: Arc::new(sessions),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    generator: String,
    sessions: usize,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub reply: TurnReply,
    /// Suppressed text streamed during the turn, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    session_id: String,
    cleared: bool,
}

/// Error body returned for failed turns
pub struct ApiError {
    status: StatusCode,
    message: String,
    partial: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            partial: None,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::Template(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::Generation { .. } => StatusCode::BAD_GATEWAY,
            ChatError::Conversation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = err.to_string();
        let partial = match err {
            ChatError::Generation { partial, .. } if !partial.is_empty() => Some(partial),
            _ => None,
        };
        Self {
            status,
            message,
            partial,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.partial {
            Some(partial) => json!({ "error": self.message, "partial": partial }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        generator: state.engine.generator_name().to_string(),
        sessions: state.sessions.len().await,
    })
}

async fn post_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "message must not be empty"));
    }

    let session = state.sessions.get_or_create(&session_id).await;
    let mut conversation = session.lock().await;
    let mut sink = BufferSink::default();

    let reply = state
        .engine
        .run_turn(&mut conversation, &request.message, &mut sink)
        .await?;

    Ok(Json(MessageResponse {
        session_id,
        reply,
        reasoning: (!sink.suppressed.is_empty()).then_some(sink.suppressed),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    let session = state
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("No session '{}'", session_id)))?;
    let conversation = session.lock().await.clone();
    Ok(Json(conversation))
}

async fn clear_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<ClearResponse> {
    let cleared = state.sessions.clear(&session_id).await;
    Json(ClearResponse { session_id, cleared })
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolDefinition>> {
    Json(state.engine.available_tools())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions/:id", get(get_session).delete(clear_session))
        .route("/v1/sessions/:id/messages", post(post_message))
        .route("/v1/tools", get(list_tools))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::MessageListRenderer;
    use crate::core::{EngineOptions, SuppressionMarkers};
    use crate::providers::scripted::{fragments, ScriptStep, ScriptedGenerator};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(generator: ScriptedGenerator) -> Router {
        let engine = ChatEngine::new(
            Arc::new(generator),
            Arc::new(MessageListRenderer),
            EngineOptions::default(),
        )
        .with_markers(Some(SuppressionMarkers::think_tags()));
        let state = AppState::new(engine, SessionRegistry::with_preamble("Be cheerful"));
        router().with_state(state)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty(method: Method, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(ScriptedGenerator::echo())
            .oneshot(empty(Method::GET, "/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["generator"], "scripted");
    }

    #[tokio::test]
    async fn test_post_message_and_read_history() {
        let app = app(ScriptedGenerator::new(vec![fragments([
            "<think>\n",
            "greet back",
            "</think>\n\n",
            "Hello!",
        ])]));

        let response = app
            .clone()
            .oneshot(post("/v1/sessions/alice/messages", json!({"message": "Hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["session_id"], "alice");
        assert_eq!(body["content"], "Hello!");
        assert_eq!(body["status"], "complete");
        assert_eq!(body["reasoning"], "greet back");

        let response = app
            .clone()
            .oneshot(empty(Method::GET, "/v1/sessions/alice"))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["preamble"]["content"], "Be cheerful");
        assert_eq!(body["turns"].as_array().unwrap().len(), 2);

        let response = app
            .oneshot(empty(Method::GET, "/v1/sessions/bob"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_clear_session() {
        let app = app(ScriptedGenerator::echo());

        app.clone()
            .oneshot(post("/v1/sessions/carol/messages", json!({"message": "remember me"})))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty(Method::DELETE, "/v1/sessions/carol"))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["cleared"], true);

        let response = app
            .oneshot(empty(Method::DELETE, "/v1/sessions/carol"))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["cleared"], false);
    }

    #[tokio::test]
    async fn test_generation_failure_maps_to_bad_gateway() {
        let app = app(ScriptedGenerator::new(vec![vec![ScriptStep::Fail("backend down".into())]]));

        let response = app
            .oneshot(post("/v1/sessions/dave/messages", json!({"message": "Hi"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("backend down"));
        assert!(body.get("partial").is_none());
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let response = app(ScriptedGenerator::echo())
            .oneshot(post("/v1/sessions/erin/messages", json!({"message": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_tools_without_tools() {
        let response = app(ScriptedGenerator::echo())
            .oneshot(empty(Method::GET, "/v1/tools"))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, json!([]));
    }
}
