//! HTTP surface: one endpoint per tool, plus `/healthz` and `/node`.
//!
//! Every tool failure becomes the `{"error":{"kind","message"}}` envelope
//! with a 4xx status for caller errors and 5xx for node faults. The process
//! stays up across all of them.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use nacc_protocol::{
    ErrorEnvelope, ExecuteCommandRequest, HealthResponse, ListFilesRequest, ReadFileRequest,
    SyncFilesRequest, ToolError, ToolErrorKind, WriteFileRequest,
};
use nacc_tools::{exec, fs, info, sync};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the node router. `/healthz` is public; everything else sits behind
/// the bearer-token middleware (a no-op when no token is configured).
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/tools/list-files", post(list_files))
        .route("/tools/read-file", post(read_file))
        .route("/tools/write-file", post(write_file))
        .route("/tools/execute-command", post(execute_command))
        .route("/tools/sync-files", post(sync_files))
        .route("/tools/get-node-info", post(get_node_info))
        .route("/node", get(node))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_bearer_token,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bearer-token middleware. The token is read from the environment once at
/// startup; only its SHA-256 digest lives in memory, and comparison is
/// constant-time.
async fn require_bearer_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected_hash = match &state.token_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid or missing bearer token" })),
        )
            .into_response();
    }

    next.run(req).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn status_for(kind: ToolErrorKind) -> StatusCode {
    StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn tool_response<T: Serialize>(result: Result<T, ToolError>) -> Response {
    match result {
        Ok(payload) => Json(payload).into_response(),
        Err(error) => {
            tracing::debug!(kind = ?error.kind, message = %error.message, "tool error");
            (status_for(error.kind), Json(ErrorEnvelope::from(error))).into_response()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::ok(state.root.node_id()))
}

async fn node(State(state): State<AppState>) -> Response {
    Json(info::node_info(&state.root).await).into_response()
}

async fn list_files(State(state): State<AppState>, Json(req): Json<ListFilesRequest>) -> Response {
    tool_response(fs::list_files(&state.root, req).await)
}

async fn read_file(State(state): State<AppState>, Json(req): Json<ReadFileRequest>) -> Response {
    tool_response(fs::read_file(&state.root, req).await)
}

async fn write_file(State(state): State<AppState>, Json(req): Json<WriteFileRequest>) -> Response {
    tool_response(fs::write_file(&state.root, req).await)
}

async fn execute_command(
    State(state): State<AppState>,
    Json(req): Json<ExecuteCommandRequest>,
) -> Response {
    tool_response(exec::execute_command(&state.root, req).await)
}

async fn sync_files(State(state): State<AppState>, Json(req): Json<SyncFilesRequest>) -> Response {
    tool_response(sync::sync_files(&state.root, req).await)
}

async fn get_node_info(State(state): State<AppState>) -> Response {
    Json(info::node_info(&state.root).await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use nacc_domain::config::NodeConfig;
    use nacc_tools::RootContext;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn make_state(dir: &TempDir, token: Option<&str>) -> AppState {
        let config: NodeConfig = toml::from_str(&format!(
            r#"
            node_id = "test-node"
            root_dir = "{}"
            allowed_commands = ["echo"]
            "#,
            dir.path().display()
        ))
        .unwrap();
        let root = RootContext::new(
            config.node_id.clone(),
            &config.root_dir,
            config.allowed_commands.clone(),
            config.path_env.clone(),
            config.tags.clone(),
            HashMap::new(),
        )
        .unwrap();
        AppState {
            config: Arc::new(config),
            root: Arc::new(root),
            token_hash: token.map(|t| Sha256::digest(t.as_bytes()).to_vec()),
        }
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
        bearer: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn healthz_reports_node_id() {
        let dir = TempDir::new().unwrap();
        let app = router(make_state(&dir, None));
        let (status, body) = send(app, "GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["node_id"], "test-node");
    }

    #[tokio::test]
    async fn write_then_read_over_http() {
        let dir = TempDir::new().unwrap();
        let state = make_state(&dir, None);

        let (status, written) = send(
            router(state.clone()),
            "POST",
            "/tools/write-file",
            Some(serde_json::json!({"path": "hello.txt", "content": "hi node"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, read) = send(
            router(state),
            "POST",
            "/tools/read-file",
            Some(serde_json::json!({"path": "hello.txt"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["content"], "hi node");
        assert_eq!(read["sha256"], written["sha256"]);
    }

    #[tokio::test]
    async fn path_escape_maps_to_envelope() {
        let dir = TempDir::new().unwrap();
        let (status, body) = send(
            router(make_state(&dir, None)),
            "POST",
            "/tools/write-file",
            Some(serde_json::json!({"path": "../etc/passwd", "content": "x"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "path_escape");
    }

    #[tokio::test]
    async fn disallowed_command_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let (status, body) = send(
            router(make_state(&dir, None)),
            "POST",
            "/tools/execute-command",
            Some(serde_json::json!({"argv": ["rm", "-rf", "/"]})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["kind"], "command_not_allowed");
    }

    #[tokio::test]
    async fn bearer_token_gates_tools_but_not_health() {
        let dir = TempDir::new().unwrap();
        let state = make_state(&dir, Some("s3cret"));

        let (status, _) = send(router(state.clone()), "GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            router(state.clone()),
            "POST",
            "/tools/list-files",
            Some(serde_json::json!({})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            router(state.clone()),
            "POST",
            "/tools/list-files",
            Some(serde_json::json!({})),
            Some("wrong"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            router(state),
            "POST",
            "/tools/list-files",
            Some(serde_json::json!({})),
            Some("s3cret"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn execute_command_over_http() {
        let dir = TempDir::new().unwrap();
        let (status, body) = send(
            router(make_state(&dir, None)),
            "POST",
            "/tools/execute-command",
            Some(serde_json::json!({"argv": ["echo", "over http"]})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stdout"], "over http\n");
        assert_eq!(body["exit_code"], 0);
    }
}
