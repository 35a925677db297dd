//! Node transports: how the orchestrator reaches a node's tool surface.
//!
//! `HttpTransport` speaks to a remote nacc-node process; `InProcessTransport`
//! calls the tool implementations directly against a local root. Both take an
//! explicit deadline and cancellation handle per call; cancellation aborts
//! the in-flight HTTP request, and the in-process variant checks the token
//! cooperatively around its I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nacc_domain::config::{resolve_secret, NodeDefinition, TransportConfig};
use nacc_domain::{Error, Result};
use nacc_protocol::{
    ErrorEnvelope, ExecuteCommandRequest, HealthResponse, ListFilesRequest, ListFilesResponse,
    NodeInfo, ReadFileRequest, ReadFileResponse, SyncFilesRequest, SyncFilesResponse, ToolError,
    WriteFileRequest, WriteFileResponse,
};
use nacc_tools::RootContext;

use crate::cancel::CancelToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call / reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One typed tool invocation.
#[derive(Debug, Clone)]
pub enum ToolCall {
    ListFiles(ListFilesRequest),
    ReadFile(ReadFileRequest),
    WriteFile(WriteFileRequest),
    ExecuteCommand(ExecuteCommandRequest),
    SyncFiles(SyncFilesRequest),
    GetNodeInfo,
}

impl ToolCall {
    fn endpoint(&self) -> &'static str {
        match self {
            ToolCall::ListFiles(_) => "/tools/list-files",
            ToolCall::ReadFile(_) => "/tools/read-file",
            ToolCall::WriteFile(_) => "/tools/write-file",
            ToolCall::ExecuteCommand(_) => "/tools/execute-command",
            ToolCall::SyncFiles(_) => "/tools/sync-files",
            ToolCall::GetNodeInfo => "/tools/get-node-info",
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            ToolCall::ListFiles(r) => serde_json::to_value(r),
            ToolCall::ReadFile(r) => serde_json::to_value(r),
            ToolCall::WriteFile(r) => serde_json::to_value(r),
            ToolCall::ExecuteCommand(r) => serde_json::to_value(r),
            ToolCall::SyncFiles(r) => serde_json::to_value(r),
            ToolCall::GetNodeInfo => Ok(serde_json::json!({})),
        }
        .unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// The typed reply matching a [`ToolCall`] variant.
#[derive(Debug, Clone)]
pub enum ToolReply {
    ListFiles(ListFilesResponse),
    ReadFile(ReadFileResponse),
    WriteFile(WriteFileResponse),
    Command(nacc_protocol::CommandResult),
    SyncFiles(SyncFilesResponse),
    NodeInfo(NodeInfo),
}

impl ToolReply {
    pub fn into_list_files(self) -> Option<ListFilesResponse> {
        match self {
            ToolReply::ListFiles(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_read_file(self) -> Option<ReadFileResponse> {
        match self {
            ToolReply::ReadFile(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_command(self) -> Option<nacc_protocol::CommandResult> {
        match self {
            ToolReply::Command(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_sync_files(self) -> Option<SyncFilesResponse> {
        match self {
            ToolReply::SyncFiles(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_node_info(self) -> Option<NodeInfo> {
        match self {
            ToolReply::NodeInfo(r) => Some(r),
            _ => None,
        }
    }
}

/// Transport-level failures, kept separate from tool-level error envelopes.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The node answered with its error envelope.
    #[error("{0}")]
    Tool(ToolError),

    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,
}

#[async_trait::async_trait]
pub trait NodeTransport: Send + Sync {
    /// Invoke one tool with a deadline and a cancellation handle.
    async fn call(
        &self,
        call: ToolCall,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> std::result::Result<ToolReply, TransportError>;

    /// The cheap liveness probe behind the registry's health loop.
    async fn healthz(
        &self,
        deadline: Duration,
    ) -> std::result::Result<HealthResponse, TransportError>;
}

/// Construct the transport for a node definition.
pub fn build_transport(def: &NodeDefinition) -> Result<Arc<dyn NodeTransport>> {
    match &def.transport {
        TransportConfig::Http {
            base_url,
            bearer_token,
        } => {
            let bearer = bearer_token.as_deref().map(resolve_secret).transpose()?;
            Ok(Arc::new(HttpTransport::new(base_url.clone(), bearer)?))
        }
        TransportConfig::InProcess {
            root_dir,
            allowed_commands,
            path_env,
        } => {
            let root = RootContext::new(
                def.node_id.clone(),
                root_dir,
                allowed_commands.clone(),
                path_env.clone(),
                def.tags.clone(),
                HashMap::new(),
            )
            .map_err(|e| Error::Node {
                node_id: def.node_id.clone(),
                message: e.to_string(),
            })?;
            Ok(Arc::new(InProcessTransport::new(root)))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    bearer: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: String, bearer: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            bearer,
        })
    }

    async fn parse_reply(
        call: &ToolCall,
        response: reqwest::Response,
    ) -> std::result::Result<ToolReply, TransportError> {
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            return match serde_json::from_slice::<ErrorEnvelope>(&bytes) {
                Ok(envelope) => Err(TransportError::Tool(envelope.error)),
                Err(_) => Err(TransportError::Unavailable(format!(
                    "node returned {status} with an unrecognized body"
                ))),
            };
        }

        let parse = |e: serde_json::Error| {
            TransportError::Unavailable(format!("unparseable node reply: {e}"))
        };
        Ok(match call {
            ToolCall::ListFiles(_) => {
                ToolReply::ListFiles(serde_json::from_slice(&bytes).map_err(parse)?)
            }
            ToolCall::ReadFile(_) => {
                ToolReply::ReadFile(serde_json::from_slice(&bytes).map_err(parse)?)
            }
            ToolCall::WriteFile(_) => {
                ToolReply::WriteFile(serde_json::from_slice(&bytes).map_err(parse)?)
            }
            ToolCall::ExecuteCommand(_) => {
                ToolReply::Command(serde_json::from_slice(&bytes).map_err(parse)?)
            }
            ToolCall::SyncFiles(_) => {
                ToolReply::SyncFiles(serde_json::from_slice(&bytes).map_err(parse)?)
            }
            ToolCall::GetNodeInfo => {
                ToolReply::NodeInfo(serde_json::from_slice(&bytes).map_err(parse)?)
            }
        })
    }
}

#[async_trait::async_trait]
impl NodeTransport for HttpTransport {
    async fn call(
        &self,
        call: ToolCall,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> std::result::Result<ToolReply, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let url = format!("{}{}", self.base_url, call.endpoint());
        let mut request = self
            .client
            .post(&url)
            .timeout(deadline)
            .json(&call.body());
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        // Dropping the request future aborts the connection.
        tokio::select! {
            response = request.send() => {
                let response = response.map_err(|e| {
                    if e.is_timeout() {
                        TransportError::Timeout(deadline)
                    } else {
                        TransportError::Unavailable(e.to_string())
                    }
                })?;
                Self::parse_reply(&call, response).await
            }
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }

    async fn healthz(
        &self,
        deadline: Duration,
    ) -> std::result::Result<HealthResponse, TransportError> {
        let url = format!("{}/healthz", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(deadline)
                } else {
                    TransportError::Unavailable(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Unavailable(format!(
                "healthz returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Unavailable(format!("unparseable healthz body: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct InProcessTransport {
    root: Arc<RootContext>,
}

impl InProcessTransport {
    pub fn new(root: RootContext) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    pub fn root(&self) -> &RootContext {
        &self.root
    }
}

#[async_trait::async_trait]
impl NodeTransport for InProcessTransport {
    async fn call(
        &self,
        call: ToolCall,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> std::result::Result<ToolReply, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let root = self.root.clone();
        let work = async move {
            match call {
                ToolCall::ListFiles(req) => nacc_tools::fs::list_files(&root, req)
                    .await
                    .map(ToolReply::ListFiles),
                ToolCall::ReadFile(req) => nacc_tools::fs::read_file(&root, req)
                    .await
                    .map(ToolReply::ReadFile),
                ToolCall::WriteFile(req) => nacc_tools::fs::write_file(&root, req)
                    .await
                    .map(ToolReply::WriteFile),
                ToolCall::ExecuteCommand(req) => nacc_tools::exec::execute_command(&root, req)
                    .await
                    .map(ToolReply::Command),
                ToolCall::SyncFiles(req) => nacc_tools::sync::sync_files(&root, req)
                    .await
                    .map(ToolReply::SyncFiles),
                ToolCall::GetNodeInfo => Ok(ToolReply::NodeInfo(
                    nacc_tools::info::node_info(&root).await,
                )),
            }
        };

        tokio::select! {
            result = tokio::time::timeout(deadline, work) => match result {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(tool_error)) => Err(TransportError::Tool(tool_error)),
                Err(_) => Err(TransportError::Timeout(deadline)),
            },
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }

    async fn healthz(
        &self,
        _deadline: Duration,
    ) -> std::result::Result<HealthResponse, TransportError> {
        Ok(HealthResponse::ok(self.root.node_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn in_process(dir: &TempDir) -> InProcessTransport {
        InProcessTransport::new(
            RootContext::new(
                "local",
                dir.path(),
                vec!["echo".to_string(), "sleep".to_string()],
                "/usr/bin:/bin",
                Vec::new(),
                HashMap::new(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn in_process_write_read() {
        let dir = TempDir::new().unwrap();
        let transport = in_process(&dir);
        let cancel = CancelToken::new();

        let reply = transport
            .call(
                ToolCall::WriteFile(WriteFileRequest {
                    path: "x.txt".into(),
                    content: "payload".into(),
                    encoding: Default::default(),
                    overwrite: false,
                }),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap();
        let written = match reply {
            ToolReply::WriteFile(w) => w,
            other => panic!("unexpected reply: {other:?}"),
        };

        let read = transport
            .call(
                ToolCall::ReadFile(ReadFileRequest {
                    path: "x.txt".into(),
                    encoding: Default::default(),
                }),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap()
            .into_read_file()
            .unwrap();
        assert_eq!(read.content, "payload");
        assert_eq!(read.sha256, written.sha256);
    }

    #[tokio::test]
    async fn in_process_tool_error_passes_through() {
        let dir = TempDir::new().unwrap();
        let transport = in_process(&dir);

        let err = transport
            .call(
                ToolCall::ReadFile(ReadFileRequest {
                    path: "../outside".into(),
                    encoding: Default::default(),
                }),
                Duration::from_secs(5),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            TransportError::Tool(e) => {
                assert_eq!(e.kind, nacc_protocol::ToolErrorKind::PathEscape)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancelled_call_aborts() {
        let dir = TempDir::new().unwrap();
        let transport = in_process(&dir);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = transport
            .call(
                ToolCall::ExecuteCommand(ExecuteCommandRequest {
                    argv: vec!["sleep".into(), "10".into()],
                    cwd: None,
                    env: HashMap::new(),
                    timeout_seconds: Some(10),
                }),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test]
    async fn in_process_healthz_echoes_node_id() {
        let dir = TempDir::new().unwrap();
        let transport = in_process(&dir);
        let health = transport.healthz(Duration::from_secs(1)).await.unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.node_id, "local");
    }

    #[tokio::test]
    async fn http_transport_reports_unreachable_node() {
        let transport = HttpTransport::new("http://127.0.0.1:9".into(), None).unwrap();
        let err = transport.healthz(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Unavailable(_) | TransportError::Timeout(_)
        ));
    }
}
