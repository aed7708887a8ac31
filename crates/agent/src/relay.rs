//! Realtime middle tier between the trainee's browser and the hosted model.
//!
//! The relay owns one websocket mount. For each session it dials the model's
//! realtime endpoint with the resolved LLM credential, injects the persona
//! script and tool declarations, and then pumps frames in both directions.
//! The sub-protocol stays opaque JSON/binary except for one interception:
//! completed tool calls are executed locally and their output is pushed back
//! upstream. Audio frames pass through untouched.
//!
//! Missing endpoint or deployment configuration is deliberately not checked
//! at construction. The first session that tries to connect fails with a
//! close frame; the process keeps serving.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{info, warn};
use uuid::Uuid;

use pitchroom_core::credentials::{Authorization, Credential, CredentialError};

use crate::retrieval::{KnowledgeSearchTool, ToolConfig};
use crate::tools::ToolRegistry;

pub const REALTIME_PATH: &str = "/realtime";
pub const LLM_SCOPE: &str = "https://cognitiveservices.azure.com/.default";
const REALTIME_API_VERSION: &str = "2024-10-01-preview";

// 1011: server encountered an unexpected condition.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("llm endpoint is not configured")]
    MissingEndpoint,
    #[error("llm deployment is not configured")]
    MissingDeployment,
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("upstream realtime connection failed: {0}")]
    Upstream(String),
}

/// Attaching a second retrieval tool is a composition bug, not a runtime
/// condition; composition fails fast on it.
#[derive(Debug, Error)]
#[error("a retrieval tool is already attached to the relay")]
pub struct AttachError;

struct ToolCall {
    name: String,
    call_id: String,
    arguments: String,
}

pub struct RealtimeRelay {
    endpoint: Option<String>,
    deployment: Option<String>,
    credential: Credential,
    instructions: String,
    tools: ToolRegistry,
}

impl RealtimeRelay {
    /// The persona instructions are a constructor argument on purpose: a
    /// relay cannot reach the HTTP surface without its script defined.
    pub fn new(
        endpoint: Option<String>,
        deployment: Option<String>,
        credential: Credential,
        instructions: String,
    ) -> Self {
        Self { endpoint, deployment, credential, instructions, tools: ToolRegistry::default() }
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn has_search_tool(&self) -> bool {
        !self.tools.is_empty()
    }

    /// Wires the knowledge-search tool in. At most one attachment per relay.
    pub fn attach_search_tool(
        &mut self,
        config: ToolConfig,
        credential: Credential,
        http: reqwest::Client,
    ) -> Result<(), AttachError> {
        if !self.tools.is_empty() {
            return Err(AttachError);
        }
        let tool = KnowledgeSearchTool::new(Arc::new(config), credential, http);
        self.tools.register(Arc::new(tool)).map_err(|_| AttachError)
    }

    /// The relay's fixed mount point.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route(REALTIME_PATH, get(session_handler)).with_state(self)
    }

    fn upstream_url(&self) -> Result<String, RelayError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or(RelayError::MissingEndpoint)?;
        let deployment = self
            .deployment
            .as_deref()
            .map(str::trim)
            .filter(|deployment| !deployment.is_empty())
            .ok_or(RelayError::MissingDeployment)?;

        let base = endpoint.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };

        Ok(format!(
            "{base}/openai/realtime?api-version={REALTIME_API_VERSION}&deployment={deployment}"
        ))
    }

    /// First message of every session: persona script plus tool declarations.
    fn session_update(&self) -> Value {
        json!({
            "type": "session.update",
            "session": {
                "instructions": self.instructions,
                "tools": self.tools.schemas(),
                "tool_choice": if self.tools.is_empty() { "none" } else { "auto" },
            }
        })
    }

    async fn serve_session(&self, mut client: WebSocket) {
        let session_id = Uuid::new_v4();
        info!(event_name = "session.opened", session_id = %session_id, "realtime session opened");

        match self.run_session(&mut client, session_id).await {
            Ok(()) => {
                info!(event_name = "session.closed", session_id = %session_id, "realtime session closed");
            }
            Err(error) => {
                warn!(
                    event_name = "session.failed",
                    session_id = %session_id,
                    error = %error,
                    "realtime session failed"
                );
                let frame = CloseFrame { code: CLOSE_INTERNAL_ERROR, reason: error.to_string().into() };
                let _ = client.send(ClientMessage::Close(Some(frame))).await;
            }
        }
    }

    async fn run_session(
        &self,
        client: &mut WebSocket,
        session_id: Uuid,
    ) -> Result<(), RelayError> {
        let url = self.upstream_url()?;
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|error| RelayError::Upstream(error.to_string()))?;

        // First real use of the LLM credential.
        match self.credential.authorization(LLM_SCOPE).await? {
            Authorization::ApiKey(key) => {
                let value = HeaderValue::from_str(key.expose_secret())
                    .map_err(|error| RelayError::Upstream(error.to_string()))?;
                request.headers_mut().insert("api-key", value);
            }
            Authorization::Bearer(token) => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                    .map_err(|error| RelayError::Upstream(error.to_string()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }

        let (upstream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|error| RelayError::Upstream(error.to_string()))?;
        let (mut upstream_tx, mut upstream_rx) = upstream.split();

        upstream_tx
            .send(UpstreamMessage::Text(self.session_update().to_string()))
            .await
            .map_err(|error| RelayError::Upstream(error.to_string()))?;

        loop {
            tokio::select! {
                frame = client.recv() => match frame {
                    Some(Ok(message)) => match client_to_upstream(message) {
                        Some(upstream_message) => {
                            upstream_tx
                                .send(upstream_message)
                                .await
                                .map_err(|error| RelayError::Upstream(error.to_string()))?;
                        }
                        None => break,
                    },
                    Some(Err(_)) | None => break,
                },
                frame = upstream_rx.next() => match frame {
                    Some(Ok(message)) => {
                        if let Some(tool_call) = extract_tool_call(&message) {
                            for reply in self.run_tool(tool_call, session_id).await {
                                upstream_tx
                                    .send(reply)
                                    .await
                                    .map_err(|error| RelayError::Upstream(error.to_string()))?;
                            }
                        } else if let Some(client_message) = upstream_to_client(message) {
                            if client.send(client_message).await.is_err() {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                    Some(Err(error)) => return Err(RelayError::Upstream(error.to_string())),
                    None => break,
                },
            }
        }

        Ok(())
    }

    /// Executes an intercepted tool call and feeds its output back upstream.
    /// Tool failures are reported to the model, not to the trainee.
    async fn run_tool(&self, call: ToolCall, session_id: Uuid) -> Vec<UpstreamMessage> {
        let output = match self.tools.get(&call.name) {
            Some(tool) => {
                let input = serde_json::from_str::<Value>(&call.arguments)
                    .unwrap_or_else(|_| json!({}));
                match tool.execute(input).await {
                    Ok(output) => output,
                    Err(error) => {
                        warn!(
                            event_name = "session.tool_failed",
                            session_id = %session_id,
                            tool = %call.name,
                            error = %error,
                            "tool execution failed"
                        );
                        json!({ "error": error.to_string() })
                    }
                }
            }
            None => json!({ "error": format!("unknown tool `{}`", call.name) }),
        };

        let item = json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call.call_id,
                "output": output.to_string(),
            }
        });
        let resume = json!({ "type": "response.create" });

        vec![
            UpstreamMessage::Text(item.to_string()),
            UpstreamMessage::Text(resume.to_string()),
        ]
    }
}

async fn session_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<RealtimeRelay>>,
) -> Response {
    ws.on_upgrade(move |socket| async move { relay.serve_session(socket).await })
}

fn client_to_upstream(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text.to_string())),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data.to_vec())),
        ClientMessage::Ping(data) => Some(UpstreamMessage::Ping(data.to_vec())),
        ClientMessage::Pong(data) => Some(UpstreamMessage::Pong(data.to_vec())),
        ClientMessage::Close(_) => None,
    }
}

fn upstream_to_client(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data.into())),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data.into())),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data.into())),
        UpstreamMessage::Close(_) | UpstreamMessage::Frame(_) => None,
    }
}

fn extract_tool_call(message: &UpstreamMessage) -> Option<ToolCall> {
    let UpstreamMessage::Text(text) = message else {
        return None;
    };
    let event: Value = serde_json::from_str(text).ok()?;
    if event.get("type")?.as_str()? != "response.function_call_arguments.done" {
        return None;
    }

    Some(ToolCall {
        name: event.get("name")?.as_str()?.to_string(),
        call_id: event.get("call_id")?.as_str()?.to_string(),
        arguments: event.get("arguments").and_then(Value::as_str).unwrap_or("{}").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

    use pitchroom_core::config::AppConfig;
    use pitchroom_core::credentials::{Credential, CredentialResolver};
    use pitchroom_core::persona::{self, RoleVariant};

    use super::{extract_tool_call, RealtimeRelay, RelayError};
    use crate::retrieval::{ToolConfig, ToolConfigOptions};

    fn ambient_credential() -> Credential {
        CredentialResolver::new(AppConfig::default().identity, reqwest::Client::new())
            .resolve(None, None)
    }

    fn relay(endpoint: Option<&str>, deployment: Option<&str>) -> RealtimeRelay {
        RealtimeRelay::new(
            endpoint.map(str::to_string),
            deployment.map(str::to_string),
            ambient_credential(),
            persona::instructions(RoleVariant::Customer),
        )
    }

    fn tool_config() -> ToolConfig {
        ToolConfig::build(ToolConfigOptions {
            endpoint: "https://search.example".to_string(),
            index: "press-docs".to_string(),
            ..ToolConfigOptions::default()
        })
    }

    #[test]
    fn missing_endpoint_is_a_deferred_session_error() {
        let relay = relay(None, Some("gpt-4o-realtime"));
        assert!(matches!(relay.upstream_url(), Err(RelayError::MissingEndpoint)));

        let relay = relay_without_deployment();
        assert!(matches!(relay.upstream_url(), Err(RelayError::MissingDeployment)));
    }

    fn relay_without_deployment() -> RealtimeRelay {
        relay(Some("https://llm.example"), None)
    }

    #[test]
    fn upstream_url_switches_to_websocket_scheme() {
        let relay = relay(Some("https://llm.example/"), Some("gpt-4o-realtime"));
        let url = relay.upstream_url().expect("both values are configured");
        assert!(url.starts_with("wss://llm.example/openai/realtime?"), "got: {url}");
        assert!(url.ends_with("deployment=gpt-4o-realtime"), "got: {url}");
    }

    #[test]
    fn second_tool_attachment_fails() {
        let mut relay = relay(Some("https://llm.example"), Some("gpt-4o-realtime"));
        let http = reqwest::Client::new();

        relay
            .attach_search_tool(tool_config(), ambient_credential(), http.clone())
            .expect("first attachment succeeds");
        assert!(relay.has_search_tool());

        relay
            .attach_search_tool(tool_config(), ambient_credential(), http)
            .expect_err("second attachment must fail");
    }

    #[test]
    fn session_update_carries_instructions_and_tools() {
        let mut relay = relay(Some("https://llm.example"), Some("gpt-4o-realtime"));

        let update = relay.session_update();
        assert_eq!(update["type"], json!("session.update"));
        assert_eq!(update["session"]["instructions"], json!(relay.instructions()));
        assert_eq!(update["session"]["tool_choice"], json!("none"));

        relay
            .attach_search_tool(tool_config(), ambient_credential(), reqwest::Client::new())
            .expect("attachment succeeds");
        let update = relay.session_update();
        assert_eq!(update["session"]["tool_choice"], json!("auto"));
        assert_eq!(update["session"]["tools"][0]["name"], json!("search"));
    }

    #[test]
    fn tool_calls_are_extracted_from_completion_events() {
        let event = json!({
            "type": "response.function_call_arguments.done",
            "name": "search",
            "call_id": "call-1",
            "arguments": "{\"query\":\"push to stop\"}"
        });
        let message = UpstreamMessage::Text(event.to_string());

        let call = extract_tool_call(&message).expect("completion event carries a tool call");
        assert_eq!(call.name, "search");
        assert_eq!(call.call_id, "call-1");
        assert!(call.arguments.contains("push to stop"));

        let other = UpstreamMessage::Text(json!({ "type": "response.done" }).to_string());
        assert!(extract_tool_call(&other).is_none());
        assert!(extract_tool_call(&UpstreamMessage::Binary(vec![1, 2, 3])).is_none());
    }

    #[tokio::test]
    async fn unknown_tool_calls_are_answered_with_an_error_output() {
        let relay = relay(Some("https://llm.example"), Some("gpt-4o-realtime"));
        let call = super::ToolCall {
            name: "grounding".to_string(),
            call_id: "call-9".to_string(),
            arguments: "{}".to_string(),
        };

        let replies = relay.run_tool(call, uuid::Uuid::new_v4()).await;
        assert_eq!(replies.len(), 2, "tool output plus response.create");

        let UpstreamMessage::Text(first) = &replies[0] else { panic!("expected text frame") };
        assert!(first.contains("function_call_output"));
        assert!(first.contains("unknown tool"));
        let UpstreamMessage::Text(second) = &replies[1] else { panic!("expected text frame") };
        assert!(second.contains("response.create"));
    }
}
