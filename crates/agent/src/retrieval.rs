//! Knowledge-index retrieval: tool configuration and the search tool itself.
//!
//! Configuration is assembled once during composition and shared by
//! reference. Nothing here validates reachability; a wrong endpoint or index
//! surfaces on the tool's first call, inside a session.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tracing::debug;

use pitchroom_core::credentials::{Authorization, Credential};

use crate::tools::Tool;

pub const DEFAULT_IDENTIFIER_FIELD: &str = "chunk_id";
pub const DEFAULT_CONTENT_FIELD: &str = "chunk";
pub const DEFAULT_EMBEDDING_FIELD: &str = "text_vector";
pub const DEFAULT_TITLE_FIELD: &str = "title";
pub const DEFAULT_SEMANTIC_CONFIGURATION: &str = "default";

pub const SEARCH_SCOPE: &str = "https://search.azure.com/.default";
const SEARCH_API_VERSION: &str = "2024-07-01";
const TOP_RESULTS: usize = 5;

/// Inputs to [`ToolConfig::build`]. Endpoint and index are required; every
/// other field falls back to its documented default when absent or blank.
#[derive(Clone, Debug, Default)]
pub struct ToolConfigOptions {
    pub endpoint: String,
    pub index: String,
    pub semantic_configuration: Option<String>,
    pub identifier_field: Option<String>,
    pub content_field: Option<String>,
    pub embedding_field: Option<String>,
    pub title_field: Option<String>,
    pub use_vector_query: Option<bool>,
}

/// Immutable description of the retrieval endpoint, fully populated before
/// first use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolConfig {
    pub endpoint: String,
    pub index: String,
    pub semantic_configuration: String,
    pub identifier_field: String,
    pub content_field: String,
    pub embedding_field: String,
    pub title_field: String,
    pub use_vector_query: bool,
}

impl ToolConfig {
    pub fn build(options: ToolConfigOptions) -> Self {
        Self {
            endpoint: options.endpoint,
            index: options.index,
            semantic_configuration: or_default(
                options.semantic_configuration,
                DEFAULT_SEMANTIC_CONFIGURATION,
            ),
            identifier_field: or_default(options.identifier_field, DEFAULT_IDENTIFIER_FIELD),
            content_field: or_default(options.content_field, DEFAULT_CONTENT_FIELD),
            embedding_field: or_default(options.embedding_field, DEFAULT_EMBEDDING_FIELD),
            title_field: or_default(options.title_field, DEFAULT_TITLE_FIELD),
            use_vector_query: options.use_vector_query.unwrap_or(true),
        }
    }
}

fn or_default(value: Option<String>, default: &str) -> String {
    value.filter(|value| !value.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

/// Hybrid semantic/vector query against the knowledge index, exposed to the
/// model as the `search` tool.
pub struct KnowledgeSearchTool {
    config: Arc<ToolConfig>,
    credential: Credential,
    http: reqwest::Client,
}

impl KnowledgeSearchTool {
    pub fn new(config: Arc<ToolConfig>, credential: Credential, http: reqwest::Client) -> Self {
        Self { config, credential, http }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn request_body(&self, query: &str) -> Value {
        let mut body = json!({
            "search": query,
            "queryType": "semantic",
            "semanticConfiguration": self.config.semantic_configuration,
            "top": TOP_RESULTS,
            "select": format!(
                "{},{},{}",
                self.config.identifier_field, self.config.title_field, self.config.content_field
            ),
        });
        if self.config.use_vector_query {
            body["vectorQueries"] = json!([{
                "kind": "text",
                "text": query,
                "fields": self.config.embedding_field,
            }]);
        }
        body
    }

    fn render_sources(&self, payload: &Value) -> String {
        let hits = payload.get("value").and_then(Value::as_array);
        let mut sources = String::new();
        for hit in hits.into_iter().flatten() {
            let identifier =
                hit.get(self.config.identifier_field.as_str()).and_then(Value::as_str).unwrap_or("?");
            let title = hit.get(self.config.title_field.as_str()).and_then(Value::as_str).unwrap_or("");
            let content =
                hit.get(self.config.content_field.as_str()).and_then(Value::as_str).unwrap_or("");
            sources.push_str(&format!("[{identifier}] {title}\n{content}\n\n"));
        }
        sources
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &'static str {
        "search"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "name": "search",
            "description": "Search the product knowledge base for grounding before answering. \
                            Results are text chunks prefixed with their source identifier.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query"
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }
        })
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .context("search tool input requires a `query` string")?;
        debug!(query, index = %self.config.index, "executing knowledge search");

        let url = format!(
            "{}/indexes/{}/docs/search?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.index,
            SEARCH_API_VERSION
        );

        let mut request = self.http.post(&url).json(&self.request_body(query));
        request = match self.credential.authorization(SEARCH_SCOPE).await? {
            Authorization::ApiKey(key) => request.header("api-key", key.expose_secret()),
            Authorization::Bearer(token) => request.bearer_auth(token.expose_secret()),
        };

        let payload: Value = request
            .send()
            .await
            .context("search request failed")?
            .error_for_status()
            .context("search request was rejected")?
            .json()
            .await
            .context("search response was not valid JSON")?;

        Ok(json!({ "sources": self.render_sources(&payload) }))
    }
}
