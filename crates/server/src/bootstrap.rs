//! One-time session composition: credentials, persona, relay, tool, routes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tracing::{info, warn};

use pitchroom_agent::relay::{AttachError, RealtimeRelay, REALTIME_PATH};
use pitchroom_agent::retrieval::{ToolConfig, ToolConfigOptions};
use pitchroom_core::config::{AppConfig, ConfigError};
use pitchroom_core::credentials::CredentialResolver;
use pitchroom_core::persona;

use crate::assets;

/// Explicit once-flag owned by the process entry point. Composition claims
/// it; a second claim is a programming error, not a recoverable condition.
#[derive(Debug, Default)]
pub struct ComposeGate(AtomicBool);

impl ComposeGate {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session composition already ran in this process")]
    AlreadyComposed,
    #[error(transparent)]
    ToolAttach(#[from] AttachError),
}

pub struct Application {
    pub config: AppConfig,
    pub relay: Arc<RealtimeRelay>,
    pub router: Router,
}

/// Composes the serving application exactly once.
///
/// Credentials are resolved per service from the same resolver, so both fall
/// back to one shared ambient identity when neither a key nor a tenant is
/// configured. Missing LLM endpoint/deployment values are tolerated here and
/// fail the first realtime session instead; a missing search endpoint or
/// index skips the retrieval tool entirely.
pub fn compose(config: AppConfig, gate: &ComposeGate) -> Result<Application, BootstrapError> {
    if !gate.claim() {
        return Err(BootstrapError::AlreadyComposed);
    }

    info!(
        event_name = "system.compose.start",
        production = config.production,
        persona_variant = ?config.persona.variant,
        "starting session composition"
    );

    let http = reqwest::Client::new();
    let resolver = CredentialResolver::new(config.identity.clone(), http.clone());
    let tenant_id = config.identity.tenant_id.as_deref();

    let llm_credential = resolver.resolve(config.llm.api_key.as_ref(), tenant_id);
    let search_credential = resolver.resolve(config.search.api_key.as_ref(), tenant_id);
    info!(
        event_name = "system.compose.credentials_resolved",
        llm_source = ?llm_credential.source(),
        search_source = ?search_credential.source(),
        "service credentials resolved"
    );

    let instructions = persona::instructions(config.persona.variant);
    let mut relay = RealtimeRelay::new(
        config.llm.endpoint.clone(),
        config.llm.deployment.clone(),
        llm_credential,
        instructions,
    );

    match (config.search.endpoint.clone(), config.search.index.clone()) {
        (Some(endpoint), Some(index)) => {
            let tool_config = ToolConfig::build(ToolConfigOptions {
                endpoint,
                index,
                semantic_configuration: config.search.semantic_configuration.clone(),
                identifier_field: config.search.identifier_field.clone(),
                content_field: config.search.content_field.clone(),
                embedding_field: config.search.embedding_field.clone(),
                title_field: config.search.title_field.clone(),
                use_vector_query: config.search.use_vector_query,
            });
            relay.attach_search_tool(tool_config, search_credential, http)?;
            info!(
                event_name = "system.compose.tool_attached",
                "knowledge-search tool attached to the relay"
            );
        }
        _ => {
            warn!(
                event_name = "system.compose.tool_skipped",
                "search endpoint or index not configured; serving without the retrieval tool"
            );
        }
    }

    let relay = Arc::new(relay);
    let router =
        Router::new().merge(Arc::clone(&relay).router()).merge(assets::router(&config.server.static_dir));
    info!(
        event_name = "system.compose.routes_mounted",
        realtime_path = REALTIME_PATH,
        static_dir = %config.server.static_dir.display(),
        "entry surface mounted"
    );

    Ok(Application { config, relay, router })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    use pitchroom_core::config::AppConfig;
    use pitchroom_core::credentials::CredentialSource;

    use super::{compose, BootstrapError, ComposeGate};

    fn test_config(static_dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.server.static_dir = static_dir.path().to_path_buf();
        config
    }

    #[test]
    fn compose_twice_on_one_gate_fails() {
        let static_dir = TempDir::new().expect("temp dir");
        let gate = ComposeGate::new();

        assert!(compose(test_config(&static_dir), &gate).is_ok(), "first composition succeeds");
        let error = match compose(test_config(&static_dir), &gate) {
            Ok(_) => panic!("second composition must fail"),
            Err(error) => error,
        };
        assert!(matches!(error, BootstrapError::AlreadyComposed));
    }

    #[test]
    fn search_key_only_environment_composes_with_ambient_llm_credential() {
        let static_dir = TempDir::new().expect("temp dir");
        let gate = ComposeGate::new();

        let mut config = test_config(&static_dir);
        config.search.api_key = Some("search-key".to_string().into());

        let app = compose(config, &gate).expect("composition must not require llm values");
        assert_eq!(app.relay.credential().source(), CredentialSource::AmbientIdentity);
        assert!(
            !app.relay.has_search_tool(),
            "no search endpoint means the tool attachment is deferred"
        );
    }

    #[test]
    fn fully_configured_search_attaches_the_tool() {
        let static_dir = TempDir::new().expect("temp dir");
        let gate = ComposeGate::new();

        let mut config = test_config(&static_dir);
        config.search.endpoint = Some("https://search.example".to_string());
        config.search.index = Some("press-docs".to_string());
        config.search.api_key = Some("search-key".to_string().into());

        let app = compose(config, &gate).expect("composition succeeds");
        assert!(app.relay.has_search_tool());
    }

    #[tokio::test]
    async fn composed_router_serves_index_and_realtime_mounts() {
        let static_dir = TempDir::new().expect("temp dir");
        fs::write(static_dir.path().join("index.html"), "<html>pitchroom</html>")
            .expect("write index");
        let gate = ComposeGate::new();

        let app = compose(test_config(&static_dir), &gate).expect("composition succeeds");

        let index = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("index route responds");
        assert_eq!(index.status(), StatusCode::OK);

        // A plain GET without upgrade headers is rejected, but the mount exists.
        let realtime = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/realtime").body(Body::empty()).expect("request"))
            .await
            .expect("realtime route responds");
        assert_ne!(realtime.status(), StatusCode::NOT_FOUND);

        let missing = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/nope.js").body(Body::empty()).expect("request"))
            .await
            .expect("fallback responds");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
