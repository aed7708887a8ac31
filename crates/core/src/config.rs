use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::persona::RoleVariant;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub production: bool,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub identity: IdentityConfig,
    pub persona: PersonaConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_key: Option<SecretString>,
}

/// Knowledge-index connection values. Field names and the semantic
/// configuration stay optional here; the retrieval tool substitutes its
/// documented defaults when they are absent.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub endpoint: Option<String>,
    pub index: Option<String>,
    pub api_key: Option<SecretString>,
    pub semantic_configuration: Option<String>,
    pub identifier_field: Option<String>,
    pub content_field: Option<String>,
    pub embedding_field: Option<String>,
    pub title_field: Option<String>,
    pub use_vector_query: Option<bool>,
}

/// Ambient identity context for services configured without an explicit key.
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub authority: String,
    pub managed_identity_endpoint: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PersonaConfig {
    pub variant: RoleVariant,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub static_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub production: Option<bool>,
    pub llm_endpoint: Option<String>,
    pub llm_deployment: Option<String>,
    pub llm_api_key: Option<String>,
    pub search_endpoint: Option<String>,
    pub search_index: Option<String>,
    pub search_api_key: Option<String>,
    pub tenant_id: Option<String>,
    pub persona_variant: Option<RoleVariant>,
    pub static_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            production: false,
            llm: LlmConfig { endpoint: None, deployment: None, api_key: None },
            search: SearchConfig {
                endpoint: None,
                index: None,
                api_key: None,
                semantic_configuration: None,
                identifier_field: None,
                content_field: None,
                embedding_field: None,
                title_field: None,
                use_vector_query: None,
            },
            identity: IdentityConfig {
                tenant_id: None,
                client_id: None,
                client_secret: None,
                authority: DEFAULT_AUTHORITY.to_string(),
                managed_identity_endpoint: None,
            },
            persona: PersonaConfig { variant: RoleVariant::Customer },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8765,
                static_dir: PathBuf::from("static"),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    /// Layered load: defaults, then the local `pitchroom.toml` file (skipped
    /// in production mode), then `PITCHROOM_*` environment variables, then
    /// programmatic overrides. Missing service endpoints and keys are legal
    /// at this stage; they surface as runtime failures on first real use.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = read_env("PITCHROOM_PRODUCTION") {
            config.production = parse_bool_lenient(&value, false);
        }
        if let Some(production) = options.overrides.production {
            config.production = production;
        }

        // The local secrets file is a development convenience only.
        if !config.production {
            if let Some(path) = resolve_config_path(options.config_path.as_deref()) {
                let patch = read_patch(&path)?;
                config.apply_patch(patch);
            }
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(endpoint) = llm.endpoint {
                self.llm.endpoint = Some(endpoint);
            }
            if let Some(deployment) = llm.deployment {
                self.llm.deployment = Some(deployment);
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
        }

        if let Some(search) = patch.search {
            if let Some(endpoint) = search.endpoint {
                self.search.endpoint = Some(endpoint);
            }
            if let Some(index) = search.index {
                self.search.index = Some(index);
            }
            if let Some(search_api_key_value) = search.api_key {
                self.search.api_key = Some(secret_value(search_api_key_value));
            }
            if let Some(semantic_configuration) = search.semantic_configuration {
                self.search.semantic_configuration = Some(semantic_configuration);
            }
            if let Some(identifier_field) = search.identifier_field {
                self.search.identifier_field = Some(identifier_field);
            }
            if let Some(content_field) = search.content_field {
                self.search.content_field = Some(content_field);
            }
            if let Some(embedding_field) = search.embedding_field {
                self.search.embedding_field = Some(embedding_field);
            }
            if let Some(title_field) = search.title_field {
                self.search.title_field = Some(title_field);
            }
            if let Some(use_vector_query) = search.use_vector_query {
                self.search.use_vector_query = Some(use_vector_query);
            }
        }

        if let Some(identity) = patch.identity {
            if let Some(tenant_id) = identity.tenant_id {
                self.identity.tenant_id = Some(tenant_id);
            }
            if let Some(client_id) = identity.client_id {
                self.identity.client_id = Some(client_id);
            }
            if let Some(client_secret_value) = identity.client_secret {
                self.identity.client_secret = Some(secret_value(client_secret_value));
            }
            if let Some(authority) = identity.authority {
                self.identity.authority = authority;
            }
            if let Some(managed_identity_endpoint) = identity.managed_identity_endpoint {
                self.identity.managed_identity_endpoint = Some(managed_identity_endpoint);
            }
        }

        if let Some(persona) = patch.persona {
            if let Some(variant) = persona.variant {
                self.persona.variant = variant;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(static_dir) = server.static_dir {
                self.server.static_dir = static_dir;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PITCHROOM_LLM_ENDPOINT") {
            self.llm.endpoint = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_LLM_DEPLOYMENT") {
            self.llm.deployment = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }

        if let Some(value) = read_env("PITCHROOM_SEARCH_ENDPOINT") {
            self.search.endpoint = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_SEARCH_INDEX") {
            self.search.index = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_SEARCH_API_KEY") {
            self.search.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PITCHROOM_SEARCH_SEMANTIC_CONFIGURATION") {
            self.search.semantic_configuration = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_SEARCH_IDENTIFIER_FIELD") {
            self.search.identifier_field = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_SEARCH_CONTENT_FIELD") {
            self.search.content_field = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_SEARCH_EMBEDDING_FIELD") {
            self.search.embedding_field = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_SEARCH_TITLE_FIELD") {
            self.search.title_field = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_SEARCH_USE_VECTOR_QUERY") {
            // Lenient on purpose: a malformed flag must not fail bootstrap.
            self.search.use_vector_query = Some(parse_bool_lenient(&value, true));
        }

        if let Some(value) = read_env("PITCHROOM_TENANT_ID") {
            self.identity.tenant_id = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_IDENTITY_CLIENT_ID") {
            self.identity.client_id = Some(value);
        }
        if let Some(value) = read_env("PITCHROOM_IDENTITY_CLIENT_SECRET") {
            self.identity.client_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("PITCHROOM_IDENTITY_AUTHORITY") {
            self.identity.authority = value;
        }
        if let Some(value) = read_env("PITCHROOM_IDENTITY_MANAGED_ENDPOINT") {
            self.identity.managed_identity_endpoint = Some(value);
        }

        if let Some(value) = read_env("PITCHROOM_PERSONA_VARIANT") {
            self.persona.variant = value
                .parse()
                .map_err(|error: crate::persona::UnknownVariant| {
                    ConfigError::Validation(error.to_string())
                })?;
        }

        if let Some(value) = read_env("PITCHROOM_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PITCHROOM_SERVER_PORT") {
            self.server.port = parse_u16("PITCHROOM_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PITCHROOM_SERVER_STATIC_DIR") {
            self.server.static_dir = PathBuf::from(value);
        }

        let log_level =
            read_env("PITCHROOM_LOGGING_LEVEL").or_else(|| read_env("PITCHROOM_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PITCHROOM_LOGGING_FORMAT").or_else(|| read_env("PITCHROOM_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(llm_endpoint) = overrides.llm_endpoint {
            self.llm.endpoint = Some(llm_endpoint);
        }
        if let Some(llm_deployment) = overrides.llm_deployment {
            self.llm.deployment = Some(llm_deployment);
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(search_endpoint) = overrides.search_endpoint {
            self.search.endpoint = Some(search_endpoint);
        }
        if let Some(search_index) = overrides.search_index {
            self.search.index = Some(search_index);
        }
        if let Some(search_api_key) = overrides.search_api_key {
            self.search.api_key = Some(secret_value(search_api_key));
        }
        if let Some(tenant_id) = overrides.tenant_id {
            self.identity.tenant_id = Some(tenant_id);
        }
        if let Some(persona_variant) = overrides.persona_variant {
            self.persona.variant = persona_variant;
        }
        if let Some(static_dir) = overrides.static_dir {
            self.server.static_dir = static_dir;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    /// Bootstrap is permissive by design: only structurally nonsensical
    /// values fail here. Absent endpoints, deployments, and keys are checked
    /// by the collaborators that need them, at first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "server.port must be greater than zero".to_string(),
            ));
        }

        if self.server.bind_address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.bind_address must not be empty".to_string(),
            ));
        }

        let level = self.logging.level.trim().to_ascii_lowercase();
        match level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            _ => Err(ConfigError::Validation(
                "logging.level must be one of trace|debug|info|warn|error".to_string(),
            )),
        }
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("pitchroom.toml"), PathBuf::from("config/pitchroom.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Boolean flags fall back to their documented default instead of failing,
/// so a typo in an optional flag never blocks bootstrap.
fn parse_bool_lenient(value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => default,
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    search: Option<SearchPatch>,
    identity: Option<IdentityPatch>,
    persona: Option<PersonaPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    endpoint: Option<String>,
    deployment: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchPatch {
    endpoint: Option<String>,
    index: Option<String>,
    api_key: Option<String>,
    semantic_configuration: Option<String>,
    identifier_field: Option<String>,
    content_field: Option<String>,
    embedding_field: Option<String>,
    title_field: Option<String>,
    use_vector_query: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct IdentityPatch {
    tenant_id: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    authority: Option<String>,
    managed_identity_endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PersonaPatch {
    variant: Option<RoleVariant>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    static_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
