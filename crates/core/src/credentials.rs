//! Per-service authentication strategy selection.
//!
//! Resolution itself is pure ranking over the configured inputs: an explicit
//! API key always wins, then a tenant-scoped developer-CLI identity, then a
//! shared ambient identity chain. No branch performs network I/O at resolve
//! time; tokens are acquired lazily, on the first call a collaborator makes
//! with the resolved credential.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::IdentityConfig;

/// Bound on any interactive sign-in step of the tenant-scoped branch.
pub const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tokens are refreshed this long before their reported expiry.
const EXPIRY_LEEWAY_SECS: i64 = 120;

const IMDS_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_API_VERSION: &str = "2018-02-01";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    ExplicitKey,
    TenantScopedIdentity,
    AmbientIdentity,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("interactive sign-in did not complete within {}s", .0.as_secs())]
    InteractiveTimeout(Duration),
    #[error("developer CLI token acquisition failed: {0}")]
    DeveloperCli(String),
    #[error("token endpoint request failed: {0}")]
    TokenRequest(String),
    #[error("token response could not be parsed: {0}")]
    TokenResponse(String),
    #[error("ambient identity chain exhausted: {0}")]
    ChainExhausted(String),
}

/// A bearer token with its expiry, as handed to collaborators.
#[derive(Clone, Debug)]
pub struct AccessToken {
    secret: SecretString,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(secret: SecretString, expires_at: DateTime<Utc>) -> Self {
        Self { secret, expires_at }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_stale(&self) -> bool {
        Utc::now() + TimeDelta::seconds(EXPIRY_LEEWAY_SECS) >= self.expires_at
    }

    pub fn into_secret(self) -> SecretString {
        self.secret
    }
}

/// Deferred token acquisition. Identity-backed credentials implement this;
/// collaborator tests can substitute a mock.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

/// What a collaborator sends on the wire for one request or connection.
/// `SecretString` redacts itself in debug output.
#[derive(Debug)]
pub enum Authorization {
    ApiKey(SecretString),
    Bearer(SecretString),
}

#[derive(Clone)]
pub enum Credential {
    Key(KeyCredential),
    Tenant(Arc<TenantCliCredential>),
    Ambient(Arc<AmbientChainCredential>),
}

impl Credential {
    pub fn source(&self) -> CredentialSource {
        match self {
            Self::Key(_) => CredentialSource::ExplicitKey,
            Self::Tenant(_) => CredentialSource::TenantScopedIdentity,
            Self::Ambient(_) => CredentialSource::AmbientIdentity,
        }
    }

    /// First point at which a credential can fail. Key credentials never do.
    pub async fn authorization(&self, scope: &str) -> Result<Authorization, CredentialError> {
        match self {
            Self::Key(key) => Ok(Authorization::ApiKey(key.secret().clone())),
            Self::Tenant(tenant) => {
                Ok(Authorization::Bearer(tenant.access_token(scope).await?.into_secret()))
            }
            Self::Ambient(ambient) => {
                Ok(Authorization::Bearer(ambient.access_token(scope).await?.into_secret()))
            }
        }
    }
}

#[derive(Clone)]
pub struct KeyCredential {
    secret: SecretString,
}

impl KeyCredential {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }
}

/// Developer-CLI identity bound to one tenant. The CLI may prompt the
/// operator, so every invocation is wrapped in the interactive timeout.
pub struct TenantCliCredential {
    tenant_id: String,
    interactive_timeout: Duration,
    cache: Mutex<Option<AccessToken>>,
}

impl TenantCliCredential {
    pub fn new(tenant_id: impl Into<String>, interactive_timeout: Duration) -> Self {
        Self { tenant_id: tenant_id.into(), interactive_timeout, cache: Mutex::new(None) }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn interactive_timeout(&self) -> Duration {
        self.interactive_timeout
    }
}

#[async_trait]
impl TokenSource for TenantCliCredential {
    async fn access_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if !token.is_stale() {
                return Ok(token.clone());
            }
        }

        let token =
            tokio::time::timeout(self.interactive_timeout, cli_token(scope, Some(&self.tenant_id)))
                .await
                .map_err(|_| CredentialError::InteractiveTimeout(self.interactive_timeout))??;
        debug!(tenant_id = %self.tenant_id, "developer CLI token acquired");
        *cache = Some(token.clone());
        Ok(token)
    }
}

/// The ambient mechanisms, in the order they are attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmbientMechanism {
    ClientSecret,
    ManagedIdentity,
    DeveloperCli,
}

pub const AMBIENT_CHAIN: [AmbientMechanism; 3] = [
    AmbientMechanism::ClientSecret,
    AmbientMechanism::ManagedIdentity,
    AmbientMechanism::DeveloperCli,
];

/// Ambient identity: tries each configured mechanism in a fixed order at
/// first token request. Exactly one instance exists per process; the
/// resolver hands the same `Arc` to every service that falls through to it.
pub struct AmbientChainCredential {
    identity: IdentityConfig,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl AmbientChainCredential {
    pub fn new(identity: IdentityConfig, http: reqwest::Client) -> Self {
        Self { identity, http, cache: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl TokenSource for AmbientChainCredential {
    async fn access_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.get(scope) {
            if !token.is_stale() {
                return Ok(token.clone());
            }
        }

        let mut failures = Vec::new();
        for mechanism in AMBIENT_CHAIN {
            match self.attempt(mechanism, scope).await {
                Ok(token) => {
                    info!(mechanism = ?mechanism, "ambient identity mechanism succeeded");
                    cache.insert(scope.to_string(), token.clone());
                    return Ok(token);
                }
                Err(error) => {
                    debug!(mechanism = ?mechanism, error = %error, "ambient identity mechanism failed");
                    failures.push(format!("{mechanism:?}: {error}"));
                }
            }
        }

        Err(CredentialError::ChainExhausted(failures.join("; ")))
    }
}

impl AmbientChainCredential {
    async fn attempt(
        &self,
        mechanism: AmbientMechanism,
        scope: &str,
    ) -> Result<AccessToken, CredentialError> {
        match mechanism {
            AmbientMechanism::ClientSecret => self.client_secret_token(scope).await,
            AmbientMechanism::ManagedIdentity => self.managed_identity_token(scope).await,
            AmbientMechanism::DeveloperCli => cli_token(scope, self.identity.tenant_id.as_deref()).await,
        }
    }

    async fn client_secret_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let (tenant_id, client_id, client_secret) = match (
            self.identity.tenant_id.as_deref(),
            self.identity.client_id.as_deref(),
            self.identity.client_secret.as_ref(),
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                (tenant_id, client_id, client_secret)
            }
            _ => {
                return Err(CredentialError::TokenRequest(
                    "client-secret identity is not configured".to_string(),
                ))
            }
        };

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.identity.authority.trim_end_matches('/'),
            tenant_id
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret.expose_secret()),
                ("scope", scope),
            ])
            .send()
            .await
            .map_err(|error| CredentialError::TokenRequest(error.to_string()))?
            .error_for_status()
            .map_err(|error| CredentialError::TokenRequest(error.to_string()))?;

        let payload: OauthTokenPayload = response
            .json()
            .await
            .map_err(|error| CredentialError::TokenResponse(error.to_string()))?;
        Ok(payload.into_token())
    }

    async fn managed_identity_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let endpoint = self
            .identity
            .managed_identity_endpoint
            .as_deref()
            .unwrap_or(IMDS_ENDPOINT)
            .trim_end_matches('/')
            .to_string();
        let url = format!("{endpoint}/metadata/identity/oauth2/token");

        let response = self
            .http
            .get(&url)
            .header("Metadata", "true")
            .query(&[("api-version", IMDS_API_VERSION), ("resource", &scope_resource(scope))])
            .send()
            .await
            .map_err(|error| CredentialError::TokenRequest(error.to_string()))?
            .error_for_status()
            .map_err(|error| CredentialError::TokenRequest(error.to_string()))?;

        let payload: ImdsTokenPayload = response
            .json()
            .await
            .map_err(|error| CredentialError::TokenResponse(error.to_string()))?;
        Ok(payload.into_token())
    }
}

/// Chooses an authentication strategy per service. Holds the one ambient
/// instance so that every service falling through to branch 3 shares it, and
/// one tenant credential per tenant id so the interactive sign-in runs at
/// most once however many services land on branch 2.
pub struct CredentialResolver {
    identity: IdentityConfig,
    http: reqwest::Client,
    tenants: std::sync::Mutex<HashMap<String, Arc<TenantCliCredential>>>,
    ambient: OnceLock<Arc<AmbientChainCredential>>,
}

impl CredentialResolver {
    pub fn new(identity: IdentityConfig, http: reqwest::Client) -> Self {
        Self {
            identity,
            http,
            tenants: std::sync::Mutex::new(HashMap::new()),
            ambient: OnceLock::new(),
        }
    }

    /// Pure ranking over the two inputs; never fails, never touches the
    /// network. Blank strings count as absent.
    pub fn resolve(
        &self,
        api_key: Option<&SecretString>,
        tenant_id: Option<&str>,
    ) -> Credential {
        if let Some(key) = api_key.filter(|key| !key.expose_secret().trim().is_empty()) {
            debug!("resolved explicit key credential");
            return Credential::Key(KeyCredential::new(key.clone()));
        }

        if let Some(tenant) = tenant_id.map(str::trim).filter(|tenant| !tenant.is_empty()) {
            info!(tenant_id = %tenant, "resolved tenant-scoped developer CLI credential");
            let mut tenants =
                self.tenants.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let credential = tenants
                .entry(tenant.to_string())
                .or_insert_with(|| Arc::new(TenantCliCredential::new(tenant, INTERACTIVE_TIMEOUT)));
            return Credential::Tenant(Arc::clone(credential));
        }

        info!("resolved ambient identity credential");
        let ambient = self.ambient.get_or_init(|| {
            Arc::new(AmbientChainCredential::new(self.identity.clone(), self.http.clone()))
        });
        Credential::Ambient(Arc::clone(ambient))
    }
}

/// `scope` is an OAuth2 scope (`https://service/.default`); the metadata
/// endpoint wants the bare resource URI instead.
fn scope_resource(scope: &str) -> String {
    scope.trim_end_matches("/.default").to_string()
}

async fn cli_token(scope: &str, tenant_id: Option<&str>) -> Result<AccessToken, CredentialError> {
    let mut command = Command::new("az");
    // A timed-out invocation must not leave an interactive prompt running.
    command
        .kill_on_drop(true)
        .arg("account")
        .arg("get-access-token")
        .arg("--scope")
        .arg(scope)
        .arg("--output")
        .arg("json");
    if let Some(tenant) = tenant_id {
        command.arg("--tenant").arg(tenant);
    }

    let output = command
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .output()
        .await
        .map_err(|error| CredentialError::DeveloperCli(error.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CredentialError::DeveloperCli(stderr.trim().to_string()));
    }

    let payload: CliTokenPayload = serde_json::from_slice(&output.stdout)
        .map_err(|error| CredentialError::TokenResponse(error.to_string()))?;
    Ok(payload.into_token())
}

#[derive(Deserialize)]
struct OauthTokenPayload {
    access_token: String,
    expires_in: i64,
}

impl OauthTokenPayload {
    fn into_token(self) -> AccessToken {
        AccessToken::new(self.access_token.into(), Utc::now() + TimeDelta::seconds(self.expires_in))
    }
}

#[derive(Deserialize)]
struct ImdsTokenPayload {
    access_token: String,
    // The metadata endpoint reports expiry as a stringified unix timestamp.
    expires_on: String,
}

impl ImdsTokenPayload {
    fn into_token(self) -> AccessToken {
        let expires_at = self
            .expires_on
            .parse::<i64>()
            .ok()
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
            .unwrap_or_else(|| Utc::now() + TimeDelta::minutes(5));
        AccessToken::new(self.access_token.into(), expires_at)
    }
}

#[derive(Deserialize)]
struct CliTokenPayload {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expires_on")]
    expires_on: Option<i64>,
}

impl CliTokenPayload {
    fn into_token(self) -> AccessToken {
        let expires_at = self
            .expires_on
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
            .unwrap_or_else(|| Utc::now() + TimeDelta::minutes(5));
        AccessToken::new(self.access_token.into(), expires_at)
    }
}
