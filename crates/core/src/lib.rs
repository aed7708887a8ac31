//! Pitchroom core - configuration, credential resolution, and persona scripts
//!
//! This crate holds the deterministic bootstrap logic for the sales-training
//! session: everything that has to be decided exactly once, before the first
//! realtime connection is served.
//!
//! - `config` - layered application configuration (defaults, optional local
//!   file outside production, `PITCHROOM_*` environment overrides).
//! - `credentials` - per-service authentication strategy selection (explicit
//!   key, tenant-scoped developer-CLI identity, or a shared ambient identity
//!   chain) with token acquisition deferred to first use.
//! - `persona` - the fixed customer/evaluator training scripts the hosted
//!   model is instructed to perform.
//!
//! Nothing in this crate performs network I/O at construction time. Resolved
//! credentials and rendered scripts are plain values that the relay and
//! retrieval collaborators consume after composition.

pub mod config;
pub mod credentials;
pub mod persona;

pub use config::{AppConfig, ConfigError, ConfigOverrides, IdentityConfig, LoadOptions};
pub use credentials::{
    AccessToken, Authorization, Credential, CredentialError, CredentialResolver, CredentialSource,
    TokenSource,
};
pub use persona::{PersonaScript, RoleVariant};
