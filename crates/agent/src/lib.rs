//! Pitchroom agent - the realtime relay and its retrieval capability
//!
//! This crate hosts the collaborators that serve live training sessions:
//!
//! - `relay` - the realtime middle tier. It owns the websocket mount,
//!   dials the hosted model with the resolved LLM credential, injects the
//!   persona script and tool declarations, and pumps frames between trainee
//!   and model. Everything else about the sub-protocol is opaque to it.
//! - `retrieval` - the knowledge-search tool configuration and the tool
//!   itself, which queries the product index with the resolved search
//!   credential when the model asks for grounding.
//! - `tools` - the `Tool` seam and registry the relay declares and
//!   dispatches against.
//!
//! # Composition contract
//!
//! A relay is constructed with its persona instructions and credential, gets
//! at most one retrieval tool attached, and is then frozen behind an `Arc`
//! for the lifetime of the process. Missing endpoint configuration is not an
//! error here: it surfaces when the first session tries to connect upstream.

pub mod relay;
pub mod retrieval;
pub mod tools;

pub use relay::{AttachError, RealtimeRelay, RelayError, REALTIME_PATH};
pub use retrieval::{KnowledgeSearchTool, ToolConfig, ToolConfigOptions};
pub use tools::{Tool, ToolRegistry};
