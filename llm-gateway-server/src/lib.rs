//! # LLM Gateway Server
//!
//! The HTTP front-end over `llm-gateway-core`: an OpenAI-compatible chat
//! surface with buffered and SSE-streamed responses, health and readiness
//! endpoints, an administrative snapshot, and a Prometheus exposition on a
//! dedicated port. Configuration is TOML with environment-resolved
//! credentials; see [`config::GatewayConfig`].

pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod server;
pub mod state;

pub use config::GatewayConfig;
pub use gateway_error::{ErrorCode, GatewayError};
pub use state::AppState;
