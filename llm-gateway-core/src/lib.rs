//! # LLM Gateway Core
//!
//! Provider adapters, smart routing and the resilience layer of the LLM
//! gateway. The crate is the buffered and streamed dispatch engine behind
//! the OpenAI-compatible HTTP surface served by `llm-gateway-server`.
//!
//! ## Architecture
//!
//! A request passes router → retry → breaker → adapter → upstream, with the
//! metrics collector and health monitor closing the feedback loop:
//!
//! - [`providers`]: per-provider request/response translation, streaming
//!   decode and error classification behind one [`providers::Provider`]
//!   trait (OpenAI, Anthropic, Baidu Wenxin, Zhipu GLM, mock)
//! - [`registry`]: name-keyed ownership of the adapters
//! - [`router`]: health-aware selection with pluggable strategies
//! - [`breaker`] / [`retry`]: circuit breaking and bounded backoff
//! - [`health`]: periodic concurrent probing with threshold-gated verdicts
//! - [`metrics`]: request accounting and latency percentiles
//! - [`estimator`]: token and cost heuristics for pre-flight ceilings
//!
//! ## Quick start
//!
//! ```rust
//! use llm_gateway_core::health::{HealthConfig, HealthMonitor};
//! use llm_gateway_core::metrics::MetricsCollector;
//! use llm_gateway_core::providers::mock::MockProvider;
//! use llm_gateway_core::registry::ProviderRegistry;
//! use llm_gateway_core::router::{RouterConfig, SmartRouter};
//!
//! let registry = std::sync::Arc::new(ProviderRegistry::new());
//! let health = std::sync::Arc::new(
//!     HealthMonitor::new(registry.clone(), HealthConfig::default()).unwrap(),
//! );
//! let metrics = std::sync::Arc::new(MetricsCollector::new());
//! let router = SmartRouter::new(
//!     registry,
//!     health,
//!     metrics,
//!     RouterConfig::default(),
//!     Default::default(),
//!     Default::default(),
//! )
//! .unwrap();
//! router.add_provider(std::sync::Arc::new(MockProvider::new("mock-a"))).unwrap();
//! ```

pub mod breaker;
pub mod error;
pub mod estimator;
pub mod health;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod router;

pub use error::{ClassifiedError, ErrorCategory};
pub use models::{ChatRequest, ChatResponse, Message, Role, RoutingDecision};
pub use providers::{create_provider, Provider, ProviderConfig, ProviderType};
pub use router::{RouterConfig, SmartRouter};
