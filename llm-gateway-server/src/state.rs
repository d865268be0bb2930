//! Shared application state handed to every handler.

use llm_gateway_core::health::HealthMonitor;
use llm_gateway_core::metrics::MetricsCollector;
use llm_gateway_core::registry::ProviderRegistry;
use llm_gateway_core::router::SmartRouter;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<SmartRouter>,
    pub registry: Arc<ProviderRegistry>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsCollector>,
}
