use std::sync::Arc;

use delve_core::config::GatewayConfig;
use delve_core::traits::StateStore;

use crate::host::RunHost;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub host: Arc<RunHost>,
    pub store: Arc<dyn StateStore>,
}
