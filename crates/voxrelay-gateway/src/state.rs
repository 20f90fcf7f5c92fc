//! Gateway shared state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use voxrelay_core::config::Config;

use crate::admission::Admission;
use crate::registry::SessionRegistry;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub admission: Admission,
    /// Cancelled on server shutdown; every connection watches it.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(config: Config) -> Self {
        let server = config.server();
        Self {
            registry: SessionRegistry::new(server.admission.max_sessions),
            admission: Admission::new(&server.admission),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}
