//! The process-lifetime singleton bundling C1–C4, passed explicitly through
//! the controller and into every axum handler via `State`, rather than
//! reached for as an ambient global (design notes, §9).

use std::sync::Arc;

use crate::config::Config;
use crate::engine::SandboxEngine;
use crate::registry::Registry;
use crate::session::SessionTable;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub engine: Arc<dyn SandboxEngine>,
    pub sessions: Arc<SessionTable>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(registry: Registry, engine: Arc<dyn SandboxEngine>, config: Config) -> Self {
        Self {
            registry: Arc::new(registry),
            engine,
            sessions: Arc::new(SessionTable::new()),
            config: Arc::new(config),
        }
    }
}
