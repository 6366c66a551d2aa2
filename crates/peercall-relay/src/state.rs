use crate::ws::connections::ConnectionManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        Ok(Config { bind_address })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connections: Arc::new(ConnectionManager::new()),
        }
    }
}
