//! Peercall signaling relay
//!
//! Endpoints register an identity over a WebSocket and exchange negotiation
//! messages through the relay, which routes them on the `to` field alone.

pub mod api;
pub mod state;
pub mod ws;

/// Build the relay application
pub fn create_app(config: state::Config) -> axum::Router {
    let app_state = state::AppState::new(config);
    api::create_router(app_state)
}
