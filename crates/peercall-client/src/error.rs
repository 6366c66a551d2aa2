use peercall_protocol::PeerId;
use thiserror::Error;

/// Failures reported by a transport implementation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Transport is closed")]
    Closed,

    #[error("No remote offer to answer")]
    NoRemoteOffer,

    #[error("Transport failure: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(PeerId),

    #[error("Session {0} has no transport")]
    NoTransport(PeerId),

    #[error("Media channel for {0} is not open")]
    MediaNotOpen(PeerId),

    #[error("Session {0} is disconnected")]
    Disconnected(PeerId),

    #[error("No session for peer {0}")]
    UnknownPeer(PeerId),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signaling connection closed")]
    Closed,
}
