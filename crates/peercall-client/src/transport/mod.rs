//! Transport seam between peer sessions and the connection engine
//!
//! A [`TransportFactory`] creates one [`PeerTransport`] per remote peer. The
//! transport reports asynchronous happenings (gathered candidates, connectivity
//! changes, inbound media) as [`TransportEvent`]s tagged with the peer they
//! belong to and the generation of the transport that raised them, so the
//! orchestrator can dispatch them from a single loop and drop events from a
//! transport that has since been replaced.

pub mod loopback;
pub mod rtc;

use async_trait::async_trait;
use bytes::Bytes;
use peercall_protocol::{PeerId, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use loopback::{LoopbackFactory, LoopbackNetwork};
pub use rtc::WebRtcFactory;

/// Connectivity of a peer connection as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered and should be signaled
    LocalCandidate { candidate: String, sdp_mid: String },
    /// Candidate gathering finished
    GatheringComplete,
    StateChange(ConnectionState),
    /// The media channel can carry packets
    MediaChannelOpen,
    /// A packet arrived on the media channel, exactly as sent by the peer
    MediaMessage(Bytes),
}

/// Which transport raised an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOrigin {
    pub peer: PeerId,
    pub generation: u64,
}

pub type TransportEventSender = mpsc::UnboundedSender<(TransportOrigin, TransportEvent)>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<(TransportOrigin, TransportEvent)>;

/// Event sink handed to a transport, pre-tagged with its origin
#[derive(Clone)]
pub struct TransportEvents {
    origin: TransportOrigin,
    tx: TransportEventSender,
}

impl TransportEvents {
    pub fn new(peer: PeerId, generation: u64, tx: TransportEventSender) -> Self {
        Self {
            origin: TransportOrigin { peer, generation },
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.origin.peer
    }

    pub fn generation(&self) -> u64 {
        self.origin.generation
    }

    /// Deliver an event; returns false once the receiving loop is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.origin.clone(), event)).is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// STUN/TURN URLs
    pub ice_servers: Vec<String>,
}

/// Outgoing packet path of one peer connection
#[async_trait]
pub trait MediaChannel: Send + Sync {
    async fn send(&self, packet: Bytes) -> Result<(), TransportError>;
}

/// One negotiated connection to a remote peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Add the outgoing audio channel; must happen before the first offer
    async fn create_media_channel(&self, name: &str) -> Result<Arc<dyn MediaChannel>, TransportError>;

    /// Generate an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Generate an answer to the installed remote offer and install it locally
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &str, sdp_mid: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_connection(
        &self,
        config: &TransportConfig,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
