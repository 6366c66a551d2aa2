//! WebSocket connection to the signaling relay

use futures_util::{SinkExt, StreamExt};
use peercall_protocol::{Envelope, PeerId, SessionDescription, SignalingMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::SignalingError;

/// Interval between WebSocket ping frames
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound signaling, already filtered to this endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    SdpReceived {
        from: PeerId,
        description: SessionDescription,
    },
    IceCandidateReceived {
        from: PeerId,
        candidate: String,
        sdp_mid: String,
    },
    /// The relay connection ended; no reconnection is attempted
    Disconnected,
}

pub type SignalingEventReceiver = mpsc::UnboundedReceiver<SignalingEvent>;

/// Outgoing half of a signaling connection.
///
/// Sends never block: messages are queued for a writer task that owns the
/// socket.
#[derive(Clone)]
pub struct SignalingChannel {
    local_id: PeerId,
    sender: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingChannel {
    /// Connect to the relay and announce `local_id`.
    ///
    /// The `register` message is written before any other traffic.
    pub async fn connect(url: &str, local_id: PeerId) -> Result<(Self, SignalingEventReceiver), SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let register = serde_json::to_string(&SignalingMessage::register(local_id.clone()))?;
        write.send(Message::Text(register.into())).await?;
        tracing::info!("Connected to signaling relay at {} as {}", url, local_id);

        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Outgoing messages and keepalive
        tokio::spawn(async move {
            let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
            loop {
                let frame = tokio::select! {
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        match serde_json::to_string(&msg) {
                            Ok(json) => Message::Text(json.into()),
                            Err(e) => {
                                tracing::error!("Failed to serialize signaling message: {}", e);
                                continue;
                            }
                        }
                    }
                    _ = keepalive.tick() => Message::Ping(Vec::new().into()),
                };

                if let Err(e) = write.send(frame).await {
                    tracing::error!("Failed to send signaling message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Incoming messages
        let reader_id = local_id.clone();
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = route_inbound(&reader_id, &text) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Signaling relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Signaling connection error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        Ok((Self { local_id, sender: tx }, event_rx))
    }

    /// Channel not bound to any socket; outgoing messages land on the returned receiver
    pub fn detached(local_id: PeerId) -> (Self, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (sender, rx) = mpsc::unbounded_channel();
        (Self { local_id, sender }, rx)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn send_sdp(&self, to: &PeerId, description: SessionDescription) -> Result<(), SignalingError> {
        tracing::debug!("Sending {} to {}", description.sdp_type, to);
        self.send(SignalingMessage::sdp(self.local_id.clone(), to.clone(), description))
    }

    pub fn send_ice_candidate(&self, to: &PeerId, candidate: String, sdp_mid: String) -> Result<(), SignalingError> {
        tracing::debug!("Sending ICE candidate to {}", to);
        self.send(SignalingMessage::candidate(
            self.local_id.clone(),
            to.clone(),
            candidate,
            sdp_mid,
        ))
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.sender.send(message).map_err(|_| SignalingError::Closed)
    }
}

/// Turn one relay text frame into an event for `local_id`.
///
/// Malformed frames, frames addressed to someone else and message types the
/// endpoint does not act on all yield `None`.
pub fn route_inbound(local_id: &PeerId, text: &str) -> Option<SignalingEvent> {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Dropping malformed signaling message: {}", e);
            return None;
        }
    };

    if !envelope.is_for(local_id) {
        tracing::debug!(
            "Ignoring {} message addressed to {}",
            envelope.kind,
            envelope.recipient().unwrap_or_default()
        );
        return None;
    }

    let message = match serde_json::from_str::<SignalingMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Dropping unsupported {:?} signaling message: {}", envelope.kind, e);
            return None;
        }
    };

    match message {
        SignalingMessage::Register { from } => {
            tracing::debug!("Peer {} registered with the relay", from);
            None
        }
        SignalingMessage::Sdp { from, sdp, .. } => Some(SignalingEvent::SdpReceived {
            from,
            description: sdp,
        }),
        SignalingMessage::Candidate {
            from,
            candidate,
            sdp_mid,
            ..
        } => Some(SignalingEvent::IceCandidateReceived {
            from,
            candidate,
            sdp_mid,
        }),
    }
}
