//! Per-peer session state
//!
//! A [`PeerSession`] owns one transport connection, its outgoing media channel
//! and the RTP counters of its outgoing stream. All mutable state sits behind a
//! single async mutex: sends, negotiation steps and close are serialized per
//! session, so a close can never interleave with a half-finished send.

use peercall_media::RtpStream;
use peercall_protocol::{PeerId, SdpType, SessionDescription};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::error::SessionError;
use crate::transport::{
    ConnectionState, MediaChannel, PeerTransport, TransportConfig, TransportEvents, TransportFactory,
};

/// Name of the outgoing audio channel on every connection
pub const MEDIA_CHANNEL_NAME: &str = "audio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    OfferSent,
    AnswerPending,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

impl SessionState {
    /// Still working towards a first connection
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            SessionState::Created
                | SessionState::OfferSent
                | SessionState::AnswerPending
                | SessionState::Negotiating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

struct SessionInner {
    role: NegotiationRole,
    state: SessionState,
    transport: Option<Box<dyn PeerTransport>>,
    media: Option<Arc<dyn MediaChannel>>,
    media_open: bool,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: Vec<(String, String)>,
    stream: RtpStream,
    /// Generation of the attached transport's event stream
    generation: Option<u64>,
    /// When the current offer/answer exchange began
    negotiation_started: Option<Instant>,
}

impl SessionInner {
    fn transport(&self, id: &PeerId) -> Result<&dyn PeerTransport, SessionError> {
        self.transport
            .as_deref()
            .ok_or_else(|| SessionError::NoTransport(id.clone()))
    }
}

pub struct PeerSession {
    id: PeerId,
    created_at: Instant,
    inner: Mutex<SessionInner>,
}

impl PeerSession {
    /// New session in `Created` with no transport and a random SSRC
    pub fn new(id: PeerId, payload_type: u8) -> Self {
        Self::with_stream(id, RtpStream::random(payload_type))
    }

    pub fn with_stream(id: PeerId, stream: RtpStream) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                role: NegotiationRole::Answerer,
                state: SessionState::Created,
                transport: None,
                media: None,
                media_open: false,
                local_description: None,
                remote_description: None,
                pending_candidates: Vec::new(),
                stream,
                generation: None,
                negotiation_started: None,
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn role(&self) -> NegotiationRole {
        self.inner.lock().await.role
    }

    pub async fn set_role(&self, role: NegotiationRole) {
        self.inner.lock().await.role = role;
    }

    pub async fn has_transport(&self) -> bool {
        self.inner.lock().await.transport.is_some()
    }

    pub async fn is_media_open(&self) -> bool {
        self.inner.lock().await.media_open
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().await.local_description.clone()
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().await.remote_description.clone()
    }

    pub async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    /// Generation tag of the attached transport, if any
    pub async fn transport_generation(&self) -> Option<u64> {
        self.inner.lock().await.generation
    }

    /// Whether events tagged with `generation` come from the attached transport
    pub async fn owns_transport(&self, generation: u64) -> bool {
        self.inner.lock().await.generation == Some(generation)
    }

    pub async fn negotiation_started(&self) -> Option<Instant> {
        self.inner.lock().await.negotiation_started
    }

    /// Snapshot of the outgoing stream counters
    pub async fn rtp_stream(&self) -> RtpStream {
        self.inner.lock().await.stream.clone()
    }

    /// Create the transport connection and its media channel.
    ///
    /// Returns `Ok(false)` when a transport already exists. On failure the
    /// session is left without a transport so a later call can retry.
    pub async fn attach_transport(
        &self,
        factory: &dyn TransportFactory,
        config: &TransportConfig,
        events: TransportEvents,
    ) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(SessionError::Closed(self.id.clone()));
        }
        if inner.transport.is_some() {
            return Ok(false);
        }

        let generation = events.generation();
        let transport = factory.create_connection(config, events).await?;
        let media = match transport.create_media_channel(MEDIA_CHANNEL_NAME).await {
            Ok(media) => media,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::debug!("Closing half-built transport for {} failed: {}", self.id, close_err);
                }
                return Err(e.into());
            }
        };

        inner.transport = Some(transport);
        inner.media = Some(media);
        inner.generation = Some(generation);
        Ok(true)
    }

    /// Generate a local offer; the session becomes the offerer
    pub async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let description = inner.transport(&self.id)?.create_offer().await?;
        inner.role = NegotiationRole::Offerer;
        inner.state = SessionState::OfferSent;
        inner.local_description = Some(description.clone());
        inner.negotiation_started = Some(Instant::now());
        Ok(description)
    }

    /// Generate a local answer to the applied remote offer
    pub async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let description = inner.transport(&self.id)?.create_answer().await?;
        inner.local_description = Some(description.clone());
        if inner.state.is_negotiating() {
            inner.state = SessionState::Negotiating;
        }
        Ok(description)
    }

    /// Apply the peer's description and flush candidates queued before it.
    ///
    /// An offer always makes this side the answerer, including a renegotiation
    /// on a session that was connected before.
    pub async fn apply_remote_description(&self, description: SessionDescription) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let sdp_type = description.sdp_type;
        inner
            .transport(&self.id)?
            .set_remote_description(description.clone())
            .await?;
        inner.remote_description = Some(description);

        match sdp_type {
            SdpType::Offer => {
                inner.role = NegotiationRole::Answerer;
                inner.state = SessionState::AnswerPending;
                inner.negotiation_started = Some(Instant::now());
            }
            SdpType::Answer if inner.state.is_negotiating() => inner.state = SessionState::Negotiating,
            SdpType::Answer => {}
        }

        let pending = std::mem::take(&mut inner.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!("Applying {} queued candidates for {}", pending.len(), self.id);
        }
        let transport = inner.transport(&self.id)?;
        for (candidate, sdp_mid) in pending {
            if let Err(e) = transport.add_remote_candidate(&candidate, &sdp_mid).await {
                tracing::warn!("Queued candidate for {} rejected: {}", self.id, e);
            }
        }
        Ok(())
    }

    /// Apply a remote candidate, or queue it while no remote description is set.
    ///
    /// Returns whether the candidate reached the transport.
    pub async fn add_remote_candidate(&self, candidate: &str, sdp_mid: &str) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        if inner.remote_description.is_none() {
            inner
                .pending_candidates
                .push((candidate.to_string(), sdp_mid.to_string()));
            return Ok(false);
        }

        inner
            .transport(&self.id)?
            .add_remote_candidate(candidate, sdp_mid)
            .await?;
        Ok(true)
    }

    /// Fold a transport connectivity report into the session state.
    ///
    /// Returns the new state when it changed.
    pub async fn on_connection_state(&self, state: ConnectionState) -> Option<SessionState> {
        let mut inner = self.inner.lock().await;
        let next = match (inner.state, state) {
            (SessionState::Closed, _) => return None,
            (_, ConnectionState::Connected) => SessionState::Connected,
            (_, ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed) => {
                inner.media_open = false;
                SessionState::Disconnected
            }
            (_, ConnectionState::New | ConnectionState::Connecting) => return None,
        };

        if inner.state == next {
            return None;
        }
        inner.state = next;
        Some(next)
    }

    pub async fn mark_media_open(&self) {
        let mut inner = self.inner.lock().await;
        if inner.media.is_some() && inner.state != SessionState::Closed {
            inner.media_open = true;
        }
    }

    /// Frame `payload` with this session's counters and send it.
    ///
    /// Counters only advance for frames that pass the state checks.
    pub async fn send_media(&self, payload: &[u8]) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Closed => return Err(SessionError::Closed(self.id.clone())),
            SessionState::Disconnected => return Err(SessionError::Disconnected(self.id.clone())),
            _ => {}
        }

        let media = match (&inner.media, inner.media_open) {
            (Some(media), true) => Arc::clone(media),
            _ => return Err(SessionError::MediaNotOpen(self.id.clone())),
        };

        let packet = inner.stream.next_frame(payload);
        media.send(packet).await?;
        Ok(())
    }

    /// Tear down the session; returns false if it was already closed
    pub async fn close(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return false;
        }

        inner.state = SessionState::Closed;
        inner.media = None;
        inner.media_open = false;
        inner.pending_candidates.clear();
        if let Some(transport) = inner.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Failed to close transport for {}: {}", self.id, e);
            }
        }
        tracing::info!("Session {} closed", self.id);
        true
    }

    /// Whether the current negotiation has run for `timeout` without connecting.
    ///
    /// Measured from the last offer sent or received, or from creation when no
    /// exchange has started yet.
    pub async fn is_negotiation_stalled(&self, now: Instant, timeout: Duration) -> bool {
        let inner = self.inner.lock().await;
        let started = inner.negotiation_started.unwrap_or(self.created_at);
        inner.state.is_negotiating() && now.saturating_duration_since(started) >= timeout
    }

    fn ensure_open(&self, inner: &SessionInner) -> Result<(), SessionError> {
        if inner.state == SessionState::Closed {
            return Err(SessionError::Closed(self.id.clone()));
        }
        Ok(())
    }
}

/// Sessions keyed by remote identity.
///
/// The map lock is only held to look up, insert or remove entries; per-session
/// work happens after the `Arc` is cloned out, under the session's own lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Existing session for `id`, or a freshly inserted one.
    ///
    /// The boolean is true when the session was created by this call.
    pub async fn get_or_create(&self, id: &PeerId, payload_type: u8) -> (Arc<PeerSession>, bool) {
        if let Some(session) = self.get(id).await {
            return (session, false);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            return (Arc::clone(session), false);
        }
        let session = Arc::new(PeerSession::new(id.clone(), payload_type));
        sessions.insert(id.clone(), Arc::clone(&session));
        (session, true)
    }

    pub async fn remove(&self, id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn drain(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.write().await.drain().map(|(_, session)| session).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
