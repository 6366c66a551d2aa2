//! Session orchestrator
//!
//! Owns every [`PeerSession`] of the local endpoint and reacts to three event
//! sources: inbound signaling, transport events tagged with the peer they came
//! from, and encoded audio from the capture stage. [`SessionOrchestrator::run`]
//! multiplexes them in a single `select!` loop, so handlers never race each
//! other; the individual handlers are public so they can also be driven
//! step by step.

use bytes::Bytes;
use peercall_protocol::{PeerId, SdpType, SessionDescription};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::pipeline::{CaptureGate, PlaybackFeed};
use crate::session::{NegotiationRole, PeerSession, SessionRegistry, SessionState};
use crate::signaling::{SignalingChannel, SignalingEvent, SignalingEventReceiver};
use crate::transport::{
    TransportConfig, TransportEvent, TransportEventReceiver, TransportEventSender, TransportEvents,
    TransportFactory, TransportOrigin,
};

/// How often stalled negotiations are looked for
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Notifications for the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    OfferReady {
        peer: PeerId,
        description: SessionDescription,
    },
    AnswerReady {
        peer: PeerId,
        description: SessionDescription,
    },
    Connected(PeerId),
    Disconnected(PeerId),
    Closed(PeerId),
    NegotiationTimedOut(PeerId),
    /// The relay connection is gone; established sessions keep running
    SignalingLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartCall(PeerId),
    AddPeer(PeerId),
    ClosePeer(PeerId),
    Shutdown,
}

/// Cloneable handle for steering a running orchestrator
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CallHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn start_call(&self, peer: impl Into<PeerId>) -> bool {
        self.send(Command::StartCall(peer.into()))
    }

    pub fn add_peer(&self, peer: impl Into<PeerId>) -> bool {
        self.send(Command::AddPeer(peer.into()))
    }

    pub fn close_peer(&self, peer: impl Into<PeerId>) -> bool {
        self.send(Command::ClosePeer(peer.into()))
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// RTP payload type stamped on outgoing frames
    pub payload_type: u8,
    pub transport: TransportConfig,
    /// Close sessions that have not connected within this long
    pub negotiation_timeout: Option<Duration>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            payload_type: peercall_media::rtp::OPUS_PAYLOAD_TYPE,
            transport: TransportConfig::default(),
            negotiation_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Result of sending one encoded frame to every session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub sent: usize,
    /// Sessions that cannot carry media right now
    pub skipped: usize,
    pub failed: usize,
}

/// Event sources consumed by [`SessionOrchestrator::run`]
pub struct OrchestratorInputs {
    pub signaling: SignalingEventReceiver,
    pub audio: mpsc::Receiver<Bytes>,
    pub commands: mpsc::UnboundedReceiver<Command>,
}

pub struct SessionOrchestrator {
    signaling: SignalingChannel,
    factory: Arc<dyn TransportFactory>,
    options: OrchestratorOptions,
    sessions: SessionRegistry,
    transport_tx: TransportEventSender,
    transport_rx: TransportEventReceiver,
    /// Source of per-transport event generations
    generations: AtomicU64,
    events: mpsc::UnboundedSender<CallEvent>,
    playback: Option<PlaybackFeed>,
    capture: Option<CaptureGate>,
}

impl SessionOrchestrator {
    pub fn new(
        signaling: SignalingChannel,
        factory: Arc<dyn TransportFactory>,
        options: OrchestratorOptions,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let orchestrator = Self {
            signaling,
            factory,
            options,
            sessions: SessionRegistry::new(),
            transport_tx,
            transport_rx,
            generations: AtomicU64::new(1),
            events,
            playback: None,
            capture: None,
        };
        (orchestrator, events_rx)
    }

    /// Route inbound media into this playback queue
    pub fn with_playback(mut self, feed: PlaybackFeed) -> Self {
        self.playback = Some(feed);
        self
    }

    /// Gate to open when a call starts or a session connects
    pub fn with_capture_gate(mut self, gate: CaptureGate) -> Self {
        self.capture = Some(gate);
        self
    }

    pub fn local_id(&self) -> &PeerId {
        self.signaling.local_id()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub async fn session(&self, id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.get(id).await
    }

    async fn require(&self, id: &PeerId) -> Result<Arc<PeerSession>, SessionError> {
        self.sessions
            .get(id)
            .await
            .ok_or_else(|| SessionError::UnknownPeer(id.clone()))
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No listener for call events");
        }
    }

    fn start_capture(&self) {
        if let Some(gate) = &self.capture {
            gate.open();
        }
    }

    /// Create or reuse the session for `id` and make sure it has a transport.
    ///
    /// A failed transport creation leaves the session registered in `Created`;
    /// calling this again retries.
    pub async fn add_peer(&self, id: &PeerId) -> Result<Arc<PeerSession>, SessionError> {
        let (session, created) = self.sessions.get_or_create(id, self.options.payload_type).await;
        if created {
            tracing::info!("Created session for peer {}", id);
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let events = TransportEvents::new(id.clone(), generation, self.transport_tx.clone());
        match session
            .attach_transport(self.factory.as_ref(), &self.options.transport, events)
            .await
        {
            Ok(true) => tracing::debug!("Transport ready for peer {}", id),
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Failed to create transport for peer {}: {}", id, e);
                return Err(e);
            }
        }
        Ok(session)
    }

    /// Call `id`: become the offerer, send an offer and start capturing
    pub async fn start_call(&self, id: &PeerId) -> Result<SessionDescription, SessionError> {
        tracing::info!("Starting call with {}", id);
        let session = self.add_peer(id).await?;
        session.set_role(NegotiationRole::Offerer).await;

        let offer = self.generate_offer_sdp(id).await?;
        self.start_capture();
        Ok(offer)
    }

    pub async fn generate_offer_sdp(&self, id: &PeerId) -> Result<SessionDescription, SessionError> {
        let session = self.require(id).await?;
        let offer = session.create_offer().await?;
        self.signaling.send_sdp(id, offer.clone())?;
        self.emit(CallEvent::OfferReady {
            peer: id.clone(),
            description: offer.clone(),
        });
        Ok(offer)
    }

    pub async fn generate_answer_sdp(&self, id: &PeerId) -> Result<SessionDescription, SessionError> {
        let session = self.require(id).await?;
        let answer = session.create_answer().await?;
        self.signaling.send_sdp(id, answer.clone())?;
        self.emit(CallEvent::AnswerReady {
            peer: id.clone(),
            description: answer.clone(),
        });
        Ok(answer)
    }

    /// Apply a remote description, answering it when it is an offer
    pub async fn on_sdp_received(&self, from: &PeerId, description: SessionDescription) -> Result<(), SessionError> {
        tracing::debug!("Received {} from {}", description.sdp_type, from);

        if description.sdp_type == SdpType::Offer {
            if let Some(existing) = self.sessions.get(from).await {
                if existing.role().await == NegotiationRole::Offerer
                    && existing.state().await == SessionState::OfferSent
                {
                    tracing::warn!("Ignoring offer from {} while our own offer is outstanding", from);
                    return Ok(());
                }
            }
        }

        let session = self.add_peer(from).await?;
        let sdp_type = description.sdp_type;
        session.apply_remote_description(description).await?;

        if sdp_type == SdpType::Offer && session.role().await == NegotiationRole::Answerer {
            self.generate_answer_sdp(from).await?;
        }
        Ok(())
    }

    /// Hand a remote candidate to its session; unknown peers are rejected
    pub async fn on_ice_candidate_received(
        &self,
        from: &PeerId,
        candidate: &str,
        sdp_mid: &str,
    ) -> Result<(), SessionError> {
        let session = self.require(from).await?;
        if !session.add_remote_candidate(candidate, sdp_mid).await? {
            tracing::debug!("Queued ICE candidate from {} until its description arrives", from);
        }
        Ok(())
    }

    /// Dispatch one signaling event; returns false once signaling is gone
    pub async fn handle_signaling_event(&self, event: SignalingEvent) -> bool {
        match event {
            SignalingEvent::SdpReceived { from, description } => {
                if let Err(e) = self.on_sdp_received(&from, description).await {
                    tracing::error!("Failed to handle description from {}: {}", from, e);
                }
            }
            SignalingEvent::IceCandidateReceived {
                from,
                candidate,
                sdp_mid,
            } => {
                if let Err(e) = self.on_ice_candidate_received(&from, &candidate, &sdp_mid).await {
                    tracing::warn!("Dropping ICE candidate from {}: {}", from, e);
                }
            }
            SignalingEvent::Disconnected => {
                tracing::warn!("Lost connection to the signaling relay");
                self.emit(CallEvent::SignalingLost);
                return false;
            }
        }
        true
    }

    /// Dispatch one transport event; events from a transport the session no
    /// longer owns are dropped
    pub async fn handle_transport_event(&self, origin: TransportOrigin, event: TransportEvent) {
        let TransportOrigin { peer, generation } = origin;
        let Some(session) = self.sessions.get(&peer).await else {
            tracing::debug!("Dropping transport event for unknown peer {}: {:?}", peer, event);
            return;
        };
        if !session.owns_transport(generation).await {
            tracing::debug!(
                "Dropping event from replaced transport {} of {}: {:?}",
                generation,
                peer,
                event
            );
            return;
        }

        match event {
            TransportEvent::LocalCandidate { candidate, sdp_mid } => {
                if let Err(e) = self.signaling.send_ice_candidate(&peer, candidate, sdp_mid) {
                    tracing::warn!("Failed to signal ICE candidate to {}: {}", peer, e);
                }
            }
            TransportEvent::GatheringComplete => {
                tracing::debug!("ICE gathering complete for {}", peer);
            }
            TransportEvent::StateChange(state) => {
                tracing::debug!("Connection to {} is {:?}", peer, state);
                match session.on_connection_state(state).await {
                    Some(SessionState::Connected) => {
                        tracing::info!("Connected to {}", peer);
                        self.start_capture();
                        self.emit(CallEvent::Connected(peer));
                    }
                    Some(SessionState::Disconnected) => {
                        tracing::info!("Disconnected from {}", peer);
                        self.emit(CallEvent::Disconnected(peer));
                    }
                    _ => {}
                }
            }
            TransportEvent::MediaChannelOpen => {
                tracing::debug!("Media channel to {} is open", peer);
                session.mark_media_open().await;
            }
            TransportEvent::MediaMessage(packet) => match &self.playback {
                Some(feed) => {
                    feed.push(packet);
                }
                None => tracing::trace!("No playback attached, dropping packet from {}", peer),
            },
        }
    }

    /// Send one encoded frame to every session, each with its own framing
    pub async fn fan_out(&self, payload: &[u8]) -> FanOutReport {
        let mut report = FanOutReport::default();
        for session in self.sessions.snapshot().await {
            match session.send_media(payload).await {
                Ok(()) => report.sent += 1,
                Err(
                    e @ (SessionError::MediaNotOpen(_)
                    | SessionError::Disconnected(_)
                    | SessionError::Closed(_)),
                ) => {
                    tracing::trace!("Skipping {}: {}", session.id(), e);
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to send audio to {}: {}", session.id(), e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Close and forget the session for `id`
    pub async fn close_peer(&self, id: &PeerId) -> bool {
        let Some(session) = self.sessions.remove(id).await else {
            return false;
        };
        session.close().await;
        self.emit(CallEvent::Closed(id.clone()));
        true
    }

    /// Close every session still negotiating after the configured timeout
    pub async fn sweep_stalled(&self, now: Instant) -> Vec<PeerId> {
        let Some(timeout) = self.options.negotiation_timeout else {
            return Vec::new();
        };

        let mut timed_out = Vec::new();
        for session in self.sessions.snapshot().await {
            if session.is_negotiation_stalled(now, timeout).await {
                let id = session.id().clone();
                tracing::warn!("Negotiation with {} timed out after {:?}", id, timeout);
                self.emit(CallEvent::NegotiationTimedOut(id.clone()));
                self.close_peer(&id).await;
                timed_out.push(id);
            }
        }
        timed_out
    }

    /// Handle transport events already queued, without waiting for more
    pub async fn pump_transport_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((origin, event)) = self.transport_rx.try_recv() {
            self.handle_transport_event(origin, event).await;
            handled += 1;
        }
        handled
    }

    /// Execute a host command; returns false for shutdown
    pub async fn handle_command(&self, command: Command) -> bool {
        match command {
            Command::StartCall(peer) => {
                if let Err(e) = self.start_call(&peer).await {
                    tracing::error!("Failed to start call with {}: {}", peer, e);
                }
            }
            Command::AddPeer(peer) => {
                // Failures are logged by add_peer
                let _ = self.add_peer(&peer).await;
            }
            Command::ClosePeer(peer) => {
                if !self.close_peer(&peer).await {
                    tracing::debug!("No session to close for {}", peer);
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Close every session and stop capture
    pub async fn shutdown(&self) {
        if let Some(gate) = &self.capture {
            gate.close();
        }
        for session in self.sessions.drain().await {
            if session.close().await {
                self.emit(CallEvent::Closed(session.id().clone()));
            }
        }
    }

    /// Drive the orchestrator until a shutdown command or until the command
    /// channel closes
    pub async fn run(mut self, inputs: OrchestratorInputs) {
        let OrchestratorInputs {
            mut signaling,
            mut audio,
            mut commands,
        } = inputs;
        let mut signaling_open = true;
        let mut audio_open = true;
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        tracing::info!("Session orchestrator running as {}", self.local_id());

        loop {
            tokio::select! {
                Some((origin, event)) = self.transport_rx.recv() => {
                    self.handle_transport_event(origin, event).await;
                }
                event = signaling.recv(), if signaling_open => match event {
                    Some(event) => signaling_open = self.handle_signaling_event(event).await,
                    None => {
                        signaling_open = false;
                        self.emit(CallEvent::SignalingLost);
                    }
                },
                packet = audio.recv(), if audio_open => match packet {
                    Some(packet) => {
                        self.fan_out(&packet).await;
                    }
                    None => {
                        tracing::debug!("Capture stream ended");
                        audio_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep_stalled(Instant::now()).await;
                }
            }
        }

        tracing::info!("Session orchestrator shutting down");
        self.shutdown().await;
    }
}
