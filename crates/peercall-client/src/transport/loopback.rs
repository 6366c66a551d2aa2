//! In-process transport for tests and local wiring
//!
//! Endpoints created through a shared [`LoopbackNetwork`] find each other by
//! identity. A link reports `Connected` once it holds a local description, a
//! remote description and at least one remote candidate, which is the same
//! point a real ICE agent could first succeed.

use async_trait::async_trait;
use bytes::Bytes;
use peercall_protocol::{PeerId, SdpType, SessionDescription};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    ConnectionState, MediaChannel, PeerTransport, TransportConfig, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::error::TransportError;

/// Directed link key: (local, remote)
type LinkKey = (PeerId, PeerId);

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<LinkKey, TransportEvents>,
    severed: HashSet<LinkKey>,
    delivered: HashMap<LinkKey, Vec<Bytes>>,
    fail_next: usize,
}

/// Shared medium all loopback endpoints attach to
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Factory producing endpoints that belong to `local`
    pub fn factory(&self, local: impl Into<PeerId>) -> LoopbackFactory {
        LoopbackFactory {
            local: local.into(),
            network: self.clone(),
        }
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connections(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Cut the link between two peers; both sides observe `Disconnected`
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.lock();
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(events) = state.endpoints.get(&key) {
                events.emit(TransportEvent::StateChange(ConnectionState::Disconnected));
            }
            state.severed.insert(key);
        }
    }

    /// Packets `from` has delivered to `to`, in send order
    pub fn delivered(&self, from: &PeerId, to: &PeerId) -> Vec<Bytes> {
        self.lock()
            .delivered
            .get(&(from.clone(), to.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, packet: Bytes) -> Result<(), TransportError> {
        let mut state = self.lock();
        let key = (from.clone(), to.clone());
        if state.severed.contains(&key) {
            return Err(TransportError::Closed);
        }

        let remote = state
            .endpoints
            .get(&(to.clone(), from.clone()))
            .cloned()
            .ok_or_else(|| TransportError::Other(format!("{} is not reachable", to)))?;

        state.delivered.entry(key).or_default().push(packet.clone());
        remote.emit(TransportEvent::MediaMessage(packet));
        Ok(())
    }
}

pub struct LoopbackFactory {
    local: PeerId,
    network: LoopbackNetwork,
}

impl LoopbackFactory {
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create_connection(
        &self,
        _config: &TransportConfig,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let remote = events.peer().clone();
        {
            let mut state = self.network.lock();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(TransportError::Other(format!(
                    "connection to {} refused",
                    remote
                )));
            }
            let key = (self.local.clone(), remote.clone());
            state.severed.remove(&key);
            state.endpoints.insert(key, events.clone());
        }

        tracing::debug!("Loopback endpoint {} -> {} created", self.local, remote);

        Ok(Box::new(LoopbackTransport {
            local: self.local.clone(),
            remote,
            network: self.network.clone(),
            events,
            link: Mutex::new(LinkState::default()),
        }))
    }
}

#[derive(Default)]
struct LinkState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_candidates: usize,
    connected: bool,
    closed: bool,
}

struct LoopbackTransport {
    local: PeerId,
    remote: PeerId,
    network: LoopbackNetwork,
    events: TransportEvents,
    link: Mutex<LinkState>,
}

impl LoopbackTransport {
    fn lock(&self) -> Result<MutexGuard<'_, LinkState>, TransportError> {
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if link.closed {
            return Err(TransportError::Closed);
        }
        Ok(link)
    }

    fn gather(&self) {
        self.events.emit(TransportEvent::LocalCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 loopback {} typ host", self.local),
            sdp_mid: "0".to_string(),
        });
        self.events.emit(TransportEvent::GatheringComplete);
    }

    fn check_connectivity(&self, link: &mut LinkState) {
        if link.connected
            || link.local_description.is_none()
            || link.remote_description.is_none()
            || link.remote_candidates == 0
        {
            return;
        }
        link.connected = true;
        self.events
            .emit(TransportEvent::StateChange(ConnectionState::Connecting));
        self.events
            .emit(TransportEvent::StateChange(ConnectionState::Connected));
        self.events.emit(TransportEvent::MediaChannelOpen);
    }

    fn describe(&self, sdp_type: SdpType) -> String {
        format!(
            "v=0\r\no=loopback 0 0 IN IP4 127.0.0.1\r\ns={} {} -> {}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            sdp_type, self.local, self.remote
        )
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_media_channel(&self, _name: &str) -> Result<Arc<dyn MediaChannel>, TransportError> {
        let _link = self.lock()?;
        Ok(Arc::new(LoopbackChannel {
            local: self.local.clone(),
            remote: self.remote.clone(),
            network: self.network.clone(),
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let description = SessionDescription::offer(self.describe(SdpType::Offer));
        {
            let mut link = self.lock()?;
            link.local_description = Some(description.clone());
        }
        self.gather();
        let mut link = self.lock()?;
        self.check_connectivity(&mut link);
        Ok(description)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let description = SessionDescription::answer(self.describe(SdpType::Answer));
        {
            let mut link = self.lock()?;
            match &link.remote_description {
                Some(remote) if remote.sdp_type == SdpType::Offer => {}
                _ => return Err(TransportError::NoRemoteOffer),
            }
            link.local_description = Some(description.clone());
        }
        self.gather();
        let mut link = self.lock()?;
        self.check_connectivity(&mut link);
        Ok(description)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let mut link = self.lock()?;
        link.remote_description = Some(description);
        self.check_connectivity(&mut link);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str, _sdp_mid: &str) -> Result<(), TransportError> {
        if candidate.is_empty() {
            return Err(TransportError::Other("empty candidate".to_string()));
        }
        let mut link = self.lock()?;
        link.remote_candidates += 1;
        self.check_connectivity(&mut link);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
            if link.closed {
                return Ok(());
            }
            link.closed = true;
        }

        let mut state = self.network.lock();
        state
            .endpoints
            .remove(&(self.local.clone(), self.remote.clone()));
        if let Some(remote) = state.endpoints.get(&(self.remote.clone(), self.local.clone())) {
            remote.emit(TransportEvent::StateChange(ConnectionState::Disconnected));
        }
        Ok(())
    }
}

struct LoopbackChannel {
    local: PeerId,
    remote: PeerId,
    network: LoopbackNetwork,
}

#[async_trait]
impl MediaChannel for LoopbackChannel {
    async fn send(&self, packet: Bytes) -> Result<(), TransportError> {
        self.network.deliver(&self.local, &self.remote, packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEventReceiver;
    use tokio::sync::mpsc;

    async fn endpoint(
        network: &LoopbackNetwork,
        local: &str,
        remote: &str,
    ) -> (Box<dyn PeerTransport>, TransportEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = network
            .factory(local)
            .create_connection(&TransportConfig::default(), TransportEvents::new(remote.into(), 1, tx))
            .await
            .unwrap();
        (transport, rx)
    }

    fn drain(rx: &mut TransportEventReceiver) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok((_, event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_connects_after_exchange() {
        let network = LoopbackNetwork::new();
        let (alice, mut alice_rx) = endpoint(&network, "alice", "bob").await;
        let (bob, mut bob_rx) = endpoint(&network, "bob", "alice").await;

        let offer = alice.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        bob.set_remote_description(offer).await.unwrap();
        let answer = bob.create_answer().await.unwrap();
        alice.set_remote_description(answer).await.unwrap();

        assert!(!drain(&mut alice_rx).contains(&TransportEvent::MediaChannelOpen));

        alice.add_remote_candidate("candidate:bob", "0").await.unwrap();
        bob.add_remote_candidate("candidate:alice", "0").await.unwrap();

        assert!(drain(&mut alice_rx).contains(&TransportEvent::StateChange(ConnectionState::Connected)));
        assert!(drain(&mut bob_rx).contains(&TransportEvent::MediaChannelOpen));
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let network = LoopbackNetwork::new();
        let (bob, _rx) = endpoint(&network, "bob", "alice").await;
        assert!(matches!(bob.create_answer().await, Err(TransportError::NoRemoteOffer)));
    }

    #[tokio::test]
    async fn test_media_reaches_remote_endpoint() {
        let network = LoopbackNetwork::new();
        let (alice, _alice_rx) = endpoint(&network, "alice", "bob").await;
        let (_bob, mut bob_rx) = endpoint(&network, "bob", "alice").await;

        let channel = alice.create_media_channel("audio").await.unwrap();
        channel.send(Bytes::from_static(b"frame")).await.unwrap();

        let (origin, event) = bob_rx.try_recv().unwrap();
        assert_eq!(origin.peer, PeerId::from("alice"));
        assert_eq!(event, TransportEvent::MediaMessage(Bytes::from_static(b"frame")));
        assert_eq!(network.delivered(&"alice".into(), &"bob".into()).len(), 1);
    }

    #[tokio::test]
    async fn test_close_notifies_remote_and_rejects_calls() {
        let network = LoopbackNetwork::new();
        let (alice, _alice_rx) = endpoint(&network, "alice", "bob").await;
        let (_bob, mut bob_rx) = endpoint(&network, "bob", "alice").await;

        alice.close().await.unwrap();
        alice.close().await.unwrap();

        assert_eq!(
            drain(&mut bob_rx),
            vec![TransportEvent::StateChange(ConnectionState::Disconnected)]
        );
        assert!(matches!(alice.create_offer().await, Err(TransportError::Closed)));
        assert_eq!(network.endpoint_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let network = LoopbackNetwork::new();
        network.fail_next_connections(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = network.factory("alice");

        let first = factory
            .create_connection(&TransportConfig::default(), TransportEvents::new("bob".into(), 1, tx.clone()))
            .await;
        assert!(first.is_err());

        let second = factory
            .create_connection(&TransportConfig::default(), TransportEvents::new("bob".into(), 2, tx))
            .await;
        assert!(second.is_ok());
    }
}
