//! WebRTC transport built on webrtc-rs
//!
//! Each peer gets its own RTCPeerConnection carrying one Opus track. Outgoing
//! packets are already RTP framed, so the track is a TrackLocalStaticRTP that
//! forwards them as-is; inbound packets are re-marshalled to raw bytes before
//! they reach the pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use peercall_media::rtp::OPUS_PAYLOAD_TYPE;
use peercall_protocol::{SdpType, SessionDescription};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use super::{
    ConnectionState, MediaChannel, PeerTransport, TransportConfig, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::error::TransportError;

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Creates webrtc-rs peer connections sharing one API instance
pub struct WebRtcFactory {
    api: Arc<API>,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create_connection(
        &self,
        config: &TransportConfig,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(self.api.new_peer_connection(rtc_config).await?);

        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let events = ice_events.clone();
            Box::pin(async move {
                // None marks the end of gathering, reported separately
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        events.emit(TransportEvent::LocalCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid.unwrap_or_default(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate for {}: {}", events.peer(), e);
                    }
                }
            })
        }));

        let gathering_events = events.clone();
        peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            let events = gathering_events.clone();
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    events.emit(TransportEvent::GatheringComplete);
                }
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                events.emit(TransportEvent::StateChange(mapped));
                // Tracks carry media as soon as DTLS is up
                if mapped == ConnectionState::Connected {
                    events.emit(TransportEvent::MediaChannelOpen);
                }
            })
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            tracing::info!(
                "Remote track from {}: id {}, kind {:?}",
                track_events.peer(),
                track.id(),
                track.kind()
            );
            let events = track_events.clone();
            Box::pin(async move {
                tokio::spawn(read_remote_track(track, events));
            })
        }));

        tracing::info!("Created peer connection for {}", events.peer());

        Ok(Box::new(WebRtcTransport { peer_connection }))
    }
}

async fn read_remote_track(track: Arc<TrackRemote>, events: TransportEvents) {
    let mut packet_count = 0u64;
    loop {
        match track.read_rtp().await {
            Ok((rtp_packet, _attributes)) => {
                packet_count += 1;
                if packet_count % 500 == 1 {
                    tracing::debug!(
                        "Received RTP packet {} from {}, payload size: {}",
                        packet_count,
                        events.peer(),
                        rtp_packet.payload.len()
                    );
                }

                let packet = match rtp_packet.marshal() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("Failed to marshal RTP packet from {}: {}", events.peer(), e);
                        continue;
                    }
                };

                if !events.emit(TransportEvent::MediaMessage(packet)) {
                    break;
                }
            }
            Err(e) => {
                tracing::info!("Remote track from {} ended: {}", events.peer(), e);
                break;
            }
        }
    }
}

struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcTransport {
    async fn local_description(&self) -> Result<SessionDescription, TransportError> {
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| TransportError::Other("local description missing".to_string()))?;
        from_rtc(local)
    }
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(TransportError::Other(format!("unsupported description type {}", other))),
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_media_channel(&self, name: &str) -> Result<Arc<dyn MediaChannel>, TransportError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            name.to_string(),
            "peercall".to_string(),
        ));

        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for the interceptors to run
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        Ok(Arc::new(WebRtcMediaChannel { track }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.peer_connection.remote_description().await.is_none() {
            return Err(TransportError::NoRemoteOffer);
        }
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.peer_connection.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str, sdp_mid: &str) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: (!sdp_mid.is_empty()).then(|| sdp_mid.to_string()),
            ..Default::default()
        };
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

struct WebRtcMediaChannel {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl MediaChannel for WebRtcMediaChannel {
    async fn send(&self, packet: Bytes) -> Result<(), TransportError> {
        self.track.write(&packet).await?;
        Ok(())
    }
}
