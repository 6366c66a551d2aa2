//! Peercall endpoint library
//!
//! This crate provides everything a call endpoint needs besides the codec:
//! signaling over the relay, per-peer sessions on top of a pluggable
//! transport, the audio pipeline and the orchestrator tying them together.

pub mod config;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{CallConfig, LogFormat};
pub use error::{SessionError, SignalingError, TransportError};
pub use orchestrator::{
    CallEvent, CallHandle, Command, FanOutReport, OrchestratorInputs, OrchestratorOptions, SessionOrchestrator,
};
pub use pipeline::{AudioPipeline, AudioSink, CaptureGate, PipelineOptions, PlaybackFeed, ReceiveFraming};
pub use session::{NegotiationRole, PeerSession, SessionRegistry, SessionState};
pub use signaling::{SignalingChannel, SignalingEvent};
