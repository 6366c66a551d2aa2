//! Media processing utilities for peercall
//!
//! This crate provides the audio plumbing shared by call endpoints:
//! - Audio encoding/decoding (Opus) behind codec traits
//! - RTP framing of encoded packets and receive-side de-framing
//! - Bounded packet buffering between network and playback

pub mod audio;
pub mod codec;
pub mod queue;
pub mod rtp;

pub use audio::*;
pub use codec::{AudioDecode, AudioEncode, CodecError};
pub use queue::{OverflowPolicy, PacketQueue, PushOutcome};
pub use rtp::{RtpError, RtpHeader, RtpStream};
