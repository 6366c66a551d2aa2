//! Audio codec seams
//!
//! The pipeline talks to codecs through these traits so the Opus bindings can
//! be swapped for test doubles.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    Opus(#[from] opus::Error),

    #[error("Invalid frame size: {0} samples")]
    FrameSize(usize),

    #[error("Codec failure: {0}")]
    Other(String),
}

/// Audio encoder trait
pub trait AudioEncode: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
}

/// Audio decoder trait
pub trait AudioDecode: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError>;
}
