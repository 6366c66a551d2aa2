use opus::{Decoder as OpusDecoder, Encoder as OpusEncoder};

use crate::codec::{AudioDecode, AudioEncode, CodecError};

/// Audio sample rate used throughout the application (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Audio channels (mono)
pub const CHANNELS: usize = 1;

/// Frame size in samples (10ms at 48kHz = 480 samples)
pub const FRAME_SIZE: usize = 480;

/// Target encoder bitrate in bits per second
pub const BITRATE: i32 = 64_000;

/// Largest Opus packet we ever produce
pub const MAX_PACKET_SIZE: usize = 4000;

/// Opus audio encoder
pub struct AudioEncoder {
    encoder: OpusEncoder,
}

impl AudioEncoder {
    pub fn new() -> Result<Self, CodecError> {
        let mut encoder =
            OpusEncoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Audio)?;
        encoder.set_bitrate(opus::Bitrate::Bits(BITRATE))?;

        Ok(Self { encoder })
    }
}

impl AudioEncode for AudioEncoder {
    /// Encode one frame of PCM audio samples to Opus
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != FRAME_SIZE * CHANNELS {
            return Err(CodecError::FrameSize(pcm.len()));
        }
        let mut output = vec![0u8; MAX_PACKET_SIZE];
        let len = self.encoder.encode(pcm, &mut output)?;
        output.truncate(len);
        Ok(output)
    }
}

/// Opus audio decoder
pub struct AudioDecoder {
    decoder: OpusDecoder,
}

impl AudioDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = OpusDecoder::new(SAMPLE_RATE, opus::Channels::Mono)?;

        Ok(Self { decoder })
    }
}

impl AudioDecode for AudioDecoder {
    /// Decode Opus to PCM audio samples, at most one 10ms frame
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut output = vec![0i16; FRAME_SIZE * CHANNELS];
        let len = self.decoder.decode(packet, &mut output, false)?;
        output.truncate(len * CHANNELS);
        Ok(output)
    }
}

/// Re-blocks arbitrarily sized capture chunks into exact codec frames.
///
/// Opus only accepts fixed frame durations, while audio devices deliver
/// whatever their callback cadence produces.
pub struct FrameAssembler {
    pending: Vec<i16>,
    frame_size: usize,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_size * 2),
            frame_size: frame_size.max(1),
        }
    }

    /// Append samples and return every complete frame now available
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_size;
        let mut frames = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(self.frame_size) {
            frames.push(chunk.to_vec());
        }
        self.pending.drain(..complete * self.frame_size);
        frames
    }

    /// Samples waiting for the next complete frame
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(FRAME_SIZE * CHANNELS)
    }
}
