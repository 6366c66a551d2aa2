//! Audio pipeline between devices, codec and the network
//!
//! Capture side: PCM chunks are re-blocked into codec frames, encoded and
//! handed to the orchestrator for fan-out. Playback side: packets arriving from
//! any peer are queued in a bounded FIFO, and a playback task drains it through
//! the decoder into the output sink.

use bytes::Bytes;
use peercall_media::rtp::strip_header;
use peercall_media::{
    AudioDecode, AudioDecoder, AudioEncode, AudioEncoder, CodecError, FrameAssembler, OverflowPolicy,
    PacketQueue, PushOutcome,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Audio output collaborator
pub trait AudioSink: Send {
    /// Write decoded samples, returning how many were accepted
    fn write(&mut self, pcm: &[i16]) -> usize;
}

/// How received packets are turned into codec input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveFraming {
    /// Remove the RTP header and padding before decoding
    #[default]
    StripRtpHeader,
    /// Hand the packet to the decoder untouched
    Raw,
}

/// Shared on/off switch for capture.
///
/// The device stream runs regardless; while the gate is closed captured
/// chunks are discarded before encoding.
#[derive(Debug, Clone, Default)]
pub struct CaptureGate(Arc<AtomicBool>);

impl CaptureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::info!("Audio capture started");
        }
    }

    pub fn close(&self) {
        if self.0.swap(false, Ordering::SeqCst) {
            tracing::info!("Audio capture stopped");
        }
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct CaptureStage {
    encoder: Box<dyn AudioEncode>,
    assembler: FrameAssembler,
    gate: CaptureGate,
}

impl CaptureStage {
    pub fn new(encoder: Box<dyn AudioEncode>, gate: CaptureGate) -> Self {
        Self {
            encoder,
            assembler: FrameAssembler::default(),
            gate,
        }
    }

    /// Encode every complete frame in `pcm`; failed frames are dropped
    pub fn process(&mut self, pcm: &[i16]) -> Vec<Bytes> {
        if !self.gate.is_open() {
            return Vec::new();
        }

        let mut packets = Vec::new();
        for frame in self.assembler.push(pcm) {
            match self.encoder.encode(&frame) {
                Ok(packet) => packets.push(Bytes::from(packet)),
                Err(e) => tracing::warn!("Dropping captured frame, encode failed: {}", e),
            }
        }
        packets
    }

    /// Encode chunks from the device until either side hangs up
    pub async fn run(mut self, mut pcm_rx: mpsc::Receiver<Vec<i16>>, packet_tx: mpsc::Sender<Bytes>) {
        while let Some(chunk) = pcm_rx.recv().await {
            for packet in self.process(&chunk) {
                if packet_tx.send(packet).await.is_err() {
                    tracing::debug!("Encoded packet receiver gone, stopping capture stage");
                    return;
                }
            }
        }
        tracing::debug!("Capture source ended");
    }
}

/// Network-side handle for queuing received packets
#[derive(Clone)]
pub struct PlaybackFeed {
    queue: Arc<PacketQueue<Bytes>>,
    wake: mpsc::Sender<()>,
}

impl PlaybackFeed {
    pub fn push(&self, packet: Bytes) -> PushOutcome {
        let outcome = self.queue.push(packet);
        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest => tracing::debug!(
                "Playback queue full, dropped oldest packet ({} dropped so far)",
                self.queue.dropped()
            ),
            PushOutcome::DroppedNewest => tracing::debug!(
                "Playback queue full, dropped incoming packet ({} dropped so far)",
                self.queue.dropped()
            ),
        }
        // A pending wake-up already covers this packet
        let _ = self.wake.try_send(());
        outcome
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Packets lost to overflow since the pipeline started
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Played(usize),
    ShortWrite { written: usize, decoded: usize },
    DecodeFailed,
}

pub struct PlaybackStage {
    decoder: Box<dyn AudioDecode>,
    sink: Box<dyn AudioSink>,
    queue: Arc<PacketQueue<Bytes>>,
    framing: ReceiveFraming,
    wake: mpsc::Receiver<()>,
}

impl PlaybackStage {
    /// Decode and play the oldest queued packet, if any
    pub fn drain_one(&mut self) -> Option<PlaybackOutcome> {
        let packet = self.queue.pop()?;

        let payload = match self.framing {
            ReceiveFraming::StripRtpHeader => match strip_header(packet) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Dropping malformed RTP packet: {}", e);
                    return Some(PlaybackOutcome::DecodeFailed);
                }
            },
            ReceiveFraming::Raw => packet,
        };

        let pcm = match self.decoder.decode(&payload) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!("Failed to decode audio packet: {}", e);
                return Some(PlaybackOutcome::DecodeFailed);
            }
        };

        let written = self.sink.write(&pcm);
        if written < pcm.len() {
            tracing::debug!("Short write to audio output: {} of {} samples", written, pcm.len());
            return Some(PlaybackOutcome::ShortWrite {
                written,
                decoded: pcm.len(),
            });
        }
        Some(PlaybackOutcome::Played(written))
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<PlaybackOutcome> {
        std::iter::from_fn(|| self.drain_one()).collect()
    }

    /// Play queued packets as they arrive; ends when every feed is dropped
    pub async fn run(mut self) {
        while self.wake.recv().await.is_some() {
            self.drain();
        }
        self.drain();
        tracing::debug!("Playback stage stopped");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub framing: ReceiveFraming,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            overflow: OverflowPolicy::DropOldest,
            framing: ReceiveFraming::StripRtpHeader,
        }
    }
}

/// Both halves of the pipeline plus the handles that connect them
pub struct AudioPipeline {
    pub capture: CaptureStage,
    pub playback: PlaybackStage,
    pub feed: PlaybackFeed,
    pub gate: CaptureGate,
}

impl AudioPipeline {
    pub fn new(
        encoder: Box<dyn AudioEncode>,
        decoder: Box<dyn AudioDecode>,
        sink: Box<dyn AudioSink>,
        options: PipelineOptions,
    ) -> Self {
        let gate = CaptureGate::new();
        let queue = Arc::new(PacketQueue::new(options.queue_capacity, options.overflow));
        let (wake_tx, wake_rx) = mpsc::channel(1);

        Self {
            capture: CaptureStage::new(encoder, gate.clone()),
            playback: PlaybackStage {
                decoder,
                sink,
                queue: Arc::clone(&queue),
                framing: options.framing,
                wake: wake_rx,
            },
            feed: PlaybackFeed { queue, wake: wake_tx },
            gate,
        }
    }

    /// Pipeline backed by the Opus codec
    pub fn opus(sink: Box<dyn AudioSink>, options: PipelineOptions) -> Result<Self, CodecError> {
        Ok(Self::new(
            Box::new(AudioEncoder::new()?),
            Box::new(AudioDecoder::new()?),
            sink,
            options,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peercall_media::{RtpStream, FRAME_SIZE};
    use std::sync::Mutex;

    /// Encodes a frame as its first sample's low byte
    struct TagEncoder {
        fail_next: bool,
    }

    impl AudioEncode for TagEncoder {
        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
            if std::mem::take(&mut self.fail_next) {
                return Err(CodecError::Other("injected".to_string()));
            }
            Ok(vec![pcm[0] as u8])
        }
    }

    /// Expands each byte to one sample; a 0xff first byte fails
    struct ByteDecoder;

    impl AudioDecode for ByteDecoder {
        fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
            if packet.first() == Some(&0xff) {
                return Err(CodecError::Other("corrupt".to_string()));
            }
            Ok(packet.iter().map(|b| *b as i16).collect())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        written: Arc<Mutex<Vec<Vec<i16>>>>,
        limit: Option<usize>,
    }

    impl AudioSink for RecordingSink {
        fn write(&mut self, pcm: &[i16]) -> usize {
            let accepted = self.limit.map_or(pcm.len(), |limit| limit.min(pcm.len()));
            self.written.lock().unwrap().push(pcm[..accepted].to_vec());
            accepted
        }
    }

    fn pipeline(sink: RecordingSink, framing: ReceiveFraming) -> AudioPipeline {
        AudioPipeline::new(
            Box::new(TagEncoder { fail_next: false }),
            Box::new(ByteDecoder),
            Box::new(sink),
            PipelineOptions {
                framing,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_closed_gate_discards_capture() {
        let mut pipeline = pipeline(RecordingSink::default(), ReceiveFraming::Raw);
        assert!(pipeline.capture.process(&[1; FRAME_SIZE]).is_empty());

        pipeline.gate.open();
        assert_eq!(pipeline.capture.process(&[1; FRAME_SIZE]).len(), 1);
    }

    #[test]
    fn test_capture_reblocks_into_frames() {
        let mut pipeline = pipeline(RecordingSink::default(), ReceiveFraming::Raw);
        pipeline.gate.open();

        assert!(pipeline.capture.process(&[3; 300]).is_empty());
        let packets = pipeline.capture.process(&[3; 700]);
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0][..], &[3]);
    }

    #[test]
    fn test_encode_failure_drops_only_that_frame() {
        let gate = CaptureGate::new();
        gate.open();
        let mut capture = CaptureStage::new(Box::new(TagEncoder { fail_next: true }), gate);

        let packets = capture.process(&[7; FRAME_SIZE * 2]);
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_decode_failure_does_not_block_later_packets() {
        let sink = RecordingSink::default();
        let mut pipeline = pipeline(sink.clone(), ReceiveFraming::Raw);

        pipeline.feed.push(Bytes::from_static(&[0xff, 1]));
        pipeline.feed.push(Bytes::from_static(&[4, 5]));

        assert_eq!(
            pipeline.playback.drain(),
            vec![PlaybackOutcome::DecodeFailed, PlaybackOutcome::Played(2)]
        );
        assert_eq!(*sink.written.lock().unwrap(), vec![vec![4, 5]]);
    }

    #[test]
    fn test_strip_framing_decodes_payload_only() {
        let sink = RecordingSink::default();
        let mut pipeline = pipeline(sink.clone(), ReceiveFraming::StripRtpHeader);
        let mut stream = RtpStream::new(9, 111);

        pipeline.feed.push(stream.next_frame(&[10, 20, 30]));
        pipeline.feed.push(Bytes::from_static(&[1, 2, 3]));

        assert_eq!(
            pipeline.playback.drain(),
            vec![PlaybackOutcome::Played(3), PlaybackOutcome::DecodeFailed]
        );
        assert_eq!(*sink.written.lock().unwrap(), vec![vec![10, 20, 30]]);
    }

    #[test]
    fn test_raw_framing_decodes_whole_packet() {
        let sink = RecordingSink::default();
        let mut pipeline = pipeline(sink.clone(), ReceiveFraming::Raw);
        let packet = RtpStream::new(9, 111).next_frame(&[10, 20]);

        pipeline.feed.push(packet.clone());

        assert_eq!(pipeline.playback.drain(), vec![PlaybackOutcome::Played(14)]);
        let written = sink.written.lock().unwrap();
        assert_eq!(written[0].len(), packet.len());
    }

    #[test]
    fn test_feed_overflow_counts_dropped_packets() {
        let sink = RecordingSink::default();
        let mut pipeline = AudioPipeline::new(
            Box::new(TagEncoder { fail_next: false }),
            Box::new(ByteDecoder),
            Box::new(sink.clone()),
            PipelineOptions {
                framing: ReceiveFraming::Raw,
                queue_capacity: 2,
                overflow: OverflowPolicy::DropNewest,
                ..Default::default()
            },
        );

        for byte in 1..=4u8 {
            pipeline.feed.push(Bytes::from(vec![byte]));
        }

        assert_eq!(pipeline.feed.queued(), 2);
        assert_eq!(pipeline.feed.dropped(), 2);
        pipeline.playback.drain();
        assert_eq!(*sink.written.lock().unwrap(), vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_short_write_is_reported() {
        let sink = RecordingSink {
            limit: Some(1),
            ..Default::default()
        };
        let mut pipeline = pipeline(sink, ReceiveFraming::Raw);
        pipeline.feed.push(Bytes::from_static(&[1, 2, 3]));

        assert_eq!(
            pipeline.playback.drain_one(),
            Some(PlaybackOutcome::ShortWrite {
                written: 1,
                decoded: 3
            })
        );
        assert_eq!(pipeline.playback.drain_one(), None);
    }

    #[tokio::test]
    async fn test_playback_task_drains_and_stops() {
        let sink = RecordingSink::default();
        let AudioPipeline { playback, feed, .. } = pipeline(sink.clone(), ReceiveFraming::Raw);

        let task = tokio::spawn(playback.run());
        feed.push(Bytes::from_static(&[1]));
        feed.push(Bytes::from_static(&[2]));
        drop(feed);
        task.await.unwrap();

        assert_eq!(*sink.written.lock().unwrap(), vec![vec![1], vec![2]]);
    }
}
