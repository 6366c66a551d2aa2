//! Audio devices via cpal
//!
//! Capture delivers 48 kHz mono i16 chunks through a channel; playback exposes
//! a [`DeviceSink`] the playback stage writes into, converted to the output
//! device's rate. The cpal streams are not `Send`, so the returned handles must
//! stay on the thread that created them.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use peercall_media::SAMPLE_RATE;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::pipeline::AudioSink;

/// Samples the playback buffer holds before writes come up short (~1s)
pub const MAX_BUFFERED_SAMPLES: usize = SAMPLE_RATE as usize;

/// Average interleaved frames down to one channel
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear resampling of a mono chunk from `from_rate` to `to_rate`
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

pub fn to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Convert decoded 48 kHz PCM to `output_rate`
pub fn to_output_rate(pcm: &[i16], output_rate: u32) -> Vec<i16> {
    if output_rate == SAMPLE_RATE {
        return pcm.to_vec();
    }
    let samples: Vec<f32> = pcm.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
    to_i16(&resample(&samples, SAMPLE_RATE, output_rate))
}

fn find_input(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow::anyhow!("Input device not found: {}", name)),
        None => host
            .default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No default input device")),
    }
}

fn find_output(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow::anyhow!("Output device not found: {}", name)),
        None => host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No default output device")),
    }
}

/// Running microphone stream; capture stops when dropped
pub struct AudioCapture {
    _stream: cpal::Stream,
}

impl AudioCapture {
    pub fn start(device_name: Option<&str>) -> Result<(Self, mpsc::Receiver<Vec<i16>>)> {
        let host = cpal::default_host();
        let device = find_input(&host, device_name)?;

        let config = device.default_input_config()?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;

        tracing::info!(
            "Starting audio capture on {}: {} Hz, {} channels",
            device.name().unwrap_or_default(),
            sample_rate,
            channels
        );
        if sample_rate != SAMPLE_RATE {
            tracing::warn!("Resampling capture from {} Hz to {} Hz", sample_rate, SAMPLE_RATE);
        }

        let (tx, rx) = mpsc::channel(100);

        let stream = device.build_input_stream(
            &config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                let pcm = to_i16(&resample(&mono, sample_rate, SAMPLE_RATE));
                // The encoder keeps up or the chunk is lost
                let _ = tx.try_send(pcm);
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )?;

        stream.play()?;
        Ok((Self { _stream: stream }, rx))
    }
}

/// Output buffer shared between the playback stage and the device callback.
///
/// Holds samples at the device rate; capacity is counted in those samples.
#[derive(Clone)]
pub struct DeviceSink {
    buffer: Arc<Mutex<VecDeque<i16>>>,
    capacity: usize,
    output_rate: u32,
}

impl DeviceSink {
    pub fn new(capacity: usize, output_rate: u32) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            output_rate,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take the next sample for the device, silence when starved
    fn next_sample(&self) -> i16 {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(0)
    }
}

impl AudioSink for DeviceSink {
    /// Returns the number of 48 kHz input samples whose output fit
    fn write(&mut self, pcm: &[i16]) -> usize {
        let converted = to_output_rate(pcm, self.output_rate);
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let accepted = self.capacity.saturating_sub(buffer.len()).min(converted.len());
        buffer.extend(&converted[..accepted]);

        if accepted == converted.len() {
            pcm.len()
        } else {
            accepted * pcm.len() / converted.len()
        }
    }
}

/// Running speaker stream; playback stops when dropped
pub struct AudioPlayback {
    _stream: cpal::Stream,
}

impl AudioPlayback {
    pub fn start(device_name: Option<&str>) -> Result<(Self, DeviceSink)> {
        let host = cpal::default_host();
        let device = find_output(&host, device_name)?;

        let config = device.default_output_config()?;
        let output_channels = config.channels() as usize;

        let output_rate = config.sample_rate().0;

        tracing::info!(
            "Starting audio playback on {}: {} Hz, {} channels",
            device.name().unwrap_or_default(),
            output_rate,
            output_channels
        );
        if output_rate != SAMPLE_RATE {
            tracing::warn!("Resampling playback from {} Hz to {} Hz", SAMPLE_RATE, output_rate);
        }

        // About one second of audio at the device rate
        let sink = DeviceSink::new(output_rate as usize, output_rate);
        let source = sink.clone();

        let stream = device.build_output_stream(
            &config.into(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Mono source duplicated to every output channel
                for frame in data.chunks_mut(output_channels.max(1)) {
                    let sample = source.next_sample() as f32 / i16::MAX as f32;
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )?;

        stream.play()?;
        Ok((Self { _stream: stream }, sink))
    }
}
