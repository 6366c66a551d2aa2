use anyhow::Result;
use peercall_client::device::{AudioCapture, AudioPlayback, DeviceSink, MAX_BUFFERED_SAMPLES};
use peercall_client::transport::WebRtcFactory;
use peercall_client::{
    AudioPipeline, CallConfig, CallEvent, CallHandle, LogFormat, OrchestratorInputs, SessionOrchestrator,
    SignalingChannel,
};
use peercall_media::SAMPLE_RATE;
use peercall_protocol::PeerId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "peercall=debug,peercall_client=debug".into()),
    );

    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = CallConfig::load()?;
    init_tracing(config.log_format);

    tracing::info!("Starting peercall as {}", config.local_id);

    let local_id = PeerId::new(config.local_id.clone());
    let (signaling, signaling_rx) = SignalingChannel::connect(&config.relay_url, local_id).await?;

    let factory = Arc::new(WebRtcFactory::new()?);
    let (orchestrator, mut call_events) =
        SessionOrchestrator::new(signaling, factory, config.orchestrator_options());

    // Audio devices are optional; a call without them still negotiates
    let (_playback_device, sink) = match AudioPlayback::start(config.output_device.as_deref()) {
        Ok((device, sink)) => (Some(device), sink),
        Err(e) => {
            tracing::warn!("Audio playback unavailable: {}", e);
            (None, DeviceSink::new(MAX_BUFFERED_SAMPLES, SAMPLE_RATE))
        }
    };

    let AudioPipeline {
        capture,
        playback,
        feed,
        gate,
    } = AudioPipeline::opus(Box::new(sink), config.pipeline_options())?;
    let orchestrator = orchestrator.with_playback(feed).with_capture_gate(gate);
    tokio::spawn(playback.run());

    let (audio_tx, audio_rx) = mpsc::channel(100);
    let _capture_device = match AudioCapture::start(config.input_device.as_deref()) {
        Ok((device, pcm_rx)) => {
            tokio::spawn(capture.run(pcm_rx, audio_tx));
            Some(device)
        }
        Err(e) => {
            tracing::warn!("Audio capture unavailable: {}", e);
            None
        }
    };

    let (handle, commands) = CallHandle::new();
    if let Some(peer) = &config.call {
        handle.start_call(peer.as_str());
    }

    let orchestrator_task = tokio::spawn(orchestrator.run(OrchestratorInputs {
        signaling: signaling_rx,
        audio: audio_rx,
        commands,
    }));

    loop {
        tokio::select! {
            event = call_events.recv() => match event {
                Some(event) => log_call_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                handle.shutdown();
                break;
            }
        }
    }

    orchestrator_task.await?;
    Ok(())
}

fn log_call_event(event: &CallEvent) {
    match event {
        CallEvent::OfferReady { peer, .. } => tracing::info!("Offer sent to {}", peer),
        CallEvent::AnswerReady { peer, .. } => tracing::info!("Answer sent to {}", peer),
        CallEvent::Connected(peer) => tracing::info!("In call with {}", peer),
        CallEvent::Disconnected(peer) => tracing::warn!("Lost connection to {}", peer),
        CallEvent::Closed(peer) => tracing::info!("Call with {} ended", peer),
        CallEvent::NegotiationTimedOut(peer) => tracing::warn!("Could not reach {}", peer),
        CallEvent::SignalingLost => tracing::warn!("Signaling relay connection lost"),
    }
}
