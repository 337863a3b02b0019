//! Vesper appliance host.
//!
//! Loads settings, opens the websocket session, wires the energy detectors and
//! prompt cues into a [`VoiceEngine`], and runs until Ctrl-C.

mod settings;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use settings::{load_settings, settings_path};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use transport::{TransportConfig, WsMessenger};
use vesper_core::{
    Collaborators, Cue, Cues, EnergyVad, EnergyWakeTrigger, Messenger, VoiceEngine,
};

/// 30 ms at 16 kHz.
const WAKE_FRAME_SAMPLES: usize = 480;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vesper=info,vesper_core=info")),
        )
        .init();

    info!("Vesper starting");

    let path = settings_path();
    let mut settings = load_settings(&path);
    settings.apply_overrides(|key| std::env::var(key).ok());
    info!(
        settings_path = ?path,
        server_url = %settings.server_url,
        reply_mode = ?settings.reply_mode,
        "settings loaded"
    );

    let config = settings.engine_config();
    let sample_rate = config.audio.sample_rate;

    // ── Session ───────────────────────────────────────────────────────────
    let (mut messenger, inbound) = WsMessenger::new(
        settings.server_url.clone(),
        TransportConfig {
            connect_timeout: settings.connect_timeout(),
            ..TransportConfig::default()
        },
    );
    if let Err(e) = messenger.connect() {
        warn!("server unreachable, will retry on wake word: {e}");
    }

    let cues = Cues {
        greeting: settings
            .greeting_cue
            .as_deref()
            .and_then(|p| Cue::open_optional(p, sample_rate)),
        farewell: settings
            .farewell_cue
            .as_deref()
            .and_then(|p| Cue::open_optional(p, sample_rate)),
    };

    let collaborators = Collaborators {
        messenger: Box::new(messenger),
        inbound,
        wake: Box::new(EnergyWakeTrigger::new(
            WAKE_FRAME_SAMPLES,
            settings.wake_threshold,
            settings.wake_frames,
        )),
        vad: Box::new(EnergyVad::new(
            settings.vad_threshold,
            settings.vad_hangover_frames,
        )),
        suppressor: None,
        cues,
        echo: None,
    };

    // ── Engine ────────────────────────────────────────────────────────────
    let engine = Arc::new(VoiceEngine::new(config));
    spawn_event_logger(&engine);

    let starter = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || starter.start(collaborators))
        .await
        .context("engine start task panicked")?
        .context("failed to start the voice engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    engine.stop().context("failed to stop the voice engine")?;
    let diagnostics = engine.diagnostics_snapshot();
    info!(
        frames = diagnostics.control.frames_captured,
        capture_misses = diagnostics.control.capture_misses,
        chunks_drained = diagnostics.stream.chunks_drained,
        chunks_rejected = diagnostics.stream.chunks_rejected,
        output_errors = diagnostics.stream.output_errors,
        "Vesper stopped"
    );
    Ok(())
}

fn spawn_event_logger(engine: &VoiceEngine) {
    let mut states = engine.subscribe_state();
    tokio::spawn(async move {
        loop {
            match states.recv().await {
                Ok(event) => info!(
                    seq = event.seq,
                    from = ?event.from,
                    to = ?event.to,
                    detail = %event.detail,
                    "conversation"
                ),
                Err(RecvError::Lagged(n)) => warn!(missed = n, "conversation events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut status = engine.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            match event.detail {
                Some(detail) => warn!(status = ?event.status, %detail, "engine status"),
                None => info!(status = ?event.status, "engine status"),
            }
        }
    });
}
