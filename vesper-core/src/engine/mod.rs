//! `VoiceEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceEngine::new()
//!     └─► start(collaborators)  → devices open, control loop spawned, status = Running
//!         └─► stop()            → running=false, devices dropped, status = Stopped
//! ```
//!
//! `start()`/`stop()` in the wrong state return an error rather than panicking.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread affinity).
//! Capture and playback streams are therefore created *inside* the
//! `spawn_blocking` closure so they never cross a thread boundary. A sync
//! oneshot channel propagates any open-device errors back to the `start()`
//! caller.

pub mod control;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{
    audio::{
        cue::Cues, playback::PlaybackStream, subsystem::AudioConfig, subsystem::AudioSubsystem,
        AudioInput, AudioOutput, DeviceInput, NoiseSuppressor,
    },
    buffering::{EchoSink, StreamDiagnosticsSnapshot, StreamingRingBuffer},
    clock::{Clock, SystemClock},
    conversation::{Conversation, ConversationConfig},
    error::{Result, VesperError},
    events::{ConversationEvent, EngineStatus, EngineStatusEvent},
    protocol::{InboundFrame, Messenger},
    vad::VoiceActivityDetector,
    wake::WakeWordDetector,
};
use control::{ControlContext, ControlDiagnostics, ControlDiagnosticsSnapshot, ControlPacing};

/// Broadcast channel capacity for slow event consumers.
const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub conversation: ConversationConfig,
    pub pacing: ControlPacing,
    /// Preferred capture device name; `None` uses the system default.
    pub input_device: Option<String>,
    /// Preferred playback device name; `None` uses the system default.
    pub output_device: Option<String>,
}

/// Everything outside the audio devices that the conversation talks to.
pub struct Collaborators {
    pub messenger: Box<dyn Messenger>,
    /// Frames produced by the messenger's reader.
    pub inbound: Receiver<InboundFrame>,
    pub wake: Box<dyn WakeWordDetector>,
    pub vad: Box<dyn VoiceActivityDetector>,
    pub suppressor: Option<Box<dyn NoiseSuppressor>>,
    pub cues: Cues,
    pub echo: Option<EchoSink>,
}

/// Audio endpoints opened on the control thread. `_stream` keeps the
/// `!Send` playback stream alive for as long as the loop runs.
struct OpenedIo {
    input: Box<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    _stream: Option<PlaybackStream>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineDiagnostics {
    pub control: ControlDiagnosticsSnapshot,
    pub stream: StreamDiagnosticsSnapshot,
}

/// The top-level engine handle. `Send + Sync`; share it behind an `Arc`.
pub struct VoiceEngine {
    config: EngineConfig,
    /// Run flag of the current (or last) control loop; replaced on every start.
    running: Mutex<Arc<AtomicBool>>,
    status: Arc<Mutex<EngineStatus>>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    state_tx: broadcast::Sender<ConversationEvent>,
    diagnostics: Arc<ControlDiagnostics>,
    stream: Arc<Mutex<Option<Arc<StreamingRingBuffer>>>>,
    clock: Arc<dyn Clock>,
}

impl VoiceEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            running: Mutex::new(Arc::new(AtomicBool::new(false))),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            status_tx,
            state_tx,
            diagnostics: Arc::new(ControlDiagnostics::default()),
            stream: Arc::new(Mutex::new(None)),
            clock,
        }
    }

    /// Open the default (or preferred) microphone and speaker, then run the
    /// conversation.
    ///
    /// Blocks until both devices are confirmed open (or fail), then returns.
    ///
    /// # Errors
    /// - `VesperError::AlreadyRunning` if already started.
    /// - device and allocation errors from opening the audio path.
    pub fn start(&self, collaborators: Collaborators) -> Result<()> {
        let input_device = self.config.input_device.clone();
        let output_device = self.config.output_device.clone();
        let sample_rate = self.config.audio.sample_rate;

        self.launch(collaborators, move || {
            let capture_gate = Arc::new(AtomicBool::new(true));
            let input = DeviceInput::open(input_device.as_deref(), sample_rate, capture_gate)?;
            let (stream, sink) = PlaybackStream::open(output_device.as_deref(), sample_rate)?;
            info!(
                capture_rate = input.device_rate(),
                playback_rate = stream.sample_rate,
                "audio devices open"
            );
            Ok(OpenedIo {
                input: Box::new(input),
                output: sink,
                _stream: Some(stream),
            })
        })
    }

    /// Run the conversation over caller-provided audio endpoints.
    pub fn start_with_io(
        &self,
        collaborators: Collaborators,
        input: Box<dyn AudioInput + Send>,
        output: Arc<dyn AudioOutput>,
    ) -> Result<()> {
        self.launch(collaborators, move || {
            Ok(OpenedIo {
                input,
                output,
                _stream: None,
            })
        })
    }

    fn launch<F>(&self, collaborators: Collaborators, open: F) -> Result<()>
    where
        F: FnOnce() -> Result<OpenedIo> + Send + 'static,
    {
        let running = {
            let mut slot = self.running.lock();
            if slot.load(Ordering::SeqCst) {
                return Err(VesperError::AlreadyRunning);
            }
            *slot = Arc::new(AtomicBool::new(true));
            Arc::clone(&slot)
        };
        self.diagnostics.reset();

        // Clone all Arc-wrapped state before moving into the closure.
        let config = self.config.clone();
        let loop_running = Arc::clone(&running);
        let state_tx = self.state_tx.clone();
        let diagnostics = Arc::clone(&self.diagnostics);
        let stream_slot = Arc::clone(&self.stream);
        let clock = Arc::clone(&self.clock);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        tokio::task::spawn_blocking(move || {
            let Collaborators {
                messenger,
                inbound,
                wake,
                vad,
                suppressor,
                cues,
                echo,
            } = collaborators;

            // ── Open audio (must happen on THIS thread — cpal::Stream is !Send) ──
            let opened = open().and_then(|io| {
                let audio = AudioSubsystem::new(config.audio.clone(), Arc::clone(&io.output), echo)?;
                Ok((io, audio))
            });
            let (io, audio) = match opened {
                Ok(v) => v,
                Err(e) => {
                    loop_running.store(false, Ordering::SeqCst);
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            *stream_slot.lock() = Some(audio.shared_stream());

            let conversation = Conversation::new(
                config.conversation.clone(),
                audio,
                messenger,
                wake,
                vad,
                cues,
                Arc::clone(&clock),
            )
            .with_events(state_tx);
            let _ = open_tx.send(Ok(()));

            let OpenedIo {
                input,
                output: _,
                _stream,
            } = io;
            let conversation = control::run(ControlContext {
                conversation,
                input,
                inbound,
                suppressor,
                running: loop_running,
                clock,
                pacing: config.pacing,
                diagnostics,
            });

            // Subsystem (and its drain thread) go first, then the devices, all on this thread.
            drop(conversation);
            drop(_stream);
        });

        match open_rx.recv() {
            Ok(Ok(())) => {
                self.set_status(EngineStatus::Running, None);
                info!("engine started — waiting for wake word");
                Ok(())
            }
            Ok(Err(e)) => {
                running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                error!("engine failed to start: {e}");
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some("control loop failed to start".into()));
                Err(VesperError::Other(anyhow::anyhow!(
                    "control task died unexpectedly"
                )))
            }
        }
    }

    /// # Errors
    /// - `VesperError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        let running = Arc::clone(&self.running.lock());
        if !running.swap(false, Ordering::SeqCst) {
            return Err(VesperError::NotRunning);
        }
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stop requested");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConversationEvent> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            control: self.diagnostics.snapshot(),
            stream: self
                .stream
                .lock()
                .as_ref()
                .map(|ring| ring.diagnostics().snapshot())
                .unwrap_or_default(),
        }
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}
