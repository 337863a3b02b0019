//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use vesper_core::{
    audio::drain::DrainConfig, AudioConfig, AudioInput, AudioOutput, AudioSubsystem, Conversation,
    ConversationConfig, Cue, Cues, ManualClock, Messenger, Result, VadDecision, VesperError,
    VoiceActivityDetector, WakeVerdict, WakeWordDetector,
};

pub const FRAME: usize = 480;
pub const GREETING_BYTES: usize = 64;
pub const FAREWELL_BYTES: usize = 96;

// ── Detectors ────────────────────────────────────────────────────────────────

/// Reports whatever `next` says; defaults to silence.
#[derive(Clone, Default)]
pub struct ScriptedVad {
    pub script: Arc<Mutex<VecDeque<VadDecision>>>,
    pub resets: Arc<AtomicUsize>,
}

impl ScriptedVad {
    pub fn push(&self, decision: VadDecision, frames: usize) {
        let mut script = self.script.lock();
        for _ in 0..frames {
            script.push_back(decision);
        }
    }
}

impl VoiceActivityDetector for ScriptedVad {
    fn classify(&mut self, _frame: &[i16]) -> VadDecision {
        self.script.lock().pop_front().unwrap_or(VadDecision::Silence)
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fires on the next frame after `arm()`.
#[derive(Clone, Default)]
pub struct ScriptedWake {
    pub armed: Arc<AtomicBool>,
}

impl ScriptedWake {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl WakeWordDetector for ScriptedWake {
    fn frame_len(&self) -> usize {
        FRAME
    }

    fn detect(&mut self, _frame: &[i16]) -> WakeVerdict {
        if self.armed.swap(false, Ordering::SeqCst) {
            WakeVerdict::Detected
        } else {
            WakeVerdict::NotDetected
        }
    }

    fn reset(&mut self) {}
}

// ── Messenger ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Connect,
    Disconnect,
    Text(String),
    Binary(usize),
    Ping,
}

#[derive(Clone)]
pub struct RecordingMessenger {
    pub log: Arc<Mutex<Vec<Sent>>>,
    pub connected: Arc<AtomicBool>,
    /// Binary sends that succeed before every later one fails.
    pub binary_budget: Arc<Mutex<Option<usize>>>,
}

impl RecordingMessenger {
    pub fn connected() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
            binary_budget: Arc::new(Mutex::new(None)),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn binaries(&self) -> Vec<usize> {
        self.log
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Binary(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Sent) -> usize {
        self.log.lock().iter().filter(|s| *s == wanted).count()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl Messenger for RecordingMessenger {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&mut self) -> Result<()> {
        self.log.lock().push(Sent::Connect);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.log.lock().push(Sent::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.log.lock().push(Sent::Text(text.to_string()));
        Ok(())
    }

    fn send_binary(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
        let mut budget = self.binary_budget.lock();
        if let Some(left) = budget.as_mut() {
            if *left == 0 {
                return Err(VesperError::Transport("send timed out".into()));
            }
            *left -= 1;
        }
        self.log.lock().push(Sent::Binary(data.len()));
        Ok(())
    }

    fn send_ping(&mut self) -> Result<()> {
        self.log.lock().push(Sent::Ping);
        Ok(())
    }
}

// ── Audio ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingOutput {
    pub buffers: Mutex<Vec<usize>>,
    pub stream_bytes: AtomicUsize,
    pub stops: AtomicUsize,
    /// While set, stream chunks block like a stalled device.
    pub held: AtomicBool,
}

impl RecordingOutput {
    pub fn buffers_of(&self, len: usize) -> usize {
        self.buffers.lock().iter().filter(|n| **n == len).count()
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

impl AudioOutput for RecordingOutput {
    fn play_buffer(&self, pcm: &[u8]) -> Result<()> {
        self.buffers.lock().push(pcm.len());
        Ok(())
    }

    fn play_stream_chunk(&self, pcm: &[u8]) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.held.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        self.stream_bytes.fetch_add(pcm.len(), Ordering::Relaxed);
        Ok(())
    }

    fn stop_output(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Hands out queued frames, then underruns.
#[derive(Clone, Default)]
pub struct ScriptedInput {
    pub frames: Arc<Mutex<VecDeque<Vec<i16>>>>,
}

impl ScriptedInput {
    pub fn push_frames(&self, count: usize) {
        let mut frames = self.frames.lock();
        for _ in 0..count {
            frames.push_back(vec![0; FRAME]);
        }
    }
}

impl AudioInput for ScriptedInput {
    fn capture_frame(&mut self, frame: &mut [i16]) -> Result<()> {
        match self.frames.lock().pop_front() {
            Some(f) => {
                frame.copy_from_slice(&f);
                Ok(())
            }
            None => Err(VesperError::CaptureUnderrun),
        }
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub fn fast_audio_config() -> AudioConfig {
    AudioConfig {
        stream_capacity: 64 * 1024,
        drain: DrainConfig {
            chunk_bytes: 1024,
            idle_poll: Duration::from_millis(1),
            inactive_poll: Duration::from_millis(1),
        },
        ..AudioConfig::default()
    }
}

pub fn cues() -> Cues {
    Cues {
        greeting: Some(Cue::from_pcm(vec![0; GREETING_BYTES])),
        farewell: Some(Cue::from_pcm(vec![0; FAREWELL_BYTES])),
    }
}

pub struct Harness {
    pub conversation: Conversation,
    pub messenger: RecordingMessenger,
    pub output: Arc<RecordingOutput>,
    pub vad: ScriptedVad,
    pub wake: ScriptedWake,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(config: ConversationConfig) -> Self {
        let messenger = RecordingMessenger::connected();
        let output = Arc::new(RecordingOutput::default());
        let vad = ScriptedVad::default();
        let wake = ScriptedWake::default();
        let clock = ManualClock::new();
        let audio = AudioSubsystem::new(fast_audio_config(), output.clone(), None)
            .expect("audio subsystem");
        let conversation = Conversation::new(
            config,
            audio,
            Box::new(messenger.clone()),
            Box::new(wake.clone()),
            Box::new(vad.clone()),
            cues(),
            Arc::new(clock.clone()),
        );
        Self {
            conversation,
            messenger,
            output,
            vad,
            wake,
            clock,
        }
    }

    /// Feed `count` frames, ticking after each like the control loop does.
    pub fn frames(&mut self, count: usize) {
        let frame = [0i16; FRAME];
        for _ in 0..count {
            self.conversation.process_frame(&frame);
            self.conversation.tick();
        }
    }

    pub fn wake_up(&mut self) {
        self.wake.arm();
        self.frames(1);
    }

    /// Speech followed by enough silence to end the utterance.
    pub fn utterance(&mut self, speech_frames: usize, silence_frames: usize) {
        self.vad.push(VadDecision::Speech, speech_frames);
        self.vad.push(VadDecision::Silence, silence_frames);
        self.frames(speech_frames + silence_frames);
    }

    /// Tick until `done` holds, allowing the real drain thread time to run.
    pub fn tick_until(&mut self, mut done: impl FnMut(&Conversation) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !done(&self.conversation) {
            assert!(Instant::now() < deadline, "condition not reached");
            self.conversation.tick();
            thread::sleep(Duration::from_millis(1));
        }
    }
}
