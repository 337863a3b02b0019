//! The conversation state machine.
//!
//! ## States
//!
//! ```text
//!            wake word                  silence after speech
//! WaitingWakeup ──────────► Recording ─────────────────────► WaitingResponse
//!      ▲                     ▲  │ ▲                               │
//!      │ dialog timeout      │  │ └── too short / empty reply ────┤
//!      └─────────────────────┼──┘                                 │ response_finished
//!      ▲                     │ drained + settle                   ▼
//!      │                     └──────────────────── PlaybackFinishedWaiting
//!      │ weather drained
//! PlayingWeatherReport ◄── play_weather (any state)
//! ```
//!
//! All flags live on [`Conversation`] and every change of state goes through
//! [`Conversation::transition`], which logs it and broadcasts a
//! [`ConversationEvent`].
//!
//! Three entry points are driven by the control loop: [`Conversation::process_frame`]
//! for each captured frame, [`Conversation::handle_inbound`] for each transport
//! frame, and [`Conversation::tick`] once per loop iteration for timers and
//! drain polling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{cue::Cues, subsystem::AudioSubsystem},
    buffering::pcm::samples_to_bytes,
    clock::Clock,
    events::ConversationEvent,
    protocol::{ClientEvent, InboundFrame, Messenger, ServerEvent},
    vad::VoiceActivityDetector,
    wake::WakeWordDetector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    WaitingWakeup,
    Recording,
    WaitingResponse,
    PlaybackFinishedWaiting,
    PlayingWeatherReport,
}

/// How reply audio arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// Binary frames are chunks of a stream played as they arrive.
    #[default]
    Streamed,
    /// One binary frame carries the whole reply; it plays on `response_finished`.
    Buffered,
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Consecutive silent frames after speech that end an utterance. Default: 20.
    pub silence_frames: u32,
    /// Shortest voiced span accepted as an utterance. Default: 250 ms.
    pub min_utterance: Duration,
    /// Audio replayed to the peer when speech is first detected. Default: 8000 samples.
    pub preroll_samples: usize,
    /// Largest binary frame sent upstream. Default: 1000 samples.
    pub max_send_samples: usize,
    /// Pause between pre-roll chunks. Default: 20 ms.
    pub preroll_pacing: Duration,
    pub send_timeout: Duration,
    /// Continuous-dialog inactivity timeout. Default: 10 s.
    pub recording_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Pause after playback drains before the microphone is trusted again.
    pub settle_delay: Duration,
    pub reconnect_settle: Duration,
    /// Pause while waiting for a reply on a dropped connection. Default: 1 s.
    pub disconnected_backoff: Duration,
    /// Pause while a reply is still draining. Default: 50 ms.
    pub drain_poll: Duration,
    pub reply_mode: ReplyMode,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            silence_frames: 20,
            min_utterance: Duration::from_millis(250),
            preroll_samples: 8_000,
            max_send_samples: 1_000,
            preroll_pacing: Duration::from_millis(20),
            send_timeout: Duration::from_millis(500),
            recording_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            reconnect_settle: Duration::from_millis(500),
            disconnected_backoff: Duration::from_secs(1),
            drain_poll: Duration::from_millis(50),
            reply_mode: ReplyMode::Streamed,
        }
    }
}

pub struct Conversation {
    config: ConversationConfig,
    audio: AudioSubsystem,
    messenger: Box<dyn Messenger>,
    wake: Box<dyn WakeWordDetector>,
    vad: Box<dyn VoiceActivityDetector>,
    cues: Cues,
    clock: Arc<dyn Clock>,
    events: Option<broadcast::Sender<ConversationEvent>>,
    seq: u64,

    state: ConversationState,
    /// Speech seen since the last recording restart.
    speech_latched: bool,
    silence_frames: u32,
    user_started: bool,
    continuous: bool,
    recording_deadline: Option<Instant>,
    realtime_streaming: bool,
    weather: bool,
    weather_source: String,
    weather_stream_started: bool,
    /// Weather audio that arrived while the previous reply was still draining.
    held_weather: Vec<Vec<u8>>,
    held_weather_bytes: usize,
    weather_finish_pending: bool,
    /// Accumulator offsets bounding the voiced span of this turn.
    voiced_start: Option<usize>,
    voiced_end: usize,
    last_ping: Option<Instant>,
}

impl Conversation {
    pub fn new(
        config: ConversationConfig,
        audio: AudioSubsystem,
        messenger: Box<dyn Messenger>,
        wake: Box<dyn WakeWordDetector>,
        vad: Box<dyn VoiceActivityDetector>,
        cues: Cues,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            audio,
            messenger,
            wake,
            vad,
            cues,
            clock,
            events: None,
            seq: 0,
            state: ConversationState::WaitingWakeup,
            speech_latched: false,
            silence_frames: 0,
            user_started: false,
            continuous: false,
            recording_deadline: None,
            realtime_streaming: false,
            weather: false,
            weather_source: String::new(),
            weather_stream_started: false,
            held_weather: Vec::new(),
            held_weather_bytes: 0,
            weather_finish_pending: false,
            voiced_start: None,
            voiced_end: 0,
            last_ping: None,
        }
    }

    /// Broadcast every state change on `tx`.
    pub fn with_events(mut self, tx: broadcast::Sender<ConversationEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Trigger-source id of the current weather announcement (empty when none).
    pub fn weather_source(&self) -> &str {
        &self.weather_source
    }

    pub fn is_weather_report(&self) -> bool {
        self.weather
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn is_realtime_streaming(&self) -> bool {
        self.realtime_streaming
    }

    pub fn audio(&self) -> &AudioSubsystem {
        &self.audio
    }

    /// Samples a frame must carry; the wake detector dictates it.
    pub fn frame_len(&self) -> usize {
        self.wake.frame_len()
    }

    // ── Captured frames ──────────────────────────────────────────────────────

    pub fn process_frame(&mut self, frame: &[i16]) {
        match self.state {
            ConversationState::WaitingWakeup => {
                if self.wake.detect(frame).is_detected() {
                    self.on_wake();
                }
            }
            ConversationState::Recording => self.record_frame(frame),
            _ => {}
        }
    }

    fn on_wake(&mut self) {
        info!("wake word detected");
        if !self.messenger.is_connected() {
            info!("session down, reconnecting");
            if let Err(e) = self.messenger.connect() {
                warn!("reconnect failed: {e}");
            }
            self.clock.sleep(self.config.reconnect_settle);
        }
        self.send_event(ClientEvent::RecordingStarted);
        self.play_cue(self.cues.greeting.clone(), "greeting");

        self.audio.start_recording();
        self.continuous = false;
        self.recording_deadline = None;
        self.reset_turn();
        self.transition(ConversationState::Recording, "wake word");
    }

    fn record_frame(&mut self, frame: &[i16]) {
        let recording = self.audio.recording();
        if !recording.is_recording() {
            return;
        }
        if recording.is_full() || !self.audio.append_recording(frame) {
            self.finish_full_recording();
            return;
        }

        if self.realtime_streaming && self.messenger.is_connected() {
            self.stream_live(frame);
        }

        if self.vad.classify(frame).is_speech() {
            let len = self.audio.recording().len();
            self.voiced_start.get_or_insert(len - frame.len());
            self.voiced_end = len;
            self.speech_latched = true;
            self.silence_frames = 0;
            self.user_started = true;
            self.recording_deadline = None;

            if !self.realtime_streaming {
                self.realtime_streaming = true;
                info!("speech detected, sending pre-roll and streaming live");
                self.send_preroll();
            }
        } else if self.speech_latched {
            self.silence_frames += 1;
            if self.silence_frames >= self.config.silence_frames {
                self.end_utterance();
            }
        }
    }

    fn voiced_samples(&self) -> usize {
        self.voiced_start
            .map(|start| self.voiced_end.saturating_sub(start))
            .unwrap_or(0)
    }

    fn min_utterance_samples(&self) -> usize {
        let rate = self.audio.config().sample_rate as u128;
        (rate * self.config.min_utterance.as_millis() / 1000) as usize
    }

    fn end_utterance(&mut self) {
        self.audio.stop_recording();
        self.realtime_streaming = false;
        let voiced = self.voiced_samples();
        info!(
            voiced_samples = voiced,
            recorded_secs = self.audio.recording().duration_secs(),
            "end of speech"
        );

        if self.user_started && voiced > self.min_utterance_samples() {
            self.send_event(ClientEvent::RecordingEnded);
            self.audio.reset_reply_played();
            self.audio.clear_reply();
            self.transition(ConversationState::WaitingResponse, "utterance complete");
            return;
        }

        info!("utterance too short, recording again");
        self.send_event(ClientEvent::RecordingCancelled);
        self.audio.clear_recording();
        self.audio.start_recording();
        self.reset_turn();
        self.realtime_streaming = !self.continuous;
        if self.continuous {
            self.recording_deadline = Some(self.clock.now() + self.config.recording_timeout);
        }
        self.transition(ConversationState::Recording, "utterance too short");
    }

    fn finish_full_recording(&mut self) {
        warn!(
            samples = self.audio.recording().len(),
            "recording buffer full, ending utterance"
        );
        self.audio.stop_recording();
        self.realtime_streaming = false;
        self.send_event(ClientEvent::RecordingEnded);
        self.audio.reset_reply_played();
        self.audio.clear_reply();
        self.transition(ConversationState::WaitingResponse, "recording buffer full");
    }

    /// Replay up to `preroll_samples` of already-recorded audio. The first
    /// send failure abandons the rest.
    fn send_preroll(&mut self) {
        if !self.messenger.is_connected() {
            return;
        }
        let samples = self.audio.recording().snapshot();
        let start = samples.len().saturating_sub(self.config.preroll_samples);
        let preroll = &samples[start..];
        let total = preroll.len();
        let mut sent = 0;

        for chunk in preroll.chunks(self.config.max_send_samples.max(1)) {
            if !self.messenger.is_connected() {
                break;
            }
            let bytes = samples_to_bytes(chunk);
            if let Err(e) = self.messenger.send_binary(&bytes, self.config.send_timeout) {
                warn!(sent, total, "pre-roll send failed, abandoning the rest: {e}");
                return;
            }
            sent += chunk.len();
            if sent < total && self.messenger.is_connected() {
                self.clock.sleep(self.config.preroll_pacing);
            }
        }
        info!(sent, total, "pre-roll sent");
    }

    fn stream_live(&mut self, frame: &[i16]) {
        for chunk in frame.chunks(self.config.max_send_samples.max(1)) {
            let bytes = samples_to_bytes(chunk);
            if let Err(e) = self.messenger.send_binary(&bytes, self.config.send_timeout) {
                debug!(samples = chunk.len(), "live frame send failed: {e}");
                return;
            }
        }
    }

    // ── Inbound transport frames ─────────────────────────────────────────────

    pub fn handle_inbound(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Binary(data) => self.on_reply_audio(&data),
            InboundFrame::Text(text) => {
                debug!(text = text.as_str(), "text frame");
                self.on_server_event(ServerEvent::parse(&text));
            }
            InboundFrame::Connected => info!("session connected"),
            InboundFrame::Disconnected => warn!("session disconnected"),
            InboundFrame::Error(e) => warn!("transport error: {e}"),
        }
    }

    fn on_reply_audio(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self.state {
            ConversationState::WaitingResponse
                if self.config.reply_mode == ReplyMode::Buffered =>
            {
                self.audio.receive_reply(data);
            }
            ConversationState::WaitingResponse => {
                self.ensure_streaming();
                self.write_stream(data);
            }
            ConversationState::PlayingWeatherReport => self.on_weather_audio(data),
            _ => debug!(bytes = data.len(), state = ?self.state, "reply audio ignored"),
        }
    }

    fn ensure_streaming(&mut self) {
        if !self.audio.is_streaming_active() {
            info!("reply audio arriving, streaming playback");
            self.audio.begin_streaming();
        }
    }

    fn write_stream(&mut self, data: &[u8]) -> bool {
        let written = self.audio.write_stream_chunk(data);
        if !written {
            warn!(bytes = data.len(), "streaming buffer full, chunk dropped");
        }
        written
    }

    /// A closed stream refuses input, so weather audio arriving behind a
    /// finishing reply waits for that reply to drain.
    fn on_weather_audio(&mut self, data: &[u8]) {
        if !self.held_weather.is_empty() && !self.audio.is_streaming_active() {
            self.release_held_weather();
        }
        if !self.held_weather.is_empty() || self.audio.is_stream_finishing() {
            self.hold_weather(data);
            return;
        }
        self.ensure_streaming();
        if self.write_stream(data) {
            self.weather_stream_started = true;
        }
    }

    fn hold_weather(&mut self, data: &[u8]) {
        let limit = self.audio.config().stream_capacity;
        if self.held_weather_bytes + data.len() > limit {
            warn!(
                bytes = data.len(),
                held = self.held_weather_bytes,
                "weather hold full, chunk dropped"
            );
            return;
        }
        debug!(bytes = data.len(), "previous reply still draining, weather audio held");
        self.held_weather_bytes += data.len();
        self.held_weather.push(data.to_vec());
    }

    fn release_held_weather(&mut self) {
        let held = std::mem::take(&mut self.held_weather);
        info!(
            chunks = held.len(),
            bytes = self.held_weather_bytes,
            "previous reply drained, playing held weather audio"
        );
        self.held_weather_bytes = 0;
        self.audio.begin_streaming();
        for chunk in &held {
            if self.write_stream(chunk) {
                self.weather_stream_started = true;
            }
        }
        if self.weather_finish_pending {
            self.audio.finish_streaming();
        }
    }

    fn clear_held_weather(&mut self) {
        self.held_weather.clear();
        self.held_weather_bytes = 0;
        self.weather_finish_pending = false;
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ResponseFinished => self.on_response_finished(),
            ServerEvent::Ping => debug!("server ping"),
            ServerEvent::Error => {
                error!(state = ?self.state, "server reported an error");
                if self.state == ConversationState::WaitingResponse {
                    self.restart_recording("server error");
                }
            }
            ServerEvent::PlayWeather { triggered_by } => {
                info!(triggered_by = triggered_by.as_str(), "weather announcement pushed");
                self.weather_source = triggered_by;
                if self.audio.recording().is_recording() {
                    self.audio.stop_recording();
                }
                self.audio.clear_recording();
                self.realtime_streaming = false;
                self.weather = true;
                self.weather_stream_started = false;
                self.clear_held_weather();
                self.transition(ConversationState::PlayingWeatherReport, "weather push");
            }
            ServerEvent::Unknown => debug!("unrecognised text event"),
        }
    }

    fn on_response_finished(&mut self) {
        if self.state == ConversationState::WaitingResponse
            && self.config.reply_mode == ReplyMode::Buffered
        {
            self.play_buffered_reply();
            return;
        }

        match self.state {
            ConversationState::WaitingResponse if self.audio.is_streaming_active() => {
                info!("reply complete, draining remainder");
                self.audio.finish_streaming();
                self.transition(ConversationState::PlaybackFinishedWaiting, "response finished");
            }
            ConversationState::WaitingResponse => {
                warn!("response finished without audio");
                self.restart_recording("empty reply");
            }
            ConversationState::PlayingWeatherReport => self.on_weather_finished(),
            _ => {}
        }
    }

    fn on_weather_finished(&mut self) {
        if !self.held_weather.is_empty() {
            info!("weather audio received, held until the previous reply drains");
            self.weather_finish_pending = true;
        } else if self.audio.is_streaming_active() {
            info!("weather audio received, waiting for playback");
            self.audio.finish_streaming();
            self.weather_finish_pending = true;
        } else {
            warn!("weather announcement without audio");
            self.transition(ConversationState::WaitingWakeup, "empty weather report");
        }
    }

    fn play_buffered_reply(&mut self) {
        if !self.audio.has_reply() {
            warn!("response finished without audio");
            self.restart_recording("empty reply");
            return;
        }
        let clock = Arc::clone(&self.clock);
        if let Err(e) = self.audio.play_reply(|backoff| clock.sleep(backoff)) {
            error!("reply playback failed: {e}");
            self.restart_recording("reply playback failed");
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Called once per control-loop iteration.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        match self.state {
            ConversationState::Recording => {
                let expired = self.recording_deadline.is_some_and(|d| now >= d);
                if self.continuous && !self.user_started && expired {
                    warn!(
                        timeout_secs = self.config.recording_timeout.as_secs(),
                        "no speech in continuous dialog, leaving"
                    );
                    self.exit_dialog();
                }
            }
            ConversationState::WaitingResponse => {
                if !self.messenger.is_connected() {
                    warn!("session down while waiting for reply");
                    self.clock.sleep(self.config.disconnected_backoff);
                    return;
                }
                let due = self
                    .last_ping
                    .map_or(true, |at| now.duration_since(at) >= self.config.keepalive_interval);
                if due {
                    if let Err(e) = self.messenger.send_ping() {
                        debug!("keep-alive failed: {e}");
                    }
                    self.last_ping = Some(now);
                }
                if self.audio.reply_played() {
                    self.enter_continuous_dialog("reply played");
                }
            }
            ConversationState::PlaybackFinishedWaiting => {
                if self.audio.is_streaming_active() {
                    self.clock.sleep(self.config.drain_poll);
                } else {
                    info!("reply drained, letting the speaker settle");
                    self.clock.sleep(self.config.settle_delay);
                    self.enter_continuous_dialog("reply drained");
                }
            }
            ConversationState::PlayingWeatherReport => {
                if self.audio.is_streaming_active() {
                    self.clock.sleep(self.config.drain_poll);
                } else if !self.held_weather.is_empty() {
                    self.release_held_weather();
                } else if self.weather_stream_started {
                    self.finish_weather_report();
                } else if self.weather_finish_pending {
                    warn!("weather announcement finished with nothing played");
                    self.transition(ConversationState::WaitingWakeup, "empty weather report");
                }
            }
            ConversationState::WaitingWakeup => {}
        }
    }

    fn enter_continuous_dialog(&mut self, detail: &'static str) {
        self.send_event(ClientEvent::RecordingStarted);
        self.audio.clear_recording();
        self.audio.start_recording();
        self.audio.reset_reply_played();
        self.reset_turn();
        self.continuous = true;
        self.recording_deadline = Some(self.clock.now() + self.config.recording_timeout);
        info!(
            timeout_secs = self.config.recording_timeout.as_secs(),
            "continuous dialog, listening for a follow-up"
        );
        self.transition(ConversationState::Recording, detail);
    }

    fn exit_dialog(&mut self) {
        self.play_cue(self.cues.farewell.clone(), "farewell");
        self.messenger.disconnect();
        self.audio.stop_recording();
        self.audio.clear_recording();
        self.reset_turn();
        self.recording_deadline = None;
        self.transition(ConversationState::WaitingWakeup, "dialog timeout");
    }

    fn finish_weather_report(&mut self) {
        info!(triggered_by = self.weather_source.as_str(), "weather announcement played");
        self.send_event(ClientEvent::WeatherPlayed);
        self.clock.sleep(self.config.settle_delay);
        self.reset_turn();
        self.recording_deadline = None;
        self.transition(ConversationState::WaitingWakeup, "weather played");
    }

    fn restart_recording(&mut self, detail: &'static str) {
        self.audio.clear_recording();
        self.audio.start_recording();
        self.reset_turn();
        self.transition(ConversationState::Recording, detail);
    }

    /// Per-turn detection state, cleared on every entry into `Recording`.
    fn reset_turn(&mut self) {
        self.speech_latched = false;
        self.silence_frames = 0;
        self.user_started = false;
        self.realtime_streaming = false;
        self.voiced_start = None;
        self.voiced_end = 0;
        self.vad.reset();
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn send_event(&mut self, event: ClientEvent) {
        if !self.messenger.is_connected() {
            debug!(event = event.tag(), "not connected, event not sent");
            return;
        }
        if let Err(e) = self.messenger.send_text(&event.to_json()) {
            warn!(event = event.tag(), "event send failed: {e}");
        }
    }

    fn play_cue(&self, cue: Option<crate::audio::cue::Cue>, name: &'static str) {
        let Some(cue) = cue.filter(|c| !c.is_empty()) else {
            debug!(cue = name, "no cue configured");
            return;
        };
        if let Err(e) = self.audio.play_one_shot(cue.pcm()) {
            warn!(cue = name, "cue playback failed: {e}");
        }
    }

    fn transition(&mut self, to: ConversationState, detail: &'static str) {
        let from = self.state;
        if to == ConversationState::WaitingWakeup {
            self.continuous = false;
            self.weather = false;
            self.weather_source.clear();
            self.weather_stream_started = false;
            self.clear_held_weather();
            self.wake.reset();
        }
        self.state = to;
        self.seq += 1;
        info!(from = ?from, to = ?to, detail, "conversation state");
        if let Some(tx) = &self.events {
            let _ = tx.send(ConversationEvent {
                seq: self.seq,
                from,
                to,
                detail: detail.to_string(),
            });
        }
    }
}
