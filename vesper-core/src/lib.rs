//! # vesper-core
//!
//! On-device runtime of a voice-assistant appliance: wake, record, stream the
//! utterance upstream, play the spoken reply, keep the dialog going.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioInput ─► control loop (spawn_blocking) ──► Messenger ⇄ server
//!                                 │  Conversation                  │
//!                                 │   ├─ WakeWordDetector / VAD    │ inbound frames
//!                                 │   └─ AudioSubsystem ◄──────────┘
//!                                 │        ├─ RecordingAccumulator (pre-roll)
//!                                 │        ├─ ReplyBuffer (buffered replies)
//!                                 │        └─ StreamingRingBuffer ─► drain thread ─► AudioOutput
//!                                 │                                             └──► EchoSink
//!                                 └─► broadcast::Sender<ConversationEvent>
//! ```
//!
//! The device callbacks are zero-alloc. The control loop never blocks on
//! audio output; the drain thread does.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod clock;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod protocol;
pub mod vad;
pub mod wake;

// Convenience re-exports for downstream crates
pub use audio::{
    cue::{Cue, Cues},
    subsystem::{AudioConfig, AudioSubsystem},
    AudioInput, AudioOutput, NoiseSuppressor,
};
pub use buffering::{EchoReference, EchoSink, StreamingRingBuffer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conversation::{Conversation, ConversationConfig, ConversationState, ReplyMode};
pub use engine::{Collaborators, EngineConfig, EngineDiagnostics, VoiceEngine};
pub use error::{Result, VesperError};
pub use events::{ConversationEvent, EngineStatus, EngineStatusEvent};
pub use protocol::{ClientEvent, InboundFrame, Messenger, ServerEvent};
pub use vad::{EnergyVad, VadDecision, VoiceActivityDetector};
pub use wake::{EnergyWakeTrigger, WakeVerdict, WakeWordDetector};
