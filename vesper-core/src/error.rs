use thiserror::Error;

/// All errors produced by vesper-core.
#[derive(Debug, Error)]
pub enum VesperError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("failed to reserve {bytes} bytes for {what}")]
    Allocation { what: &'static str, bytes: usize },

    #[error("audio output failed: {0}")]
    Output(String),

    #[error("capture underrun — no full frame available")]
    CaptureUnderrun,

    #[error("no reply audio to play")]
    NothingToPlay,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected to the server")]
    NotConnected,

    #[error("detector error: {0}")]
    Detector(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VesperError>;
