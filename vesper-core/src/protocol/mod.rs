//! Peer messaging: the transport seam and the event vocabulary.
//!
//! ## Inbound text events
//!
//! Tags are recognised by substring, checked in this order:
//!
//! | Match | Event |
//! |-------|-------|
//! | `response_finished` anywhere | [`ServerEvent::ResponseFinished`] |
//! | `"event":"ping"` | [`ServerEvent::Ping`] |
//! | `"event":"error"` | [`ServerEvent::Error`] |
//! | `"event":"play_weather"` | [`ServerEvent::PlayWeather`] |
//!
//! Anything else is [`ServerEvent::Unknown`] and ignored by the conversation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Longest trigger-source id kept from a `play_weather` event.
pub const MAX_TRIGGER_SOURCE_CHARS: usize = 31;

/// Connection to the inference service. Calls are synchronous.
pub trait Messenger: Send {
    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self);

    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Send one binary frame, giving up after `timeout`.
    fn send_binary(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Keep-alive probe.
    fn send_ping(&mut self) -> Result<()>;
}

/// Frames delivered by the transport's reader to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Connected,
    Disconnected,
    Error(String),
}

/// Recognised inbound text events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ResponseFinished,
    Ping,
    Error,
    PlayWeather { triggered_by: String },
    Unknown,
}

impl ServerEvent {
    pub fn parse(text: &str) -> Self {
        if text.contains("response_finished") {
            ServerEvent::ResponseFinished
        } else if text.contains(r#""event":"ping""#) {
            ServerEvent::Ping
        } else if text.contains(r#""event":"error""#) {
            ServerEvent::Error
        } else if text.contains(r#""event":"play_weather""#) {
            ServerEvent::PlayWeather {
                triggered_by: extract_triggered_by(text),
            }
        } else {
            ServerEvent::Unknown
        }
    }
}

/// Value of `"triggered_by":"..."`, truncated; empty when absent or unterminated.
fn extract_triggered_by(text: &str) -> String {
    const KEY: &str = r#""triggered_by":""#;
    let Some(start) = text.find(KEY).map(|i| i + KEY.len()) else {
        return String::new();
    };
    let rest = &text[start..];
    match rest.find('"') {
        Some(end) => rest[..end].chars().take(MAX_TRIGGER_SOURCE_CHARS).collect(),
        None => String::new(),
    }
}

/// Outbound text events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    RecordingStarted,
    RecordingEnded,
    RecordingCancelled,
    WeatherPlayed,
}

impl ClientEvent {
    /// Compact JSON, e.g. `{"event":"recording_started"}`.
    pub fn to_json(self) -> String {
        serde_json::to_string(&self).unwrap_or_else(|_| format!(r#"{{"event":"{}"}}"#, self.tag()))
    }

    pub fn tag(self) -> &'static str {
        match self {
            ClientEvent::RecordingStarted => "recording_started",
            ClientEvent::RecordingEnded => "recording_ended",
            ClientEvent::RecordingCancelled => "recording_cancelled",
            ClientEvent::WeatherPlayed => "weather_played",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_serialize_as_tagged_json() {
        assert_eq!(
            ClientEvent::RecordingStarted.to_json(),
            r#"{"event":"recording_started"}"#
        );
        assert_eq!(
            ClientEvent::WeatherPlayed.to_json(),
            r#"{"event":"weather_played"}"#
        );
    }

    #[test]
    fn response_finished_wins_over_other_tags() {
        let text = r#"{"event":"error","detail":"response_finished early"}"#;
        assert_eq!(ServerEvent::parse(text), ServerEvent::ResponseFinished);
    }

    #[test]
    fn recognises_ping_and_error() {
        assert_eq!(ServerEvent::parse(r#"{"event":"ping"}"#), ServerEvent::Ping);
        assert_eq!(
            ServerEvent::parse(r#"{"event":"error","message":"tts failed"}"#),
            ServerEvent::Error
        );
    }

    #[test]
    fn tags_must_match_exactly_without_spaces() {
        assert_eq!(ServerEvent::parse(r#"{"event": "ping"}"#), ServerEvent::Unknown);
        assert_eq!(ServerEvent::parse("hello"), ServerEvent::Unknown);
    }

    #[test]
    fn play_weather_extracts_trigger_source() {
        let event = ServerEvent::parse(r#"{"event":"play_weather","triggered_by":"kitchen"}"#);
        assert_eq!(
            event,
            ServerEvent::PlayWeather {
                triggered_by: "kitchen".into()
            }
        );
    }

    #[test]
    fn trigger_source_is_truncated_to_31_chars() {
        let long = "x".repeat(40);
        let text = format!(r#"{{"event":"play_weather","triggered_by":"{long}"}}"#);
        let ServerEvent::PlayWeather { triggered_by } = ServerEvent::parse(&text) else {
            panic!("expected play_weather");
        };
        assert_eq!(triggered_by.len(), 31);
    }

    #[test]
    fn missing_or_unterminated_trigger_source_is_empty() {
        assert_eq!(
            ServerEvent::parse(r#"{"event":"play_weather"}"#),
            ServerEvent::PlayWeather {
                triggered_by: String::new()
            }
        );
        assert_eq!(
            ServerEvent::parse(r#"{"event":"play_weather","triggered_by":"hall"#),
            ServerEvent::PlayWeather {
                triggered_by: String::new()
            }
        );
    }
}
