//! Session events and the request/response wire shapes.
//!
//! Inside the service an event is an [`OutboundEvent`]. On the wire it is a
//! [`WireEvent`]: `{"requestId", "level", "payload"}` with exactly one payload
//! form populated per level.

use serde::{Deserialize, Serialize};

/// What happened in a session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EventKind {
    Info(String),
    Stdout(String),
    Stderr(String),
    Error(String),
    Statistics {
        memory_used_bytes: u64,
        cpu_percent: f32,
    },
    ExitCode(i64),
}

impl EventKind {
    /// Terminal events end a session's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::ExitCode(_))
    }
}

/// An event correlated with its session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OutboundEvent {
    pub request_id: String,
    pub kind: EventKind,
}

/// Wire discriminator for an event's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum Level {
    Info,
    Stdout,
    Stderr,
    Error,
    Statistics,
    ExitCode,
}

/// Payload forms; which one is present follows from the level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Payload {
    Message(String),
    #[serde(rename_all = "camelCase")]
    Statistics {
        memory_used_bytes: u64,
        cpu_percent: f32,
    },
    #[serde(rename_all = "camelCase")]
    ExitCode { exit_code: i64 },
}

/// One line of a `/v1/run` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireEvent {
    pub request_id: String,
    pub level: Level,
    pub payload: Payload,
}

impl From<OutboundEvent> for WireEvent {
    fn from(event: OutboundEvent) -> Self {
        let (level, payload) = match event.kind {
            EventKind::Info(text) => (Level::Info, Payload::Message(text)),
            EventKind::Stdout(text) => (Level::Stdout, Payload::Message(text)),
            EventKind::Stderr(text) => (Level::Stderr, Payload::Message(text)),
            EventKind::Error(text) => (Level::Error, Payload::Message(text)),
            EventKind::Statistics {
                memory_used_bytes,
                cpu_percent,
            } => (
                Level::Statistics,
                Payload::Statistics {
                    memory_used_bytes,
                    cpu_percent,
                },
            ),
            EventKind::ExitCode(exit_code) => (Level::ExitCode, Payload::ExitCode { exit_code }),
        };

        Self {
            request_id: event.request_id,
            level,
            payload,
        }
    }
}

/// A wire event whose payload does not match its level.
#[derive(Debug, thiserror::Error)]
#[error("{level:?} event carries a mismatched payload")]
pub(crate) struct MismatchedPayload {
    pub level: Level,
}

impl TryFrom<WireEvent> for OutboundEvent {
    type Error = MismatchedPayload;

    fn try_from(event: WireEvent) -> Result<Self, Self::Error> {
        let kind = match (event.level, event.payload) {
            (Level::Info, Payload::Message(text)) => EventKind::Info(text),
            (Level::Stdout, Payload::Message(text)) => EventKind::Stdout(text),
            (Level::Stderr, Payload::Message(text)) => EventKind::Stderr(text),
            (Level::Error, Payload::Message(text)) => EventKind::Error(text),
            (
                Level::Statistics,
                Payload::Statistics {
                    memory_used_bytes,
                    cpu_percent,
                },
            ) => EventKind::Statistics {
                memory_used_bytes,
                cpu_percent,
            },
            (Level::ExitCode, Payload::ExitCode { exit_code }) => EventKind::ExitCode(exit_code),
            (level, _) => return Err(MismatchedPayload { level }),
        };

        Ok(Self {
            request_id: event.request_id,
            kind,
        })
    }
}

/// Body of `POST /v1/run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunRequest {
    pub source_code: String,
    pub language: String,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub stdin: Vec<String>,
}

/// Body of `POST /v1/stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StopRequest {
    pub request_id: String,
    #[serde(default)]
    pub force: bool,
}
