//! Error types for the session engine
//!
//! Every failure the engine can report maps to one of these types.
//! None of them are fatal: a failure in one slot leaves the other
//! slots, the processing context and any recording untouched.

use thiserror::Error;

use crate::track::Slot;

/// The platform refused to give us an output stream
///
/// Usually means there is no output device, or the device rejected
/// the stream configuration. The caller may retry `start()` later.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("audio context unavailable: {reason}")]
pub struct ContextUnavailable {
    pub reason: String,
}

/// A music asset could not be fetched or decoded
///
/// The slot is left empty; calling `set_track` again retries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackLoadError {
    #[error("track '{0}' is not valid: {1}")]
    InvalidTrack(String, String),

    #[error("asset not found: {0}")]
    NotFound(String),

    #[error("failed to read asset {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to fetch {url}: {message}")]
    Network { url: String, message: String },

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("failed to decode {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: DecodeFailure,
    },
}

/// The microphone could not be opened
#[derive(Debug, Clone, Error, PartialEq)]
#[error("microphone unavailable: {reason}")]
pub struct MicrophoneUnavailable {
    pub reason: String,
}

/// A finished recording could not be turned into a playable buffer
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("no recording in progress")]
    NotRecording,

    #[error("recording captured no audio")]
    Empty,

    /// The capture ring filled up before it was drained
    #[error("recording has gaps: {0} samples were lost to a full capture buffer")]
    Overrun(usize),

    #[error("failed to encode captured audio: {0}")]
    Encode(String),

    #[error(transparent)]
    Decode(#[from] DecodeFailure),
}

/// Low-level decoder failure shared by music loading and recordings
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeFailure {
    #[error("unrecognised audio format: {0}")]
    Format(String),

    #[error("no decodable audio track")]
    NoTrack,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("stream decoded to zero frames")]
    NoFrames,
}

/// Oscillator lifecycle violations
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum OscillatorError {
    #[error("oscillator already started")]
    AlreadyStarted,

    #[error("oscillator was stopped and cannot be restarted")]
    Spent,

    #[error("oscillator was never started")]
    NotStarted,
}

/// Failures opening platform audio streams
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("no {0} device found")]
    NoDevice(&'static str),

    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("stream error: {0}")]
    Stream(String),
}

/// Configuration file problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Umbrella error for callers that want a single type
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Context(#[from] ContextUnavailable),

    #[error("{slot} slot: {error}")]
    TrackLoad { slot: Slot, error: TrackLoadError },

    #[error(transparent)]
    Microphone(#[from] MicrophoneUnavailable),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
