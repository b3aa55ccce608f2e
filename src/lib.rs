//! soundbath - audio session engine for guided relaxation
//!
//! Mixes a looping music bed, a binaural beat and a recorded voice
//! mantra into one output, each behind its own gain bus. Everything is
//! driven through [`SessionEngine`].

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod music;
pub mod synth;
pub mod timer;
pub mod track;
pub mod voice;

pub use audio::{AudioBackend, AudioBuffer, CpalBackend, OfflineBackend, RecordedBuffer};
pub use config::EngineConfig;
pub use engine::{EngineEvent, SessionEngine};
pub use error::{
    ContextUnavailable, DecodeError, MicrophoneUnavailable, SessionError, TrackLoadError,
};
pub use synth::{OscillatorState, Waveform};
pub use timer::SessionTimer;
pub use track::{MixSettings, Slot, Track, TrackKind, VolumeSlot};
pub use voice::VoiceState;
