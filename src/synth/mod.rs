//! Synthesis - oscillators and the binaural beat generator

mod binaural;
mod oscillator;

pub use binaural::BinauralPair;
pub use oscillator::{Oscillator, OscillatorState, OscillatorVoice, Waveform};
