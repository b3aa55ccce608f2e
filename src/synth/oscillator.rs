//! Oscillators
//!
//! An oscillator is split in two: the `Oscillator` control handle that
//! the engine owns, and the `OscillatorVoice` that renders on the audio
//! thread. They share a single atomic lifecycle state.
//!
//! The lifecycle is one-way: `Unstarted -> Playing -> Stopped`. A stopped
//! oscillator is spent and can never produce sound again; to play the
//! same tone after a stop, build a new oscillator.

use std::f32::consts::TAU;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::audio::{Source, SourceLayout};
use crate::error::OscillatorError;

/// Periodic waveform shapes
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Waveform {
    /// Pure tone
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl Waveform {
    /// Sample the waveform at phase (0.0 to 1.0)
    /// Returns value in range -1.0 to 1.0
    pub fn sample(&self, phase: f32) -> f32 {
        match self {
            Waveform::Sine => (phase * TAU).sin(),

            Waveform::Square => {
                if phase < 0.5 { 1.0 } else { -1.0 }
            }

            Waveform::Sawtooth => 2.0 * phase - 1.0,

            Waveform::Triangle => {
                let p = phase * 4.0;
                if p < 1.0 {
                    p
                } else if p < 3.0 {
                    2.0 - p
                } else {
                    p - 4.0
                }
            }
        }
    }
}

impl FromStr for Waveform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sine" => Ok(Waveform::Sine),
            "square" => Ok(Waveform::Square),
            "saw" | "sawtooth" => Ok(Waveform::Sawtooth),
            "triangle" => Ok(Waveform::Triangle),
            other => Err(format!("unknown waveform '{}' (sine, square, saw, triangle)", other)),
        }
    }
}

/// Where an oscillator is in its one-way lifecycle
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OscillatorState {
    Unstarted,
    Playing,
    Stopped,
}

impl OscillatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OscillatorState::Unstarted,
            1 => OscillatorState::Playing,
            _ => OscillatorState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OscillatorState::Unstarted => 0,
            OscillatorState::Playing => 1,
            OscillatorState::Stopped => 2,
        }
    }
}

/// Control side of an oscillator
#[derive(Debug)]
pub struct Oscillator {
    frequency: f32,
    waveform: Waveform,
    state: Arc<AtomicU8>,
}

/// Audio-thread side of an oscillator
pub struct OscillatorVoice {
    frequency: f32,
    waveform: Waveform,
    state: Arc<AtomicU8>,
    /// 0.0 to 1.0
    phase: f32,
}

impl Oscillator {
    /// Create an unstarted oscillator and the voice that renders it
    ///
    /// The frequency is fixed for the oscillator's lifetime.
    pub fn new(frequency: f32, waveform: Waveform) -> (Self, OscillatorVoice) {
        let state = Arc::new(AtomicU8::new(OscillatorState::Unstarted.as_u8()));
        let voice = OscillatorVoice {
            frequency,
            waveform,
            state: Arc::clone(&state),
            phase: 0.0,
        };
        (
            Self {
                frequency,
                waveform,
                state,
            },
            voice,
        )
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    pub fn state(&self) -> OscillatorState {
        OscillatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Begin producing sound
    ///
    /// Only valid from `Unstarted`; a second start is rejected.
    pub fn start(&self) -> Result<(), OscillatorError> {
        self.transition(OscillatorState::Unstarted, OscillatorState::Playing)
            .map_err(|current| match current {
                OscillatorState::Playing => OscillatorError::AlreadyStarted,
                _ => OscillatorError::Spent,
            })
    }

    /// Stop for good
    pub fn stop(&self) -> Result<(), OscillatorError> {
        self.transition(OscillatorState::Playing, OscillatorState::Stopped)
            .map_err(|current| match current {
                OscillatorState::Unstarted => OscillatorError::NotStarted,
                _ => OscillatorError::Spent,
            })
    }

    fn transition(&self, from: OscillatorState, to: OscillatorState) -> Result<(), OscillatorState> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(OscillatorState::from_u8)
    }
}

impl Source for OscillatorVoice {
    fn layout(&self) -> SourceLayout {
        SourceLayout::Mono
    }

    fn render(&mut self, left: &mut [f32], _right: &mut [f32], sample_rate: f32) {
        if self.state.load(Ordering::Acquire) != OscillatorState::Playing.as_u8() {
            return;
        }

        let increment = self.frequency / sample_rate;
        for sample in left.iter_mut() {
            *sample = self.waveform.sample(self.phase);
            self.phase = (self.phase + increment).fract();
        }
    }
}
