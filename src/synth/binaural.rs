//! Binaural beat synthesizer
//!
//! Two pure tones, one per ear: the left at the base frequency, the
//! right at `base + beat`. The two are never mixed with each other; each
//! goes through a hard panner into a shared gain bus, and the "beat" is
//! something the listener's brain produces, not the signal.
//!
//! A pair is built once per track. Changing the beat frequency means
//! tearing the pair down and building a new one, since oscillators cannot
//! be restarted or retuned.

use crate::audio::{GainBus, Graph, Source, SourceId, StereoPanner};
use crate::error::OscillatorError;

use super::oscillator::{Oscillator, OscillatorState, Waveform};

/// A live binaural AudioNode: two panned oscillators and their bus
#[derive(Debug)]
pub struct BinauralPair {
    beat: f32,
    bus: GainBus,
    left: Oscillator,
    right: Oscillator,
    source_ids: Vec<SourceId>,
}

impl BinauralPair {
    /// Build the pair and connect it into `graph`, unstarted
    ///
    /// # Arguments
    /// * `base_frequency` - Left-ear tone in Hz
    /// * `beat` - Beat frequency in Hz, added to the right ear
    /// * `volume` - Initial bus gain
    /// * `waveform` - Tone shape, sine for a classic binaural beat
    pub fn build(
        graph: &mut Graph,
        base_frequency: f32,
        beat: f32,
        volume: f32,
        waveform: Waveform,
    ) -> Self {
        let (left, left_voice) = Oscillator::new(base_frequency, waveform);
        let (right, right_voice) = Oscillator::new(base_frequency + beat, waveform);

        let (bus, source_ids) = graph.add_bus_with(
            volume,
            vec![
                (Box::new(left_voice) as Box<dyn Source>, Some(StereoPanner::hard_left())),
                (Box::new(right_voice) as Box<dyn Source>, Some(StereoPanner::hard_right())),
            ],
        );

        log::info!(
            "Binaural pair built: {:.1} Hz left, {:.1} Hz right ({:.1} Hz beat)",
            left.frequency(),
            right.frequency(),
            beat
        );

        Self {
            beat,
            bus,
            left,
            right,
            source_ids,
        }
    }

    pub fn waveform(&self) -> Waveform {
        self.left.waveform()
    }

    /// (left, right) oscillator frequencies
    pub fn frequencies(&self) -> (f32, f32) {
        (self.left.frequency(), self.right.frequency())
    }

    pub fn bus(&self) -> &GainBus {
        &self.bus
    }

    /// Graph ids of the two panned oscillators
    pub fn source_ids(&self) -> &[SourceId] {
        &self.source_ids
    }

    /// Lifecycle of the pair; both oscillators always move together
    pub fn state(&self) -> OscillatorState {
        self.left.state()
    }

    /// Start both oscillators
    ///
    /// A pair can be started once. Starting it again is rejected with
    /// `AlreadyStarted`, starting after teardown with `Spent`.
    pub fn start(&self) -> Result<(), OscillatorError> {
        self.left.start()?;
        if let Err(e) = self.right.start() {
            // Keep the pair consistent
            let _ = self.left.stop();
            return Err(e);
        }
        log::info!("Started binaural oscillators");
        Ok(())
    }

    /// Stop (if started) and disconnect everything
    ///
    /// Consumes the pair, so it can only ever be torn down once.
    pub fn teardown(self, graph: &mut Graph) {
        if self.state() == OscillatorState::Playing {
            let _ = self.left.stop();
            let _ = self.right.stop();
        }
        for id in &self.source_ids {
            graph.disconnect_source(*id);
        }
        graph.disconnect_bus(self.bus.id());
        log::info!("Binaural pair torn down ({:.1} Hz beat)", self.beat);
    }
}
