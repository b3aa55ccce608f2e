//! The mixing graph
//!
//! The graph is deliberately flat: every source feeds exactly one gain
//! bus, and every bus feeds the destination. That is all the session
//! needs (music, binaural and voice each get their own bus) and it keeps
//! the render loop a couple of nested `for`s with no routing logic.
//!
//! ```text
//!  source ─┐
//!  source ─┼─ [panner] ─ GainBus ─┐
//!          │                      ├─ destination (stereo out)
//!  source ─┴──────────── GainBus ─┘
//! ```
//!
//! ## Threading
//!
//! The graph lives behind a `Mutex` shared with the audio callback.
//! The control thread locks it to connect or disconnect nodes; the audio
//! thread only ever uses `try_lock` and renders silence if it loses the
//! race. Sources are removed (and therefore dropped) on the control
//! thread, so the audio thread never deallocates.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::track::clamp_volume;

/// Graph shared between the control thread and the audio callback
pub type SharedGraph = Arc<Mutex<Graph>>;

/// Lock the graph from the control thread
///
/// A panic while holding the lock cannot leave the graph structurally
/// broken (every mutation is a single push or remove), so poisoning is
/// ignored.
pub fn lock_graph(graph: &SharedGraph) -> MutexGuard<'_, Graph> {
    graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identifies a gain bus inside a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId(u64);

/// Identifies a connected source inside a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

/// Channel layout a source renders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    /// Only the left buffer is written
    Mono,
    Stereo,
}

/// Something that produces audio on the audio thread
pub trait Source: Send {
    fn layout(&self) -> SourceLayout;

    /// Render `left.len()` frames
    ///
    /// Both buffers arrive zeroed. Mono sources write `left` only.
    fn render(&mut self, left: &mut [f32], right: &mut [f32], sample_rate: f32);
}

/// Equal-power stereo panner
///
/// `pan = -1` sends everything left, `pan = 1` everything right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoPanner {
    pan: f32,
}

impl StereoPanner {
    pub fn new(pan: f32) -> Self {
        Self {
            pan: if pan.is_nan() { 0.0 } else { pan.clamp(-1.0, 1.0) },
        }
    }

    pub fn hard_left() -> Self {
        Self::new(-1.0)
    }

    pub fn hard_right() -> Self {
        Self::new(1.0)
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    /// Pan one frame in place
    fn apply(&self, layout: SourceLayout, l: f32, r: f32) -> (f32, f32) {
        match layout {
            SourceLayout::Mono => {
                let (gl, gr) = equal_power((self.pan + 1.0) / 2.0);
                (l * gl, l * gr)
            }
            // Stereo input: the side being panned away from folds into the other
            SourceLayout::Stereo if self.pan <= 0.0 => {
                let (gl, gr) = equal_power(self.pan + 1.0);
                (l + r * gl, r * gr)
            }
            SourceLayout::Stereo => {
                let (gl, gr) = equal_power(self.pan);
                (l * gl, r + l * gr)
            }
        }
    }
}

/// (left gain, right gain) for a position in [0, 1]; exact at both ends
fn equal_power(x: f32) -> (f32, f32) {
    if x <= 0.0 {
        (1.0, 0.0)
    } else if x >= 1.0 {
        (0.0, 1.0)
    } else {
        let angle = x * std::f32::consts::FRAC_PI_2;
        (angle.cos(), angle.sin())
    }
}

/// Gain value shared between a bus handle and its graph entry
#[derive(Debug)]
struct GainParam {
    /// f32 bits
    target: AtomicU32,
}

impl GainParam {
    fn new(value: f32) -> Self {
        Self {
            target: AtomicU32::new(value.to_bits()),
        }
    }

    fn get(&self) -> f32 {
        f32::from_bits(self.target.load(Ordering::Relaxed))
    }

    fn set(&self, value: f32) {
        self.target.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Control handle for a gain bus
///
/// Cloning the handle shares the same gain parameter.
#[derive(Debug, Clone)]
pub struct GainBus {
    id: BusId,
    param: Arc<GainParam>,
}

impl GainBus {
    pub fn id(&self) -> BusId {
        self.id
    }

    /// The gain most recently set
    pub fn value(&self) -> f32 {
        self.param.get()
    }

    /// Set the gain from the current processing instant on
    ///
    /// Clamped to [0, 1]. The audio thread ramps to the new value over
    /// the graph's de-zipper window. Returns the stored value.
    pub fn set_value(&self, value: f32) -> f32 {
        let value = clamp_volume(value);
        self.param.set(value);
        value
    }
}

struct SourceEntry {
    id: SourceId,
    source: Box<dyn Source>,
    panner: Option<StereoPanner>,
}

struct BusEntry {
    id: BusId,
    param: Arc<GainParam>,
    /// Gain actually applied, chases `param`
    current: f32,
    sources: Vec<SourceEntry>,
}

/// The mixing graph
pub struct Graph {
    buses: Vec<BusEntry>,
    ramp_seconds: f32,
    // Scratch space, grown on demand and then reused
    src_l: Vec<f32>,
    src_r: Vec<f32>,
    bus_l: Vec<f32>,
    bus_r: Vec<f32>,
}

impl Graph {
    /// Create an empty graph
    ///
    /// # Arguments
    /// * `ramp_ms` - Length of the gain de-zipper ramp
    pub fn new(ramp_ms: f32) -> Self {
        Self {
            buses: Vec::new(),
            ramp_seconds: (ramp_ms.max(0.0)) / 1000.0,
            src_l: Vec::new(),
            src_r: Vec::new(),
            bus_l: Vec::new(),
            bus_r: Vec::new(),
        }
    }

    /// Add a bus feeding the destination
    ///
    /// The bus starts at `gain` with no ramp, so its level is correct
    /// from the very first rendered frame.
    pub fn add_bus(&mut self, gain: f32) -> GainBus {
        let gain = clamp_volume(gain);
        let param = Arc::new(GainParam::new(gain));
        let id = BusId(next_id());
        self.buses.push(BusEntry {
            id,
            param: Arc::clone(&param),
            current: gain,
            sources: Vec::new(),
        });
        GainBus { id, param }
    }

    /// Add a bus together with its sources
    ///
    /// Returns the bus and the source ids in the order given.
    pub fn add_bus_with(
        &mut self,
        gain: f32,
        sources: Vec<(Box<dyn Source>, Option<StereoPanner>)>,
    ) -> (GainBus, Vec<SourceId>) {
        let bus = self.add_bus(gain);
        let mut ids = Vec::with_capacity(sources.len());
        if let Some(entry) = self.buses.last_mut() {
            for (source, panner) in sources {
                let id = SourceId(next_id());
                entry.sources.push(SourceEntry { id, source, panner });
                ids.push(id);
            }
        }
        (bus, ids)
    }

    /// Add a bus fed by a single source
    pub fn add_source_bus(
        &mut self,
        gain: f32,
        source: Box<dyn Source>,
        panner: Option<StereoPanner>,
    ) -> (GainBus, SourceId) {
        let bus = self.add_bus(gain);
        let id = SourceId(next_id());
        if let Some(entry) = self.buses.last_mut() {
            entry.sources.push(SourceEntry { id, source, panner });
        }
        (bus, id)
    }

    /// Connect a source to a bus, optionally through a panner
    ///
    /// Returns `None` (dropping the source) if the bus is not in the graph.
    pub fn connect(
        &mut self,
        bus: &GainBus,
        source: Box<dyn Source>,
        panner: Option<StereoPanner>,
    ) -> Option<SourceId> {
        let entry = self.buses.iter_mut().find(|b| b.id == bus.id)?;
        let id = SourceId(next_id());
        entry.sources.push(SourceEntry { id, source, panner });
        Some(id)
    }

    /// Remove a source; returns whether it was connected
    pub fn disconnect_source(&mut self, id: SourceId) -> bool {
        for bus in &mut self.buses {
            if let Some(pos) = bus.sources.iter().position(|s| s.id == id) {
                bus.sources.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove a bus and everything still connected to it
    pub fn disconnect_bus(&mut self, id: BusId) -> bool {
        match self.buses.iter().position(|b| b.id == id) {
            Some(pos) => {
                self.buses.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains_bus(&self, id: BusId) -> bool {
        self.buses.iter().any(|b| b.id == id)
    }

    pub fn contains_source(&self, id: SourceId) -> bool {
        self.buses
            .iter()
            .any(|b| b.sources.iter().any(|s| s.id == id))
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn source_count(&self) -> usize {
        self.buses.iter().map(|b| b.sources.len()).sum()
    }

    /// Render every bus into `left`/`right`
    ///
    /// The output buffers are overwritten, not accumulated into.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32], sample_rate: f32) {
        let frames = left.len().min(right.len());
        left[..frames].fill(0.0);
        right[..frames].fill(0.0);

        for buf in [&mut self.src_l, &mut self.src_r, &mut self.bus_l, &mut self.bus_r] {
            if buf.len() < frames {
                buf.resize(frames, 0.0);
            }
        }

        let ramp_samples = (self.ramp_seconds * sample_rate).max(1.0);

        for bus in &mut self.buses {
            let bus_l = &mut self.bus_l[..frames];
            let bus_r = &mut self.bus_r[..frames];
            bus_l.fill(0.0);
            bus_r.fill(0.0);

            for entry in &mut bus.sources {
                let src_l = &mut self.src_l[..frames];
                let src_r = &mut self.src_r[..frames];
                src_l.fill(0.0);
                src_r.fill(0.0);

                let layout = entry.source.layout();
                entry.source.render(src_l, src_r, sample_rate);

                for i in 0..frames {
                    let (l, r) = match (entry.panner, layout) {
                        (Some(p), _) => p.apply(layout, src_l[i], src_r[i]),
                        (None, SourceLayout::Mono) => (src_l[i], src_l[i]),
                        (None, SourceLayout::Stereo) => (src_l[i], src_r[i]),
                    };
                    bus_l[i] += l;
                    bus_r[i] += r;
                }
            }

            // Linear ramp toward the target gain
            let target = bus.param.get();
            let step = (target - bus.current) / ramp_samples;
            for i in 0..frames {
                if bus.current != target {
                    bus.current += step;
                    if (step > 0.0 && bus.current > target) || (step < 0.0 && bus.current < target) {
                        bus.current = target;
                    }
                }
                left[i] += bus_l[i] * bus.current;
                right[i] += bus_r[i] * bus.current;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Constant DC source for checking gain and routing
    struct Dc {
        value: f32,
        layout: SourceLayout,
    }

    impl Source for Dc {
        fn layout(&self) -> SourceLayout {
            self.layout
        }

        fn render(&mut self, left: &mut [f32], right: &mut [f32], _sample_rate: f32) {
            left.fill(self.value);
            if self.layout == SourceLayout::Stereo {
                right.fill(-self.value);
            }
        }
    }

    fn dc(value: f32, layout: SourceLayout) -> Box<dyn Source> {
        Box::new(Dc { value, layout })
    }

    #[test]
    fn test_bus_gain_applies_from_first_frame() {
        let mut graph = Graph::new(5.0);
        let bus = graph.add_bus(0.5);
        graph.connect(&bus, dc(1.0, SourceLayout::Mono), None).unwrap();

        let mut l = [0.0; 16];
        let mut r = [0.0; 16];
        graph.process(&mut l, &mut r, 48_000.0);
        assert!(l.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(r.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_gain_change_ramps() {
        let mut graph = Graph::new(1.0); // 48 samples at 48k
        let bus = graph.add_bus(0.0);
        graph.connect(&bus, dc(1.0, SourceLayout::Mono), None).unwrap();

        assert_eq!(bus.set_value(1.0), 1.0);
        assert_eq!(bus.value(), 1.0);

        let mut l = [0.0; 96];
        let mut r = [0.0; 96];
        graph.process(&mut l, &mut r, 48_000.0);
        assert!(l[0] > 0.0 && l[0] < 0.1);
        assert!(l[10] < l[20]);
        assert!((l[95] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_set_value_clamps() {
        let mut graph = Graph::new(5.0);
        let bus = graph.add_bus(2.0);
        assert_eq!(bus.value(), 1.0);
        assert_eq!(bus.set_value(-1.0), 0.0);
    }

    #[test]
    fn test_hard_panning() {
        let mut graph = Graph::new(0.0);
        let bus = graph.add_bus(1.0);
        graph
            .connect(&bus, dc(1.0, SourceLayout::Mono), Some(StereoPanner::hard_left()))
            .unwrap();
        graph
            .connect(&bus, dc(0.25, SourceLayout::Mono), Some(StereoPanner::hard_right()))
            .unwrap();

        let mut l = [0.0; 4];
        let mut r = [0.0; 4];
        graph.process(&mut l, &mut r, 48_000.0);
        assert!((l[0] - 1.0).abs() < 1e-6);
        assert!((r[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_centre_pan_is_equal_power() {
        let mut graph = Graph::new(0.0);
        let bus = graph.add_bus(1.0);
        graph
            .connect(&bus, dc(1.0, SourceLayout::Mono), Some(StereoPanner::new(0.0)))
            .unwrap();

        let mut l = [0.0; 4];
        let mut r = [0.0; 4];
        graph.process(&mut l, &mut r, 48_000.0);
        assert!((l[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((r[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_source_passes_through() {
        let mut graph = Graph::new(0.0);
        let bus = graph.add_bus(1.0);
        graph.connect(&bus, dc(0.5, SourceLayout::Stereo), None).unwrap();

        let mut l = [0.0; 4];
        let mut r = [0.0; 4];
        graph.process(&mut l, &mut r, 48_000.0);
        assert!((l[3] - 0.5).abs() < 1e-6);
        assert!((r[3] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_disconnect() {
        let mut graph = Graph::new(5.0);
        let bus = graph.add_bus(1.0);
        let a = graph.connect(&bus, dc(1.0, SourceLayout::Mono), None).unwrap();
        let b = graph.connect(&bus, dc(1.0, SourceLayout::Mono), None).unwrap();
        assert_eq!(graph.source_count(), 2);

        assert!(graph.disconnect_source(a));
        assert!(!graph.disconnect_source(a));
        assert!(!graph.contains_source(a));
        assert!(graph.contains_source(b));

        assert!(graph.disconnect_bus(bus.id()));
        assert_eq!(graph.bus_count(), 0);
        assert_eq!(graph.source_count(), 0);

        // Connecting to a removed bus is refused
        assert!(graph.connect(&bus, dc(1.0, SourceLayout::Mono), None).is_none());
    }
}
