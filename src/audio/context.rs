//! The shared processing context
//!
//! One `AudioContext` exists per session. It is created on the first
//! `start()`, survives any number of stop/start cycles (only suspended
//! and resumed), and is dropped when the engine is disposed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use cpal::{FromSample, Sample};

use super::backend::{AudioBackend, OutputStream};
use super::graph::{lock_graph, Graph, SharedGraph};
use crate::error::ContextUnavailable;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a processing context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Suspended,
}

/// Audio-thread half of a context
///
/// Moved into the platform's output callback. Renders the graph into
/// interleaved output of any channel count.
pub struct Renderer {
    graph: SharedGraph,
    running: Arc<AtomicBool>,
    frames_rendered: Arc<AtomicU64>,
    sample_rate: u32,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl Renderer {
    /// Tell the renderer what rate the device runs at
    ///
    /// Called by the backend once the stream format is known.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
    }

    /// Fill an interleaved output buffer
    ///
    /// Left goes to channel 0, right to channel 1, any further channels
    /// are silent and a mono device gets the average. Writes silence
    /// while suspended or when the control thread holds the graph.
    pub fn write<T: Sample + FromSample<f32>>(&mut self, data: &mut [T], channels: usize) {
        if channels == 0 {
            return;
        }
        if !self.running.load(Ordering::Relaxed) {
            data.fill(T::EQUILIBRIUM);
            return;
        }

        let mut graph = match self.graph.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                data.fill(T::EQUILIBRIUM);
                return;
            }
        };

        let frames = data.len() / channels;
        if self.left.len() < frames {
            self.left.resize(frames, 0.0);
            self.right.resize(frames, 0.0);
        }
        let left = &mut self.left[..frames];
        let right = &mut self.right[..frames];
        let sample_rate = self.sample_rate as f32;
        graph.process(left, right, sample_rate);
        drop(graph);

        for (i, frame) in data.chunks_mut(channels).enumerate() {
            if i >= frames {
                // Trailing partial frame
                frame.fill(T::EQUILIBRIUM);
                continue;
            }
            if channels >= 2 {
                frame[0] = T::from_sample(left[i]);
                frame[1] = T::from_sample(right[i]);
                for ch in frame.iter_mut().skip(2) {
                    *ch = T::EQUILIBRIUM;
                }
            } else {
                frame[0] = T::from_sample((left[i] + right[i]) / 2.0);
            }
        }

        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
    }
}

/// The shared real-time graph root
pub struct AudioContext {
    id: ContextId,
    graph: SharedGraph,
    running: Arc<AtomicBool>,
    frames_rendered: Arc<AtomicU64>,
    stream: Box<dyn OutputStream>,
}

impl AudioContext {
    /// Open an output stream and start rendering an empty graph
    ///
    /// # Arguments
    /// * `backend` - Platform to open the output on
    /// * `device` - Output device name, `None` for the default
    /// * `ramp_ms` - Gain de-zipper window
    pub fn create(
        backend: &dyn AudioBackend,
        device: Option<&str>,
        ramp_ms: f32,
    ) -> Result<Self, ContextUnavailable> {
        let graph: SharedGraph = Arc::new(Mutex::new(Graph::new(ramp_ms)));
        let running = Arc::new(AtomicBool::new(true));
        let frames_rendered = Arc::new(AtomicU64::new(0));

        let renderer = Renderer {
            graph: Arc::clone(&graph),
            running: Arc::clone(&running),
            frames_rendered: Arc::clone(&frames_rendered),
            sample_rate: 48_000,
            left: Vec::new(),
            right: Vec::new(),
        };

        let unavailable = |e: crate::error::BackendError| ContextUnavailable {
            reason: e.to_string(),
        };
        let stream = backend.open_output(device, renderer).map_err(unavailable)?;
        stream.play().map_err(unavailable)?;

        let context = Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            graph,
            running,
            frames_rendered,
            stream,
        };
        log::info!(
            "Audio context {:?} created ({} Hz, {} channels)",
            context.id,
            context.sample_rate(),
            context.stream.channels()
        );
        Ok(context)
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> ContextState {
        if self.running.load(Ordering::Relaxed) {
            ContextState::Running
        } else {
            ContextState::Suspended
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.stream.sample_rate()
    }

    /// Frames rendered so far; the current processing instant
    pub fn current_frame(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    /// Lock the graph for mutation
    pub fn graph(&self) -> std::sync::MutexGuard<'_, Graph> {
        lock_graph(&self.graph)
    }

    /// Stop the clock and silence output without tearing anything down
    pub fn suspend(&mut self) {
        if self.state() == ContextState::Suspended {
            return;
        }
        self.running.store(false, Ordering::Relaxed);
        if let Err(e) = self.stream.pause() {
            // Output is already silenced by the flag
            log::warn!("Failed to pause output stream: {}", e);
        }
        log::info!("Audio context {:?} suspended", self.id);
    }

    /// Resume after `suspend`
    pub fn resume(&mut self) -> Result<(), ContextUnavailable> {
        if self.state() == ContextState::Running {
            return Ok(());
        }
        self.stream.play().map_err(|e| ContextUnavailable {
            reason: e.to_string(),
        })?;
        self.running.store(true, Ordering::Relaxed);
        log::info!("Audio context {:?} resumed", self.id);
        Ok(())
    }
}
