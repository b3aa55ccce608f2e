//! Audio module - the processing context and everything under it
//!
//! This module provides:
//! - The mixing graph (gain buses, panners, sources)
//! - The shared processing context and its audio-thread renderer
//! - Decoded sample buffers and the decoder
//! - Platform backends (cpal and offline)

mod backend;
mod buffer;
mod context;
mod cpal_backend;
pub mod decode;
mod graph;

// Re-export public types
pub use backend::{
    capture_ring, AudioBackend, Capture, CaptureWriter, InputStream, OfflineBackend, OutputStream,
};
pub use buffer::{AudioBuffer, RecordedBuffer};
pub use context::{AudioContext, ContextId, ContextState, Renderer};
pub use cpal_backend::CpalBackend;
pub use graph::{
    lock_graph, BusId, GainBus, Graph, SharedGraph, Source, SourceId, SourceLayout, StereoPanner,
};
