//! Background music loader
//!
//! Fetching and decoding a music asset can take seconds, so it happens on
//! a dedicated thread. The engine sends a request, keeps working, and
//! picks the result up on a later `tick`.
//!
//! Every request carries a `LoadToken`. Selecting another track cancels
//! the token of the load in flight; a cancelled load is skipped if it
//! has not started and reported as `Cancelled` if it has, so a late
//! result can never be installed over a newer selection.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::AudioBuffer;
use crate::error::TrackLoadError;
use crate::music;
use crate::track::Track;

/// Identifies one load and lets the engine cancel it
#[derive(Debug, Clone)]
pub struct LoadToken {
    generation: u64,
    cancelled: Arc<AtomicBool>,
}

impl LoadToken {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Request to load a music track in the background
#[derive(Debug)]
pub struct LoadRequest {
    pub track: Track,
    pub token: LoadToken,
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(AudioBuffer),
    Failed(TrackLoadError),
    /// Superseded before or while loading
    Cancelled,
}

/// Result of a background load
#[derive(Debug)]
pub struct LoadResult {
    pub track: Track,
    pub generation: u64,
    pub outcome: LoadOutcome,
}

/// Handle to the background loader thread
pub struct AssetLoader {
    tx: Option<Sender<LoadRequest>>,
    rx: Receiver<LoadResult>,
    /// Kept for running loads inline when the thread could not be spawned
    result_tx: Sender<LoadResult>,
    asset_root: PathBuf,
    handle: Option<JoinHandle<()>>,
}

impl AssetLoader {
    /// Spawn the loader thread
    ///
    /// If the OS refuses a new thread, loads run synchronously on the
    /// caller's thread instead.
    pub fn spawn(asset_root: PathBuf) -> Self {
        let (request_tx, request_rx) = std::sync::mpsc::channel::<LoadRequest>();
        let (result_tx, result_rx) = std::sync::mpsc::channel::<LoadResult>();

        let root = asset_root.clone();
        let thread_tx = result_tx.clone();
        let spawned = thread::Builder::new()
            .name("asset-loader".to_string())
            .spawn(move || loader_thread(request_rx, thread_tx, root));

        let (tx, handle) = match spawned {
            Ok(handle) => {
                log::info!("Asset loader spawned (root: {})", asset_root.display());
                (Some(request_tx), Some(handle))
            }
            Err(e) => {
                log::warn!("Failed to spawn asset loader thread, loading inline: {}", e);
                (None, None)
            }
        };

        Self {
            tx,
            rx: result_rx,
            result_tx,
            asset_root,
            handle,
        }
    }

    /// Queue a load (non-blocking unless running inline)
    pub fn request(&self, track: Track, token: LoadToken) {
        let request = LoadRequest { track, token };
        let request = match &self.tx {
            Some(tx) => match tx.send(request) {
                Ok(()) => return,
                Err(e) => {
                    log::error!("Asset loader thread disconnected, loading inline");
                    e.0
                }
            },
            None => request,
        };
        let _ = self.result_tx.send(run_request(request, &self.asset_root));
    }

    /// Whether requests can still be served
    ///
    /// Inline mode always can; a spawned thread can until it exits.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }

    /// Try to receive a finished load (non-blocking)
    pub fn try_recv(&self) -> Option<LoadResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                log::error!("Asset loader disconnected unexpectedly");
                None
            }
        }
    }

    /// Wait up to `timeout` for a finished load
    pub fn recv_timeout(&self, timeout: Duration) -> Option<LoadResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                log::error!("Asset loader disconnected unexpectedly");
                None
            }
        }
    }
}

fn run_request(request: LoadRequest, asset_root: &std::path::Path) -> LoadResult {
    let LoadRequest { track, token } = request;
    let outcome = if token.is_cancelled() {
        log::debug!("Skipping cancelled load of '{}'", track.id);
        LoadOutcome::Cancelled
    } else {
        match music::load_music(&track, asset_root) {
            Ok(_) if token.is_cancelled() => LoadOutcome::Cancelled,
            Ok(buffer) => LoadOutcome::Loaded(buffer),
            Err(e) => LoadOutcome::Failed(e),
        }
    };
    LoadResult {
        track,
        generation: token.generation(),
        outcome,
    }
}

fn loader_thread(rx: Receiver<LoadRequest>, tx: Sender<LoadResult>, asset_root: PathBuf) {
    log::info!("Asset loader thread started");
    for request in rx {
        if tx.send(run_request(request, &asset_root)).is_err() {
            break;
        }
    }
    log::info!("Asset loader thread exiting");
}
