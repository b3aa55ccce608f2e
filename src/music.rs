//! Music source
//!
//! Music assets are fetched (local file or http), fully decoded off the
//! control thread, and then installed into the graph as a looping
//! stereo source behind its own gain bus. Decoding everything up front
//! is our equivalent of waiting until the asset can play through without
//! stalling.
//!
//! Pausing keeps the playback position, so play after pause continues
//! where it left off.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::decode;
use crate::audio::{AudioBuffer, GainBus, Graph, Source, SourceId, SourceLayout};
use crate::error::TrackLoadError;
use crate::track::{Track, TrackKind};

/// Where a track url points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    File(PathBuf),
    Remote(String),
}

/// Resolve a track url against the asset root
///
/// - `http://` / `https://` stay remote
/// - `file://` is a literal filesystem path
/// - `/audio/x.mp3` style root-relative urls resolve under `asset_root`
/// - anything else without a scheme is relative to `asset_root`
pub fn resolve_asset(url: &str, asset_root: &Path) -> Result<AssetLocation, TrackLoadError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(AssetLocation::Remote(url.to_string()));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(AssetLocation::File(PathBuf::from(path)));
    }
    if let Some((scheme, _)) = url.split_once("://") {
        return Err(TrackLoadError::UnsupportedScheme(scheme.to_string()));
    }
    Ok(AssetLocation::File(asset_root.join(url.trim_start_matches('/'))))
}

/// Extension used as a decoder hint
fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Fetch the raw bytes of an asset
pub fn fetch_asset(url: &str, asset_root: &Path) -> Result<Vec<u8>, TrackLoadError> {
    match resolve_asset(url, asset_root)? {
        AssetLocation::File(path) => std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrackLoadError::NotFound(path.display().to_string())
            } else {
                TrackLoadError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }
            }
        }),
        AssetLocation::Remote(url) => {
            let network = |message: String| TrackLoadError::Network {
                url: url.clone(),
                message,
            };
            let response = reqwest::blocking::get(&url).map_err(|e| network(e.to_string()))?;
            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(TrackLoadError::NotFound(url.clone()));
            }
            if !status.is_success() {
                return Err(network(format!("HTTP {}", status)));
            }
            let bytes = response.bytes().map_err(|e| network(e.to_string()))?;
            Ok(bytes.to_vec())
        }
    }
}

/// Fetch and decode a music track
///
/// Runs on the loader thread; can take a while for long assets.
pub fn load_music(track: &Track, asset_root: &Path) -> Result<AudioBuffer, TrackLoadError> {
    track.validate()?;
    if track.kind != TrackKind::Music {
        return Err(TrackLoadError::InvalidTrack(
            track.id.clone(),
            "not a music track".to_string(),
        ));
    }
    let url = track.url.as_deref().unwrap_or_default();

    log::info!("Loading music track '{}' from {}", track.name, url);
    let bytes = fetch_asset(url, asset_root)?;
    let ext = extension_of(url);
    let buffer = decode::decode(bytes, ext.as_deref()).map_err(|source| TrackLoadError::Decode {
        url: url.to_string(),
        source,
    })?;

    log::info!(
        "Loaded '{}': {:.1}s, {} Hz, {} ch",
        track.name,
        buffer.duration().as_secs_f32(),
        buffer.sample_rate(),
        buffer.channels()
    );
    Ok(buffer)
}

/// Playback state shared with the audio thread
#[derive(Debug, Default)]
struct MusicControl {
    playing: AtomicBool,
    /// Frame position as f64 bits
    position: AtomicU64,
}

/// Audio-thread side: loops a decoded buffer
struct MusicVoice {
    buffer: Arc<AudioBuffer>,
    control: Arc<MusicControl>,
    position: f64,
}

impl Source for MusicVoice {
    fn layout(&self) -> SourceLayout {
        SourceLayout::Stereo
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32], sample_rate: f32) {
        if !self.control.playing.load(Ordering::Relaxed) {
            return;
        }
        let frames = self.buffer.frames() as f64;
        if frames == 0.0 {
            return;
        }

        // Rate conversion by stepping through the buffer at src/dst speed
        let step = self.buffer.sample_rate() as f64 / sample_rate as f64;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let (sl, sr) = self.buffer.sample_at(self.position, true);
            *l = sl;
            *r = sr;
            self.position += step;
            if self.position >= frames {
                self.position %= frames;
            }
        }
        self.control
            .position
            .store(self.position.to_bits(), Ordering::Relaxed);
    }
}

/// A live music AudioNode: a looping source behind its own gain bus
#[derive(Debug)]
pub struct MusicNode {
    track_id: String,
    bus: GainBus,
    source_id: SourceId,
    control: Arc<MusicControl>,
    sample_rate: u32,
}

impl MusicNode {
    /// Connect a decoded track into the graph, paused at the start
    pub fn install(graph: &mut Graph, track_id: &str, buffer: AudioBuffer, volume: f32) -> Self {
        let control = Arc::new(MusicControl::default());
        let sample_rate = buffer.sample_rate();
        let voice = MusicVoice {
            buffer: Arc::new(buffer),
            control: Arc::clone(&control),
            position: 0.0,
        };

        let (bus, source_id) = graph.add_source_bus(volume, Box::new(voice), None);
        log::info!("Music node installed for '{}'", track_id);

        Self {
            track_id: track_id.to_string(),
            bus,
            source_id,
            control,
            sample_rate,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn bus(&self) -> &GainBus {
        &self.bus
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn is_playing(&self) -> bool {
        self.control.playing.load(Ordering::Relaxed)
    }

    pub fn play(&self) {
        if !self.control.playing.swap(true, Ordering::Relaxed) {
            log::debug!("Music '{}' playing", self.track_id);
        }
    }

    /// Pause without rewinding
    pub fn pause(&self) {
        if self.control.playing.swap(false, Ordering::Relaxed) {
            log::debug!("Music '{}' paused", self.track_id);
        }
    }

    /// Playback position in seconds of the source asset
    pub fn position_seconds(&self) -> f64 {
        f64::from_bits(self.control.position.load(Ordering::Relaxed)) / self.sample_rate.max(1) as f64
    }

    /// Pause and disconnect everything
    pub fn teardown(self, graph: &mut Graph) {
        self.pause();
        graph.disconnect_source(self.source_id);
        graph.disconnect_bus(self.bus.id());
        log::info!("Music node for '{}' torn down", self.track_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::decode::encode_wav;

    /// Write a short stereo WAV into a fresh temp asset root
    pub(crate) fn temp_asset(name: &str, seconds: f32) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "soundbath-test-{}-{}",
            std::process::id(),
            name.replace(['/', '.'], "_")
        ));
        let path = root.join("audio").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        let rate = 8_000u32;
        let frames = (rate as f32 * seconds) as usize;
        let samples: Vec<f32> = (0..frames)
            .flat_map(|i| {
                let s = (i as f32 / rate as f32 * 220.0 * std::f32::consts::TAU).sin() * 0.5;
                [s, -s]
            })
            .collect();
        std::fs::write(&path, encode_wav(&samples, rate, 2).unwrap()).unwrap();
        root
    }

    #[test]
    fn test_resolve() {
        let root = Path::new("/srv/assets");
        assert_eq!(
            resolve_asset("/audio/cosmic-flow.mp3", root).unwrap(),
            AssetLocation::File(PathBuf::from("/srv/assets/audio/cosmic-flow.mp3"))
        );
        assert_eq!(
            resolve_asset("file:///tmp/x.wav", root).unwrap(),
            AssetLocation::File(PathBuf::from("/tmp/x.wav"))
        );
        assert_eq!(
            resolve_asset("https://cdn.example.com/a.mp3", root).unwrap(),
            AssetLocation::Remote("https://cdn.example.com/a.mp3".to_string())
        );
        assert!(matches!(
            resolve_asset("ftp://host/a.mp3", root),
            Err(TrackLoadError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_extension_hint() {
        assert_eq!(extension_of("/audio/a.MP3?v=2").as_deref(), Some("mp3"));
        assert_eq!(extension_of("/audio/noext"), None);
    }

    #[test]
    fn test_load_local_wav() {
        let root = temp_asset("calm.wav", 0.5);
        let track = Track::music("calm", "Calm", "/audio/calm.wav");
        let buffer = load_music(&track, &root).unwrap();
        assert_eq!(buffer.channels(), 2);
        assert_eq!(buffer.frames(), 4_000);
    }

    #[test]
    fn test_missing_asset() {
        let track = Track::music("gone", "Gone", "/audio/gone.mp3");
        let result = load_music(&track, Path::new("/nonexistent-root"));
        assert!(matches!(result, Err(TrackLoadError::NotFound(_))));
    }

    #[test]
    fn test_undecodable_asset() {
        let root = std::env::temp_dir().join(format!("soundbath-test-{}-junk", std::process::id()));
        std::fs::create_dir_all(root.join("audio")).unwrap();
        std::fs::write(root.join("audio").join("junk.mp3"), b"not audio at all").unwrap();

        let track = Track::music("junk", "Junk", "/audio/junk.mp3");
        let result = load_music(&track, &root);
        assert!(matches!(result, Err(TrackLoadError::Decode { .. })));
    }

    #[test]
    fn test_pause_keeps_position() {
        let mut graph = Graph::new(0.0);
        let buffer = AudioBuffer::new(vec![0.25; 16_000], 8_000, 2);
        let node = MusicNode::install(&mut graph, "m", buffer, 1.0);

        let mut l = vec![0.0; 800];
        let mut r = vec![0.0; 800];

        // Paused on install: silent and not advancing
        graph.process(&mut l, &mut r, 8_000.0);
        assert!(l.iter().all(|&s| s == 0.0));
        assert_eq!(node.position_seconds(), 0.0);

        node.play();
        graph.process(&mut l, &mut r, 8_000.0);
        assert!((l[0] - 0.25).abs() < 1e-6);
        let at_pause = node.position_seconds();
        assert!((at_pause - 0.1).abs() < 1e-9);

        node.pause();
        graph.process(&mut l, &mut r, 8_000.0);
        assert_eq!(node.position_seconds(), at_pause);

        node.play();
        graph.process(&mut l, &mut r, 8_000.0);
        assert!((node.position_seconds() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_loops_seamlessly() {
        let mut graph = Graph::new(0.0);
        let buffer = AudioBuffer::new(vec![0.5; 200], 8_000, 2); // 100 frames
        let node = MusicNode::install(&mut graph, "m", buffer, 1.0);
        node.play();

        let mut l = vec![0.0; 250];
        let mut r = vec![0.0; 250];
        graph.process(&mut l, &mut r, 8_000.0);
        assert!(l.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!((node.position_seconds() - 50.0 / 8_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_teardown() {
        let mut graph = Graph::new(5.0);
        let buffer = AudioBuffer::new(vec![0.0; 100], 8_000, 2);
        let node = MusicNode::install(&mut graph, "m", buffer, 0.4);
        let id = node.source_id();
        assert_eq!(node.bus().value(), 0.4);
        node.teardown(&mut graph);
        assert!(!graph.contains_source(id));
        assert_eq!(graph.bus_count(), 0);
    }
}
