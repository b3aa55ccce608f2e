//! Track descriptors, slots and mix settings
//!
//! Tracks are immutable records picked from a static catalog. The engine
//! only ever holds them by value and never mutates them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TrackLoadError;

/// What a track produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Music,
    Binaural,
    Recording,
}

/// An immutable track descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TrackKind,
    /// Asset location, required for music tracks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Beat frequency in Hz, required for binaural tracks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f32>,
}

impl Track {
    /// A music track streamed from `url`
    pub fn music(id: &str, name: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: TrackKind::Music,
            url: Some(url.to_string()),
            frequency: None,
        }
    }

    /// A binaural track beating at `frequency` Hz
    pub fn binaural(id: &str, name: &str, frequency: f32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: TrackKind::Binaural,
            url: None,
            frequency: Some(frequency),
        }
    }

    /// Check the descriptor is internally consistent
    ///
    /// A url belongs to music tracks only and a frequency to binaural
    /// tracks only. Music needs a non-empty url, binaural a positive
    /// finite frequency. Recording tracks carry neither.
    pub fn validate(&self) -> Result<(), TrackLoadError> {
        let invalid = |why: &str| Err(TrackLoadError::InvalidTrack(self.id.clone(), why.to_string()));

        if self.kind != TrackKind::Music && self.url.is_some() {
            return invalid("only music tracks carry a url");
        }
        if self.kind != TrackKind::Binaural && self.frequency.is_some() {
            return invalid("only binaural tracks carry a frequency");
        }

        match self.kind {
            TrackKind::Music => match &self.url {
                Some(url) if !url.trim().is_empty() => Ok(()),
                _ => invalid("music track has no url"),
            },
            TrackKind::Binaural => match self.frequency {
                Some(f) if f.is_finite() && f > 0.0 => Ok(()),
                Some(_) => invalid("binaural frequency must be > 0"),
                None => invalid("binaural track has no frequency"),
            },
            TrackKind::Recording => Ok(()),
        }
    }
}

/// A track slot the engine keeps one AudioNode for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Music,
    Binaural,
}

impl Slot {
    /// The track kind this slot accepts
    pub fn kind(self) -> TrackKind {
        match self {
            Slot::Music => TrackKind::Music,
            Slot::Binaural => TrackKind::Binaural,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Music => write!(f, "music"),
            Slot::Binaural => write!(f, "binaural"),
        }
    }
}

/// A volume control target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeSlot {
    Music,
    Binaural,
    Recording,
}

/// Per-source volumes, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixSettings {
    pub music_volume: f32,
    pub binaural_volume: f32,
    pub recording_volume: f32,
}

impl Default for MixSettings {
    fn default() -> Self {
        Self {
            music_volume: 0.4,
            binaural_volume: 0.3,
            recording_volume: 0.5,
        }
    }
}

impl MixSettings {
    pub fn get(&self, slot: VolumeSlot) -> f32 {
        match slot {
            VolumeSlot::Music => self.music_volume,
            VolumeSlot::Binaural => self.binaural_volume,
            VolumeSlot::Recording => self.recording_volume,
        }
    }

    /// Store a clamped value and return what was stored
    pub fn set(&mut self, slot: VolumeSlot, value: f32) -> f32 {
        let value = clamp_volume(value);
        match slot {
            VolumeSlot::Music => self.music_volume = value,
            VolumeSlot::Binaural => self.binaural_volume = value,
            VolumeSlot::Recording => self.recording_volume = value,
        }
        value
    }

    /// Copy with every field clamped into range
    pub fn sanitized(self) -> Self {
        Self {
            music_volume: clamp_volume(self.music_volume),
            binaural_volume: clamp_volume(self.binaural_volume),
            recording_volume: clamp_volume(self.recording_volume),
        }
    }
}

/// Clamp to [0, 1]; NaN becomes silence
pub fn clamp_volume(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// The built-in track catalog
pub mod catalog {
    use super::Track;

    pub fn music_tracks() -> Vec<Track> {
        vec![
            Track::music("cosmic-flow", "Cosmic Flow", "/audio/cosmic-flow.mp3"),
            Track::music("deep-ocean", "Deep Ocean", "/audio/deep-ocean.mp3"),
            Track::music("forest-night", "Forest Night", "/audio/forest-night.mp3"),
        ]
    }

    pub fn binaural_tracks() -> Vec<Track> {
        vec![
            Track::binaural("delta", "Delta Waves (Deep Sleep)", 2.5),
            Track::binaural("theta", "Theta Waves (Deep Relaxation)", 6.0),
            Track::binaural("alpha", "Alpha Waves (Light Relaxation)", 10.0),
        ]
    }

    /// Look a track up by id across both lists
    pub fn find(id: &str) -> Option<Track> {
        music_tracks()
            .into_iter()
            .chain(binaural_tracks())
            .find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_tracks_are_valid() {
        for track in catalog::music_tracks().iter().chain(catalog::binaural_tracks().iter()) {
            assert!(track.validate().is_ok(), "{} should be valid", track.id);
        }
        assert_eq!(catalog::find("theta").and_then(|t| t.frequency), Some(6.0));
        assert!(catalog::find("nope").is_none());
    }

    #[test]
    fn test_validate_rejects_inconsistent_tracks() {
        let mut t = Track::binaural("bad", "Bad", 0.0);
        assert!(t.validate().is_err());
        t.frequency = Some(f32::NAN);
        assert!(t.validate().is_err());
        t.frequency = None;
        assert!(t.validate().is_err());

        let mut m = Track::music("m", "M", "");
        assert!(m.validate().is_err());
        m.url = None;
        assert!(m.validate().is_err());

        let mut stray_url = Track::binaural("theta", "Theta", 6.0);
        stray_url.url = Some("/audio/x.mp3".to_string());
        assert!(matches!(stray_url.validate(), Err(TrackLoadError::InvalidTrack(..))));

        let mut stray_freq = Track::music("m", "M", "/audio/m.mp3");
        stray_freq.frequency = Some(6.0);
        assert!(stray_freq.validate().is_err());

        let mut recording = Track {
            kind: TrackKind::Recording,
            url: None,
            frequency: None,
            ..stray_freq.clone()
        };
        assert!(recording.validate().is_ok());
        recording.url = Some("/audio/m.mp3".to_string());
        assert!(recording.validate().is_err());
        recording.url = None;
        recording.frequency = Some(2.5);
        assert!(recording.validate().is_err());
    }

    #[test]
    fn test_mix_settings_clamp() {
        let mut mix = MixSettings::default();
        assert_eq!(mix.set(VolumeSlot::Music, 1.7), 1.0);
        assert_eq!(mix.set(VolumeSlot::Binaural, -0.2), 0.0);
        assert_eq!(mix.set(VolumeSlot::Recording, f32::NAN), 0.0);
        assert_eq!(mix.get(VolumeSlot::Music), 1.0);
    }

    #[test]
    fn test_track_json_shape() {
        let json = serde_json::to_string(&Track::binaural("theta", "Theta", 6.0)).unwrap();
        assert!(json.contains("\"type\":\"binaural\""));
        assert!(!json.contains("url"));
    }
}
