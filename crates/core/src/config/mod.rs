use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_CHUNK_FRAMES: usize = 2048;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

impl AppConfig {
    /// Loads a configuration file. Missing sections fall back to defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Scoring difficulty. Each level maps to a fixed vocal energy threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

impl Difficulty {
    /// Level a chunk has to exceed to count as a hit.
    pub fn threshold(self) -> f32 {
        match self {
            Difficulty::Easy => 1.5,
            Difficulty::Normal => 7.0,
            Difficulty::Hard => 15.0,
        }
    }
}

impl std::str::FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "normal" => Ok(Difficulty::Normal),
            "hard" => Ok(Difficulty::Hard),
            other => Err(format!("unknown difficulty `{other}`")),
        }
    }
}

/// Configuration specific to the audio subsystem.
///
/// The orchestrator owns this value and hands snapshots to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub mic1_device: Option<usize>,
    pub mic2_device: Option<usize>,
    pub monitoring_enabled: bool,
    pub chunk_frames: usize,
    pub sample_rate: u32,
    pub difficulty: Difficulty,
    pub gain_mic1: f32,
    pub gain_mic2: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mic1_device: None,
            mic2_device: None,
            monitoring_enabled: false,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            sample_rate: DEFAULT_SAMPLE_RATE,
            difficulty: Difficulty::default(),
            gain_mic1: 1.0,
            gain_mic2: 1.0,
        }
    }
}

impl AudioConfig {
    /// True when moving from `self` to `other` means the open streams no
    /// longer match. Gain and difficulty are applied live.
    pub fn requires_restart(&self, other: &AudioConfig) -> bool {
        self.mic1_device != other.mic1_device
            || self.mic2_device != other.mic2_device
            || self.monitoring_enabled != other.monitoring_enabled
            || self.chunk_frames != other.chunk_frames
            || self.sample_rate != other.sample_rate
    }

    /// Returns a copy with gains clamped to be non-negative and a usable
    /// chunk size and sample rate.
    pub fn sanitized(mut self) -> Self {
        self.gain_mic1 = clamp_gain(self.gain_mic1);
        self.gain_mic2 = clamp_gain(self.gain_mic2);
        if self.chunk_frames == 0 {
            self.chunk_frames = DEFAULT_CHUNK_FRAMES;
        }
        if self.sample_rate == 0 {
            self.sample_rate = DEFAULT_SAMPLE_RATE;
        }
        self
    }

    /// Wall-clock length of one chunk at the configured rate.
    pub fn chunk_duration(&self) -> std::time::Duration {
        let rate = self.sample_rate.max(1) as f64;
        std::time::Duration::from_secs_f64(self.chunk_frames as f64 / rate)
    }
}

fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        0.0
    } else {
        gain.max(0.0)
    }
}

/// Settings for the playback side of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// How early a line is shown before its start time.
    pub lyric_lead_in_ms: f64,
    pub seek_step_seconds: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            lyric_lead_in_ms: 200.0,
            seek_step_seconds: 10.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_and_difficulty_changes_do_not_restart_streams() {
        let base = AudioConfig {
            mic1_device: Some(1),
            ..Default::default()
        };
        let tweaked = AudioConfig {
            gain_mic1: 1.8,
            difficulty: Difficulty::Hard,
            ..base.clone()
        };
        assert!(!base.requires_restart(&tweaked));

        let moved = AudioConfig {
            chunk_frames: 1024,
            ..base.clone()
        };
        assert!(base.requires_restart(&moved));

        let monitored = AudioConfig {
            monitoring_enabled: true,
            ..base.clone()
        };
        assert!(base.requires_restart(&monitored));
    }

    #[test]
    fn sanitizing_clamps_negative_gain() {
        let config = AudioConfig {
            gain_mic1: -2.0,
            gain_mic2: f32::NAN,
            chunk_frames: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.gain_mic1, 0.0);
        assert_eq!(config.gain_mic2, 0.0);
        assert_eq!(config.chunk_frames, DEFAULT_CHUNK_FRAMES);
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"audio":{"mic1_device":2,"difficulty":"hard"}}"#).unwrap();
        assert_eq!(config.audio.mic1_device, Some(2));
        assert_eq!(config.audio.difficulty, Difficulty::Hard);
        assert_eq!(config.audio.chunk_frames, DEFAULT_CHUNK_FRAMES);
        assert_eq!(config.player, PlayerConfig::default());
    }

    #[test]
    fn difficulty_thresholds() {
        assert_eq!(Difficulty::Easy.threshold(), 1.5);
        assert_eq!(Difficulty::Normal.threshold(), 7.0);
        assert_eq!(Difficulty::Hard.threshold(), 15.0);
        assert_eq!("HARD".parse::<Difficulty>(), Ok(Difficulty::Hard));
        assert!("medium".parse::<Difficulty>().is_err());
    }
}
