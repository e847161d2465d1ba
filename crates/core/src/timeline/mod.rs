use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{KaraokeError, Result};

mod sync;

pub use sync::{SyncPhase, SyncUpdate, Synchronizer};

/// Seam to the external media player that actually plays the backing track.
pub trait MediaPlayer {
    /// Milliseconds played since the last call to [`MediaPlayer::play`], or
    /// `None` while the player cannot tell.
    fn position_ms(&self) -> Option<f64>;

    /// Loads `source` (replacing whatever was loaded) and starts playing at
    /// `start_seconds`.
    fn play(&mut self, source: &Path, start_seconds: f64) -> Result<()>;

    fn pause(&mut self);

    fn resume(&mut self);

    fn stop(&mut self);

    /// True while a track is loaded and has not finished.
    fn is_busy(&self) -> bool;
}

/// Which recording of a song is playing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackVariant {
    #[default]
    Instrumental,
    Vocal,
}

/// Audio files available for a song.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongTracks {
    /// Track played by default. Normally the instrumental.
    pub main: PathBuf,
    /// Original recording with vocals, when it can be toggled to.
    pub vocal: Option<PathBuf>,
}

impl SongTracks {
    pub const INSTRUMENTAL_FILE: &'static str = "instrumental.mp3";
    pub const ORIGINAL_FILE: &'static str = "original.mp3";

    /// Looks for `instrumental.mp3` and `original.mp3` in a song directory.
    /// The original becomes the main track when no instrumental exists.
    pub fn discover(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let instrumental = dir.join(Self::INSTRUMENTAL_FILE);
        let original = dir.join(Self::ORIGINAL_FILE);
        match (instrumental.is_file(), original.is_file()) {
            (true, true) => Ok(Self {
                main: instrumental,
                vocal: Some(original),
            }),
            (true, false) => Ok(Self {
                main: instrumental,
                vocal: None,
            }),
            (false, true) => Ok(Self {
                main: original,
                vocal: None,
            }),
            (false, false) => Err(KaraokeError::msg(format!(
                "no playable audio in `{}`",
                dir.display()
            ))),
        }
    }

    fn path(&self, variant: TrackVariant) -> Option<&Path> {
        match variant {
            TrackVariant::Instrumental => Some(self.main.as_path()),
            TrackVariant::Vocal => self.vocal.as_deref(),
        }
    }
}

/// Turns the media player's position into the single elapsed time used for
/// both lyrics and scoring.
///
/// The player reports position relative to the point it was last started
/// from, so every (re)start records that point as a manual offset.
#[derive(Debug)]
pub struct PlaybackClock<P> {
    player: P,
    manual_offset_ms: f64,
    duration_ms: Option<f64>,
    tracks: Option<SongTracks>,
    variant: TrackVariant,
}

impl<P: MediaPlayer> PlaybackClock<P> {
    pub fn new(player: P) -> Self {
        Self {
            player,
            manual_offset_ms: 0.0,
            duration_ms: None,
            tracks: None,
            variant: TrackVariant::Instrumental,
        }
    }

    /// Starts a new song from the top on its main track.
    pub fn load(&mut self, tracks: SongTracks, duration_ms: Option<f64>) -> Result<()> {
        self.player.play(&tracks.main, 0.0)?;
        self.tracks = Some(tracks);
        self.duration_ms = duration_ms.filter(|d| *d > 0.0);
        self.variant = TrackVariant::Instrumental;
        self.reset();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.manual_offset_ms = 0.0;
    }

    /// Player position plus manual offset. An unknown position counts as
    /// zero.
    pub fn elapsed_ms(&self) -> f64 {
        self.player.position_ms().unwrap_or(0.0) + self.manual_offset_ms
    }

    pub fn manual_offset_ms(&self) -> f64 {
        self.manual_offset_ms
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.duration_ms
    }

    pub fn variant(&self) -> TrackVariant {
        self.variant
    }

    /// Moves playback by `delta_seconds` and returns the new absolute
    /// position in milliseconds.
    ///
    /// The target is clamped to `[0, duration - 1s]` when the duration is
    /// known. On failure the clock is left untouched.
    pub fn seek(&mut self, delta_seconds: f64) -> Result<f64> {
        let source = self.current_source()?;
        let mut target = (self.elapsed_ms() / 1000.0 + delta_seconds).max(0.0);
        if let Some(duration) = self.duration_ms {
            let last = (duration / 1000.0 - 1.0).max(0.0);
            target = target.min(last);
        }

        self.player.play(&source, target)?;
        self.manual_offset_ms = target * 1000.0;
        tracing::debug!(target_seconds = target, "seek");
        Ok(self.manual_offset_ms)
    }

    /// Swaps between the instrumental and the vocal recording, keeping the
    /// elapsed time continuous. Returns the new variant, or `None` when the
    /// song has no alternative recording.
    pub fn toggle_variant(&mut self) -> Result<Option<TrackVariant>> {
        let next = match self.variant {
            TrackVariant::Instrumental => TrackVariant::Vocal,
            TrackVariant::Vocal => TrackVariant::Instrumental,
        };
        let Some(source) = self
            .tracks
            .as_ref()
            .and_then(|tracks| tracks.path(next))
            .map(Path::to_path_buf)
        else {
            return Ok(None);
        };

        let at_ms = self.elapsed_ms();
        self.player.play(&source, at_ms / 1000.0)?;
        self.manual_offset_ms = at_ms;
        self.variant = next;
        tracing::info!(variant = ?next, at_ms, "switched audio track");
        Ok(Some(next))
    }

    pub fn pause(&mut self) {
        self.player.pause();
    }

    pub fn resume(&mut self) {
        self.player.resume();
    }

    /// Stops playback and forgets the song.
    pub fn stop(&mut self) {
        self.player.stop();
        self.tracks = None;
        self.duration_ms = None;
        self.variant = TrackVariant::Instrumental;
        self.reset();
    }

    pub fn is_playing(&self) -> bool {
        self.tracks.is_some() && self.player.is_busy()
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn player_mut(&mut self) -> &mut P {
        &mut self.player
    }

    fn current_source(&self) -> Result<PathBuf> {
        self.tracks
            .as_ref()
            .and_then(|tracks| tracks.path(self.variant))
            .map(Path::to_path_buf)
            .ok_or_else(|| KaraokeError::msg("no track loaded"))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    use crate::{KaraokeError, MediaPlayer, Result};

    /// Player whose position is set by hand.
    #[derive(Debug, Default)]
    pub struct ScriptedPlayer {
        pub position: Option<f64>,
        pub plays: Vec<(PathBuf, f64)>,
        pub paused: bool,
        pub busy: bool,
        pub fail_next_play: bool,
    }

    impl MediaPlayer for ScriptedPlayer {
        fn position_ms(&self) -> Option<f64> {
            self.position
        }

        fn play(&mut self, source: &Path, start_seconds: f64) -> Result<()> {
            if self.fail_next_play {
                self.fail_next_play = false;
                return Err(KaraokeError::msg("cannot play"));
            }
            self.plays.push((source.to_path_buf(), start_seconds));
            self.position = Some(0.0);
            self.busy = true;
            self.paused = false;
            Ok(())
        }

        fn pause(&mut self) {
            self.paused = true;
        }

        fn resume(&mut self) {
            self.paused = false;
        }

        fn stop(&mut self) {
            self.busy = false;
            self.position = None;
        }

        fn is_busy(&self) -> bool {
            self.busy
        }
    }
}
