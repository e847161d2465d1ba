use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use karaoke_core::{KaraokeError, MediaPlayer, Result};

/// Stand-in media player for headless runs. Nothing is decoded; the
/// position simply follows the wall clock from the last `play`.
#[derive(Debug, Default)]
pub struct WallClockPlayer {
    source: Option<PathBuf>,
    started: Option<Instant>,
    paused_at: Option<Instant>,
    start_ms: f64,
    length_ms: Option<f64>,
}

impl WallClockPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute length of the track. The player stops being busy once the
    /// position passes it.
    pub fn set_length_ms(&mut self, length_ms: Option<f64>) {
        self.length_ms = length_ms;
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    fn played(&self) -> Option<Duration> {
        let started = self.started?;
        let now = self.paused_at.unwrap_or_else(Instant::now);
        Some(now.saturating_duration_since(started))
    }
}

impl MediaPlayer for WallClockPlayer {
    fn position_ms(&self) -> Option<f64> {
        self.played().map(|played| played.as_secs_f64() * 1000.0)
    }

    fn play(&mut self, source: &Path, start_seconds: f64) -> Result<()> {
        if !source.is_file() {
            return Err(KaraokeError::msg(format!(
                "cannot play `{}`: no such file",
                source.display()
            )));
        }
        self.source = Some(source.to_path_buf());
        self.started = Some(Instant::now());
        self.paused_at = None;
        self.start_ms = start_seconds.max(0.0) * 1000.0;
        Ok(())
    }

    fn pause(&mut self) {
        if self.started.is_some() && self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let (Some(started), Some(paused_at)) = (self.started, self.paused_at.take()) {
            self.started = Some(started + paused_at.elapsed());
        }
    }

    fn stop(&mut self) {
        self.source = None;
        self.started = None;
        self.paused_at = None;
        self.start_ms = 0.0;
    }

    fn is_busy(&self) -> bool {
        let Some(position) = self.position_ms() else {
            return false;
        };
        match self.length_ms {
            Some(length) => self.start_ms + position < length,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_position_before_play() {
        let player = WallClockPlayer::new();
        assert_eq!(player.position_ms(), None);
        assert!(!player.is_busy());
    }

    #[test]
    fn refuses_missing_files() {
        let mut player = WallClockPlayer::new();
        assert!(player.play(Path::new("/definitely/not/here.mp3"), 0.0).is_err());
        assert!(player.source().is_none());
    }

    #[test]
    fn pause_freezes_position() {
        let file = std::env::current_exe().unwrap();
        let mut player = WallClockPlayer::new();
        player.play(&file, 0.0).unwrap();
        player.pause();
        let frozen = player.position_ms().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(player.position_ms().unwrap(), frozen);

        player.resume();
        std::thread::sleep(Duration::from_millis(10));
        assert!(player.position_ms().unwrap() > frozen);
    }

    #[test]
    fn busy_until_length_reached() {
        let file = std::env::current_exe().unwrap();
        let mut player = WallClockPlayer::new();
        player.set_length_ms(Some(10_000.0));
        player.play(&file, 5.0).unwrap();
        assert!(player.is_busy());
        player.play(&file, 10.0).unwrap();
        assert!(!player.is_busy());
        player.stop();
        assert!(!player.is_busy());
    }
}
