use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{AudioBackend, AudioEngine};
use crate::{
    LyricLine, LyricScript, LyricTimeline, MediaPlayer, PlaybackClock, PlayerConfig, Result,
    ScriptKind, SongTracks, SyncUpdate, Synchronizer, TrackVariant,
};

/// How long `start` waits for the worker to confirm its streams are open.
const RESUME_WAIT: Duration = Duration::from_secs(2);

/// Everything needed to play one song.
#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    pub title: String,
    pub dir: PathBuf,
    pub tracks: SongTracks,
    /// Lyric scripts found for the song, in preference order.
    pub scripts: Vec<LyricScript>,
    pub duration_ms: Option<f64>,
}

impl Song {
    /// Reads a song directory. Fails only when there is nothing to play;
    /// missing lyrics just mean the song is never scored.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let tracks = SongTracks::discover(dir)?;
        let scripts = LyricScript::discover(dir);
        if scripts.is_empty() {
            tracing::warn!(dir = %dir.display(), "song has no lyric script");
        }
        let title = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untitled".into());

        Ok(Self {
            title,
            dir: dir.to_path_buf(),
            tracks,
            scripts,
            duration_ms: None,
        })
    }

    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Drives one song at a time: playback clock, lyric synchronizer and the
/// audio engine's singing flag.
pub struct KaraokeSession<B: AudioBackend, P: MediaPlayer> {
    engine: AudioEngine<B>,
    clock: PlaybackClock<P>,
    sync: Synchronizer,
    timeline: LyricTimeline,
    scripts: Vec<LyricScript>,
    script_index: usize,
    config: PlayerConfig,
    title: Option<String>,
    paused: bool,
}

impl<B: AudioBackend, P: MediaPlayer> KaraokeSession<B, P> {
    pub fn new(engine: AudioEngine<B>, player: P, config: PlayerConfig) -> Self {
        Self {
            engine,
            clock: PlaybackClock::new(player),
            sync: Synchronizer::new(),
            timeline: LyricTimeline::empty(),
            scripts: Vec::new(),
            script_index: 0,
            config,
            title: None,
            paused: true,
        }
    }

    /// Starts `song` from the top.
    ///
    /// The score is reset before the engine resumes, so nothing from a
    /// previous song can leak into this one.
    pub fn start(&mut self, song: &Song) -> Result<SyncUpdate> {
        self.engine.set_singing_segment(false);
        self.clock.load(song.tracks.clone(), song.duration_ms)?;

        self.scripts = song.scripts.clone();
        self.script_index = 0;
        self.timeline = self
            .scripts
            .first()
            .map(LyricScript::load)
            .unwrap_or_default();

        self.engine.reset()?;
        self.engine.set_paused(false)?;
        if !self.engine.sync(RESUME_WAIT) {
            tracing::warn!("audio engine has not confirmed resume yet");
        }

        self.paused = false;
        self.title = Some(song.title.clone());
        tracing::info!(
            title = %song.title,
            lines = self.timeline.len(),
            scripts = self.scripts.len(),
            "song started"
        );
        Ok(self.sync.start(&self.timeline))
    }

    /// One display tick: reads the clock, advances the lyrics and tells the
    /// engine whether singing is expected right now.
    pub fn tick(&mut self) -> SyncUpdate {
        let update = self.sync.tick(&self.timeline, self.clock.elapsed_ms());
        self.engine
            .set_singing_segment(update.singing_expected && !self.paused);
        update
    }

    /// Moves playback by `delta_seconds` and resynchronizes the lyrics. A
    /// paused session stays paused at the new position.
    pub fn seek(&mut self, delta_seconds: f64) -> Result<SyncUpdate> {
        let target_ms = self.clock.seek(delta_seconds)?;
        if self.paused {
            self.clock.pause();
        }
        let update = self.sync.seek(&self.timeline, target_ms);
        self.engine
            .set_singing_segment(update.singing_expected && !self.paused);
        Ok(update)
    }

    pub fn seek_forward(&mut self) -> Result<SyncUpdate> {
        self.seek(self.config.seek_step_seconds)
    }

    pub fn seek_backward(&mut self) -> Result<SyncUpdate> {
        self.seek(-self.config.seek_step_seconds)
    }

    /// Switches between the instrumental and the vocal recording.
    pub fn toggle_track(&mut self) -> Result<Option<TrackVariant>> {
        self.clock.toggle_variant()
    }

    /// Moves to the next lyric script of the song, if there is more than
    /// one, and restarts the page pointer on it.
    pub fn switch_lyrics(&mut self) -> Option<ScriptKind> {
        if self.scripts.len() < 2 {
            return None;
        }
        self.script_index = (self.script_index + 1) % self.scripts.len();
        let script = &self.scripts[self.script_index];
        self.timeline = script.load();
        self.sync.start(&self.timeline);
        tracing::info!(kind = ?script.kind, lines = self.timeline.len(), "lyric script switched");
        Some(script.kind)
    }

    /// Pauses or resumes both playback and capture. Returns the new paused
    /// state.
    pub fn toggle_pause(&mut self) -> Result<bool> {
        if self.paused {
            self.clock.resume();
            self.engine.set_paused(false)?;
            self.paused = false;
        } else {
            self.engine.set_singing_segment(false);
            self.engine.set_paused(true)?;
            self.clock.pause();
            self.paused = true;
        }
        Ok(self.paused)
    }

    /// Ends the song and returns its score.
    ///
    /// Capture is paused and the worker confirmed idle before the score is
    /// read, so the value cannot change afterwards.
    pub fn finish(&mut self, timeout: Duration) -> Result<u8> {
        self.engine.set_singing_segment(false);
        if !self.engine.pause_and_wait(timeout)? {
            tracing::warn!(?timeout, "audio engine did not confirm pause before scoring");
        }
        self.clock.stop();
        self.sync.stop(&self.timeline);
        self.paused = true;

        let score = self.engine.score()?;
        tracing::info!(
            title = self.title.as_deref().unwrap_or("untitled"),
            score,
            "song finished"
        );
        self.title = None;
        Ok(score)
    }

    /// True once playback has stopped or the known duration has been
    /// reached.
    pub fn song_over(&self) -> bool {
        if self.title.is_none() {
            return true;
        }
        let past_end = self
            .clock
            .duration_ms()
            .is_some_and(|duration| self.clock.elapsed_ms() >= duration);
        past_end || !self.clock.is_playing()
    }

    /// Line to show, which may run slightly ahead of the sung line.
    pub fn display_line(&self) -> Option<&LyricLine> {
        self.timeline
            .display_line(self.clock.elapsed_ms(), self.config.lyric_lead_in_ms)
            .and_then(|index| self.timeline.get(index))
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.clock.elapsed_ms()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn timeline(&self) -> &LyricTimeline {
        &self.timeline
    }

    pub fn script(&self) -> Option<&LyricScript> {
        self.scripts.get(self.script_index)
    }

    pub fn page_index(&self) -> Option<usize> {
        self.sync.page_index()
    }

    pub fn engine(&self) -> &AudioEngine<B> {
        &self.engine
    }

    pub fn clock(&self) -> &PlaybackClock<P> {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut PlaybackClock<P> {
        &mut self.clock
    }

    /// Stops playback and the audio worker.
    pub fn shutdown(mut self, timeout: Duration) {
        self.clock.stop();
        self.engine.shutdown(timeout);
    }
}
