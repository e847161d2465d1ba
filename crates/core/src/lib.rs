//! Core library for the karaoke player.
//!
//! Each module owns one subsystem: live microphone capture and monitoring
//! (`audio`), vocal-presence scoring (`scoring`), timestamped lyric scripts
//! (`lyrics`), the playback clock and lyric synchronizer (`timeline`), and a
//! small session type tying them together for one song at a time
//! (`session`). The user interface and media decoding live outside this
//! crate, behind the [`AudioBackend`] and [`MediaPlayer`] traits.

pub mod audio;
pub mod config;
pub mod error;
pub mod lyrics;
pub mod scoring;
pub mod session;
pub mod timeline;

pub use audio::{
    AudioBackend, AudioEngine, CaptureMixer, DeviceCatalog, DeviceDescriptor, EngineCommand,
    EnginePhase, InputStream, MicLevels, MockBackend, OutputFormat, OutputStream,
    StreamLifecycleManager, StreamStatus,
};
#[cfg(feature = "cpal")]
pub use audio::CpalBackend;
pub use config::{AppConfig, AudioConfig, Difficulty, PlayerConfig};
pub use error::{DeviceError, KaraokeError, Result};
pub use lyrics::{LyricLine, LyricScript, LyricTimeline, LyricWord, ScriptKind};
pub use scoring::{ScoreSnapshot, ScoringEngine};
pub use session::{KaraokeSession, Song};
pub use timeline::{
    MediaPlayer, PlaybackClock, SongTracks, SyncPhase, SyncUpdate, Synchronizer, TrackVariant,
};
