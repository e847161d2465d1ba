use serde::{Deserialize, Serialize};

use crate::LyricTimeline;

/// A line starting this soon after a long silence gets a countdown.
const CUE_WINDOW_MS: f64 = 4000.0;
/// Silence before a line long enough to warrant a countdown.
const CUE_GAP_MS: f64 = 6000.0;
/// How early an upcoming line is normally shown.
const SHOW_AHEAD_MS: f64 = 8000.0;
/// Silence that counts as an instrumental break.
const BREAK_GAP_MS: f64 = 8000.0;
/// How long a finished line stays up.
const LINGER_MS: f64 = 1000.0;
/// Number of countdown dots.
pub const CUE_DOTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// No song running; the page pointer is undefined.
    BeforeStart,
    /// Walking forward through the lines.
    Advancing,
    /// The page pointer is past the last line.
    Ended,
}

/// What the synchronizer decided for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncUpdate {
    pub elapsed_ms: f64,
    /// Line whose interval contains the elapsed time. Drives scoring.
    pub active_line: Option<usize>,
    /// Display pointer. `None` before the song starts.
    pub page_index: Option<usize>,
    pub singing_expected: bool,
    /// True when this tick moved the page pointer forward.
    pub page_advanced: bool,
    pub phase: SyncPhase,
    /// Whether the page line should be on screen yet (or still).
    pub page_visible: bool,
    /// The line after the page line, once it is close enough to preview.
    pub preview_line: Option<usize>,
    /// Seconds left before the page line starts, while a countdown runs.
    /// Only lines after the intro or a long silence get one.
    pub cue_seconds: Option<f64>,
    /// Set during a long gap between two sung lines.
    pub instrumental_break: bool,
}

impl SyncUpdate {
    /// How many of the [`CUE_DOTS`] countdown dots are lit: one at four
    /// seconds, all of them in the last second.
    pub fn cue_dots(&self) -> usize {
        self.cue_seconds.map_or(0, |left| {
            (0..CUE_DOTS)
                .filter(|&dot| left <= (CUE_DOTS - dot) as f64)
                .count()
        })
    }
}

/// Display timing derived from the page pointer.
#[derive(Debug, Default)]
struct PageCues {
    page_visible: bool,
    preview_line: Option<usize>,
    cue_seconds: Option<f64>,
    instrumental_break: bool,
}

impl PageCues {
    fn at(timeline: &LyricTimeline, page: Option<usize>, elapsed_ms: f64) -> Self {
        let Some((page, line)) = page.and_then(|page| Some((page, timeline.get(page)?))) else {
            return Self::default();
        };

        // `None` for the first line: the intro counts as a long gap.
        let gap_before = page
            .checked_sub(1)
            .and_then(|prev| timeline.get(prev))
            .map(|prev| line.start_ms - prev.end_ms);
        let until_start = line.start_ms - elapsed_ms;

        let cued = gap_before.map_or(true, |gap| gap > CUE_GAP_MS);
        let cue_seconds = (cued && until_start > 0.0 && until_start <= CUE_WINDOW_MS)
            .then_some(until_start / 1000.0);

        let after_break = gap_before.map_or(true, |gap| gap > BREAK_GAP_MS);
        let show_ahead = if after_break { CUE_WINDOW_MS } else { SHOW_AHEAD_MS };
        let page_visible = until_start <= show_ahead && elapsed_ms <= line.end_ms + LINGER_MS;

        let preview_line = timeline
            .get(page + 1)
            .filter(|next| {
                let ahead = if next.start_ms - line.end_ms > BREAK_GAP_MS {
                    CUE_WINDOW_MS
                } else {
                    SHOW_AHEAD_MS
                };
                next.start_ms - elapsed_ms <= ahead
            })
            .map(|_| page + 1);

        Self {
            page_visible,
            preview_line,
            cue_seconds,
            instrumental_break: page > 0 && until_start > BREAK_GAP_MS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SyncEvent {
    Start,
    Tick(f64),
    Seek(f64),
    Stop,
}

/// Keeps the lyric page pointer in step with playback.
///
/// All pointer mutation goes through [`Synchronizer::transition`]. Under
/// normal playback the pointer only moves forward, one line per tick; only a
/// seek or a restart may move it back.
#[derive(Debug, Clone, Default)]
pub struct Synchronizer {
    page_index: Option<usize>,
    active_line: Option<usize>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points at the first line. Used at song start and after the lyric
    /// source is switched.
    pub fn start(&mut self, timeline: &LyricTimeline) -> SyncUpdate {
        self.transition(timeline, SyncEvent::Start)
    }

    /// Advances for the current playback position.
    pub fn tick(&mut self, timeline: &LyricTimeline, elapsed_ms: f64) -> SyncUpdate {
        self.transition(timeline, SyncEvent::Tick(elapsed_ms))
    }

    /// Recomputes the pointer after playback jumped to `target_ms`.
    pub fn seek(&mut self, timeline: &LyricTimeline, target_ms: f64) -> SyncUpdate {
        self.transition(timeline, SyncEvent::Seek(target_ms))
    }

    /// Back to [`SyncPhase::BeforeStart`].
    pub fn stop(&mut self, timeline: &LyricTimeline) -> SyncUpdate {
        self.transition(timeline, SyncEvent::Stop)
    }

    pub fn page_index(&self) -> Option<usize> {
        self.page_index
    }

    pub fn active_line(&self) -> Option<usize> {
        self.active_line
    }

    pub fn phase(&self, timeline: &LyricTimeline) -> SyncPhase {
        match self.page_index {
            None => SyncPhase::BeforeStart,
            Some(page) if page >= timeline.len() => SyncPhase::Ended,
            Some(_) => SyncPhase::Advancing,
        }
    }

    fn transition(&mut self, timeline: &LyricTimeline, event: SyncEvent) -> SyncUpdate {
        let mut page_advanced = false;
        let elapsed_ms = match event {
            SyncEvent::Start => {
                self.page_index = Some(0);
                self.active_line = None;
                0.0
            }
            SyncEvent::Stop => {
                self.page_index = None;
                self.active_line = None;
                0.0
            }
            SyncEvent::Tick(elapsed_ms) => {
                let page = self.page_index.get_or_insert(0);
                if let Some(line) = timeline.get(*page) {
                    if elapsed_ms > line.end_ms {
                        *page += 1;
                        page_advanced = true;
                    }
                }
                self.active_line = timeline.active_line(elapsed_ms);
                elapsed_ms
            }
            SyncEvent::Seek(target_ms) => {
                // Forward scan: skip every line that already ended before
                // the target. Lands on the first unfinished line.
                let page = timeline
                    .lines()
                    .iter()
                    .take_while(|line| line.end_ms < target_ms)
                    .count();
                self.page_index = Some(page);
                self.active_line = timeline.active_line(target_ms);
                target_ms
            }
        };

        let cues = PageCues::at(timeline, self.page_index, elapsed_ms);
        SyncUpdate {
            elapsed_ms,
            active_line: self.active_line,
            page_index: self.page_index,
            singing_expected: self.active_line.is_some(),
            page_advanced,
            phase: self.phase(timeline),
            page_visible: cues.page_visible,
            preview_line: cues.preview_line,
            cue_seconds: cues.cue_seconds,
            instrumental_break: cues.instrumental_break,
        }
    }
}
