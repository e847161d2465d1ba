//! Timestamped lyric scripts.
//!
//! Two formats are understood: word-level JSON (`{"lines": [...]}` with
//! times in seconds) and line-level LRC (`[mm:ss.cc]text`). Both end up as
//! a [`LyricTimeline`], an immutable list of lines sorted by start time.
//! Loading never fails: a broken or missing script yields an empty timeline
//! so the song still plays.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Result;

/// End time given to lines that do not carry one.
pub const DEFAULT_LINE_DURATION_MS: f64 = 5000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricWord {
    pub display: String,
    pub start_ms: f64,
    pub end_ms: f64,
}

impl LyricWord {
    /// How much of the word has been sung at `elapsed_ms`, in `[0, 1]`.
    pub fn progress(&self, elapsed_ms: f64) -> f32 {
        if elapsed_ms >= self.end_ms {
            return 1.0;
        }
        if elapsed_ms <= self.start_ms {
            return 0.0;
        }
        let span = self.end_ms - self.start_ms;
        if span <= 0.0 {
            return 1.0;
        }
        ((elapsed_ms - self.start_ms) / span).clamp(0.0, 1.0) as f32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricLine {
    pub start_ms: f64,
    pub end_ms: f64,
    pub text: String,
    #[serde(default)]
    pub words: Vec<LyricWord>,
}

impl LyricLine {
    /// Inclusive on both ends.
    pub fn contains(&self, elapsed_ms: f64) -> bool {
        self.start_ms <= elapsed_ms && elapsed_ms <= self.end_ms
    }
}

/// Ordered, immutable sequence of lyric lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LyricTimeline {
    lines: Vec<LyricLine>,
}

impl LyricTimeline {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a timeline from arbitrary lines, establishing the ordering
    /// invariants (lines by start, words by start, `end >= start`).
    pub fn from_lines(mut lines: Vec<LyricLine>) -> Self {
        for line in &mut lines {
            if line.end_ms < line.start_ms {
                line.end_ms = line.start_ms;
            }
            for word in &mut line.words {
                if word.end_ms < word.start_ms {
                    word.end_ms = word.start_ms;
                }
            }
            line.words.sort_by(|a, b| a.start_ms.total_cmp(&b.start_ms));
        }
        lines.sort_by(|a, b| a.start_ms.total_cmp(&b.start_ms));
        Self { lines }
    }

    /// Parses a word-level JSON script. Times are seconds in the file.
    pub fn parse_json(source: &str) -> Result<Self> {
        let script: RawScript = serde_json::from_str(source)?;
        let lines = script
            .lines
            .into_iter()
            .map(|raw| {
                let start_ms = raw.start * 1000.0;
                let end_ms = raw
                    .end
                    .map(|end| end * 1000.0)
                    .unwrap_or(start_ms + DEFAULT_LINE_DURATION_MS);
                let words: Vec<LyricWord> = raw
                    .words
                    .into_iter()
                    .map(|word| LyricWord {
                        start_ms: word.start * 1000.0,
                        end_ms: word.end.unwrap_or(word.start) * 1000.0,
                        display: word.display,
                    })
                    .collect();
                let text = raw.text.unwrap_or_else(|| {
                    words
                        .iter()
                        .map(|w| w.display.as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                });
                LyricLine {
                    start_ms,
                    end_ms,
                    text,
                    words,
                }
            })
            .collect();
        Ok(Self::from_lines(lines))
    }

    /// Parses LRC text. Lines that do not carry a `[mm:ss.cc]` tag are
    /// skipped.
    pub fn parse_lrc(source: &str) -> Self {
        let lines = source
            .lines()
            .filter_map(parse_lrc_line)
            .map(|(start_ms, text)| LyricLine {
                start_ms,
                end_ms: start_ms + DEFAULT_LINE_DURATION_MS,
                text,
                words: Vec::new(),
            })
            .collect();
        Self::from_lines(lines)
    }

    /// Loads a script from disk, picking the parser from the extension.
    /// Any failure is logged and produces an empty timeline.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_load(path) {
            Ok(timeline) => {
                tracing::info!(path = %path.display(), lines = timeline.len(), "loaded lyrics");
                timeline
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "lyrics unavailable, continuing without");
                Self::empty()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        if is_json(path) {
            Self::parse_json(&raw)
        } else {
            Ok(Self::parse_lrc(&raw))
        }
    }

    pub fn lines(&self) -> &[LyricLine] {
        &self.lines
    }

    pub fn get(&self, index: usize) -> Option<&LyricLine> {
        self.lines.get(index)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Index of the line whose interval contains `elapsed_ms`. When lines
    /// overlap the latest-starting one wins.
    pub fn active_line(&self, elapsed_ms: f64) -> Option<usize> {
        let started = self.lines.partition_point(|line| line.start_ms <= elapsed_ms);
        self.lines[..started]
            .iter()
            .rposition(|line| line.contains(elapsed_ms))
    }

    /// The last line whose start, pulled forward by `lead_in_ms`, has been
    /// reached. Used to show a line slightly before it is sung.
    pub fn display_line(&self, elapsed_ms: f64, lead_in_ms: f64) -> Option<usize> {
        self.lines
            .partition_point(|line| line.start_ms - lead_in_ms <= elapsed_ms)
            .checked_sub(1)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct RawScript {
    #[serde(default)]
    lines: Vec<RawLine>,
}

#[derive(Debug, Deserialize)]
struct RawLine {
    start: f64,
    #[serde(default)]
    end: Option<f64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    words: Vec<RawWord>,
}

#[derive(Debug, Deserialize)]
struct RawWord {
    start: f64,
    #[serde(default)]
    end: Option<f64>,
    #[serde(default)]
    display: String,
}

/// `[mm:ss.cc]text`, searched anywhere in the line.
fn lrc_tag() -> Option<&'static Regex> {
    static LRC_TAG: OnceLock<Option<Regex>> = OnceLock::new();
    LRC_TAG
        .get_or_init(|| match Regex::new(r"\[(\d+):(\d+\.\d+)\](.*)") {
            Ok(regex) => Some(regex),
            Err(err) => {
                tracing::error!(%err, "invalid lrc tag pattern");
                None
            }
        })
        .as_ref()
}

/// Time in milliseconds and trimmed text of the first timestamped tag in
/// the line.
fn parse_lrc_line(line: &str) -> Option<(f64, String)> {
    let caps = lrc_tag()?.captures(line)?;
    let minutes: f64 = caps[1].parse().ok()?;
    let seconds: f64 = caps[2].parse().ok()?;
    Some(((minutes * 60.0 + seconds) * 1000.0, caps[3].trim().to_string()))
}

/// Flavour of a lyric script available for a song.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptKind {
    /// Primary word-synchronised script.
    V1,
    /// Alternate word-synchronised script.
    V2,
    /// Line-level LRC.
    Lrc,
}

impl ScriptKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ScriptKind::V1 => "lyrics_v1.json",
            ScriptKind::V2 => "lyrics_v2.json",
            ScriptKind::Lrc => "lyrics.lrc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LyricScript {
    pub kind: ScriptKind,
    pub path: PathBuf,
}

impl LyricScript {
    /// Lists the scripts present in a song directory, in preference order.
    pub fn discover(dir: impl AsRef<Path>) -> Vec<LyricScript> {
        let dir = dir.as_ref();
        [ScriptKind::V1, ScriptKind::V2, ScriptKind::Lrc]
            .into_iter()
            .map(|kind| LyricScript {
                kind,
                path: dir.join(kind.file_name()),
            })
            .filter(|script| script.path.is_file())
            .collect()
    }

    pub fn load(&self) -> LyricTimeline {
        LyricTimeline::load(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_LINES: &str = r#"{"lines":[
        {"start":0.0,"end":1.0,"words":[]},
        {"start":1.5,"end":3.0,"words":[]},
        {"start":4.0,"end":6.0,"words":[]}
    ]}"#;

    #[test]
    fn parses_word_level_json() {
        let timeline = LyricTimeline::parse_json(
            r#"{"lines":[{"start":1.0,"end":2.0,"words":[{"start":1.0,"end":1.5,"display":"hi"}]}]}"#,
        )
        .unwrap();

        assert_eq!(timeline.len(), 1);
        let line = &timeline.lines()[0];
        assert_eq!(line.start_ms, 1000.0);
        assert_eq!(line.end_ms, 2000.0);
        assert_eq!(line.text, "hi");
        assert_eq!(line.words.len(), 1);
        assert_eq!(line.words[0].start_ms, 1000.0);
        assert_eq!(line.words[0].end_ms, 1500.0);
    }

    #[test]
    fn missing_end_falls_back_to_five_seconds() {
        let timeline = LyricTimeline::parse_json(r#"{"lines":[{"start":2.0}]}"#).unwrap();
        assert_eq!(timeline.lines()[0].end_ms, 7000.0);
        assert!(timeline.lines()[0].words.is_empty());
    }

    #[test]
    fn explicit_text_wins_over_words() {
        let timeline = LyricTimeline::parse_json(
            r#"{"lines":[{"start":0,"end":1,"text":"Hello there","words":[{"start":0,"end":0.5,"display":"Hel"},{"start":0.5,"end":1,"display":"lo"}]}]}"#,
        )
        .unwrap();
        assert_eq!(timeline.lines()[0].text, "Hello there");
    }

    #[test]
    fn json_lines_are_sorted_by_start() {
        let timeline = LyricTimeline::parse_json(
            r#"{"lines":[{"start":5,"end":6},{"start":1,"end":2},{"start":3,"end":4}]}"#,
        )
        .unwrap();
        let starts: Vec<f64> = timeline.lines().iter().map(|l| l.start_ms).collect();
        assert_eq!(starts, vec![1000.0, 3000.0, 5000.0]);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(LyricTimeline::parse_json("{not json").is_err());
        assert!(LyricTimeline::parse_json(r#"{"lines":[{"end":1}]}"#).is_err());
    }

    #[test]
    fn parses_lrc_lines() {
        let timeline = LyricTimeline::parse_lrc(
            "[ar:Someone]\n[01:02.50]hello world\nno tag here\n[00:10.00]  first  \n",
        );
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.lines()[0].text, "first");
        assert_eq!(timeline.lines()[0].start_ms, 10_000.0);
        let line = &timeline.lines()[1];
        assert_eq!(line.start_ms, 62_500.0);
        assert_eq!(line.end_ms, 67_500.0);
        assert_eq!(line.text, "hello world");
    }

    #[test]
    fn lrc_requires_fractional_seconds() {
        assert_eq!(parse_lrc_line("[01:02]nope"), None);
        assert_eq!(parse_lrc_line("[xx:02.00]nope"), None);
        assert_eq!(
            parse_lrc_line("junk [00:01.25]yes"),
            Some((1250.0, "yes".to_string()))
        );
        assert_eq!(parse_lrc_line("[1:2.5.6]nope"), None);
        assert_eq!(
            parse_lrc_line("[ti:x] [00:03] [00:04.00] both"),
            Some((4000.0, "both".to_string()))
        );
    }

    #[test]
    fn reparsing_is_deterministic() {
        let a = LyricTimeline::parse_json(THREE_LINES).unwrap();
        let b = LyricTimeline::parse_json(THREE_LINES).unwrap();
        assert_eq!(a, b);

        let lrc = "[00:01.00]a\n[00:00.50]b\n[00:01.00]c\n";
        assert_eq!(LyricTimeline::parse_lrc(lrc), LyricTimeline::parse_lrc(lrc));
    }

    #[test]
    fn finds_active_line_by_interval() {
        let timeline = LyricTimeline::parse_json(THREE_LINES).unwrap();
        assert_eq!(timeline.active_line(500.0), Some(0));
        assert_eq!(timeline.active_line(1000.0), Some(0));
        assert_eq!(timeline.active_line(1200.0), None);
        assert_eq!(timeline.active_line(2000.0), Some(1));
        assert_eq!(timeline.active_line(6000.0), Some(2));
        assert_eq!(timeline.active_line(6001.0), None);
        assert_eq!(LyricTimeline::empty().active_line(10.0), None);
    }

    #[test]
    fn display_line_leads_the_start() {
        let timeline = LyricTimeline::parse_json(THREE_LINES).unwrap();
        assert_eq!(timeline.display_line(1299.0, 200.0), Some(0));
        assert_eq!(timeline.display_line(1300.0, 200.0), Some(1));
        assert_eq!(timeline.display_line(-500.0, 200.0), None);
    }

    #[test]
    fn word_progress_wipes_linearly() {
        let word = LyricWord {
            display: "la".into(),
            start_ms: 1000.0,
            end_ms: 2000.0,
        };
        assert_eq!(word.progress(500.0), 0.0);
        assert_eq!(word.progress(1500.0), 0.5);
        assert_eq!(word.progress(2500.0), 1.0);
    }

    #[test]
    fn loading_missing_or_broken_files_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LyricTimeline::load(dir.path().join("missing.json")).is_empty());

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{").unwrap();
        assert!(LyricTimeline::load(&broken).is_empty());
    }

    #[test]
    fn discovers_scripts_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lyrics.lrc"), "[00:01.00]x\n").unwrap();
        std::fs::write(dir.path().join("lyrics_v1.json"), THREE_LINES).unwrap();

        let scripts = LyricScript::discover(dir.path());
        let kinds: Vec<ScriptKind> = scripts.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![ScriptKind::V1, ScriptKind::Lrc]);
        assert_eq!(scripts[0].load().len(), 3);
        assert_eq!(scripts[1].load().len(), 1);
    }
}
