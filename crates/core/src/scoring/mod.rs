use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::Difficulty;

/// Number of recent outcomes kept for the instantaneous accuracy. About two
/// seconds of chunks at 44.1 kHz / 2048 frames.
pub const DEFAULT_ACCURACY_WINDOW: usize = 43;

/// Weight applied to the second microphone when combining levels. Mic 1 is
/// the lead singer.
pub const MIC2_WEIGHT: f32 = 0.8;

/// Combines the two per-mic levels into the value compared against the
/// difficulty threshold.
pub fn combined_level(mic1: f32, mic2: f32) -> f32 {
    mic1.max(mic2 * MIC2_WEIGHT)
}

/// Point-in-time copy of the score counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub total_samples: u64,
    pub hit_samples: u64,
    /// 0..=100
    pub score: u8,
    /// 0.0..=1.0 over the recent window.
    pub accuracy: f32,
}

/// Presence-of-voice scorer.
///
/// Every cycle that falls inside a singing segment counts once; a cycle
/// whose level beats the difficulty threshold is a hit.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    total_samples: u64,
    hit_samples: u64,
    recent: VecDeque<bool>,
    recent_hits: usize,
    window: usize,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::with_window(DEFAULT_ACCURACY_WINDOW)
    }
}

impl ScoringEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scorer with a custom accuracy window. A zero window is
    /// bumped to one.
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            total_samples: 0,
            hit_samples: 0,
            recent: VecDeque::with_capacity(window + 1),
            recent_hits: 0,
            window,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Feeds one cycle. Returns whether the cycle was a hit, or `None` when
    /// it was outside a singing segment and did not count.
    pub fn observe(
        &mut self,
        combined_level: f32,
        singing_expected: bool,
        difficulty: Difficulty,
    ) -> Option<bool> {
        if !singing_expected {
            return None;
        }

        self.total_samples += 1;
        let hit = combined_level > difficulty.threshold();
        if hit {
            self.hit_samples += 1;
            self.recent_hits += 1;
        }

        self.recent.push_back(hit);
        if self.recent.len() > self.window {
            if let Some(true) = self.recent.pop_front() {
                self.recent_hits -= 1;
            }
        }

        Some(hit)
    }

    /// Overall score in percent, rounded. Zero before anything was scored.
    pub fn score(&self) -> u8 {
        if self.total_samples == 0 {
            return 0;
        }
        let percent = self.hit_samples as f64 / self.total_samples as f64 * 100.0;
        percent.round().clamp(0.0, 100.0) as u8
    }

    /// Hit ratio over the recent window, `0.0` while the window is empty.
    pub fn current_accuracy(&self) -> f32 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent_hits as f32 / self.recent.len() as f32
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn hit_samples(&self) -> u64 {
        self.hit_samples
    }

    /// Number of outcomes currently held in the accuracy window.
    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn snapshot(&self) -> ScoreSnapshot {
        ScoreSnapshot {
            total_samples: self.total_samples,
            hit_samples: self.hit_samples,
            score: self.score(),
            accuracy: self.current_accuracy(),
        }
    }

    /// Clears all counters. Called once when a song starts.
    pub fn reset(&mut self) {
        self.total_samples = 0;
        self.hit_samples = 0;
        self.recent.clear();
        self.recent_hits = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scorer_reports_zero() {
        let scorer = ScoringEngine::new();
        assert_eq!(scorer.score(), 0);
        assert_eq!(scorer.current_accuracy(), 0.0);
    }

    #[test]
    fn cycles_outside_segments_do_not_count() {
        let mut scorer = ScoringEngine::new();
        assert_eq!(scorer.observe(100.0, false, Difficulty::Easy), None);
        assert_eq!(scorer.total_samples(), 0);
        assert_eq!(scorer.score(), 0);
    }

    #[test]
    fn difficulty_changes_what_counts_as_a_hit() {
        let mut easy = ScoringEngine::new();
        assert_eq!(easy.observe(2.0, true, Difficulty::Easy), Some(true));
        assert_eq!(easy.score(), 100);

        let mut hard = ScoringEngine::new();
        assert_eq!(hard.observe(2.0, true, Difficulty::Hard), Some(false));
        assert_eq!(hard.score(), 0);
    }

    #[test]
    fn threshold_must_be_exceeded() {
        let mut scorer = ScoringEngine::new();
        assert_eq!(scorer.observe(7.0, true, Difficulty::Normal), Some(false));
        assert_eq!(scorer.observe(7.01, true, Difficulty::Normal), Some(true));
    }

    #[test]
    fn score_rounds_and_stays_in_range() {
        let mut scorer = ScoringEngine::new();
        // 2 hits out of 3 -> 66.67 -> 67
        scorer.observe(20.0, true, Difficulty::Hard);
        scorer.observe(20.0, true, Difficulty::Hard);
        scorer.observe(0.0, true, Difficulty::Hard);
        assert_eq!(scorer.score(), 67);

        for i in 0..500 {
            scorer.observe((i % 30) as f32, i % 3 != 0, Difficulty::Normal);
            assert!(scorer.score() <= 100);
        }
    }

    #[test]
    fn window_is_bounded_fifo() {
        let mut scorer = ScoringEngine::with_window(4);
        for _ in 0..4 {
            scorer.observe(50.0, true, Difficulty::Normal);
        }
        assert_eq!(scorer.current_accuracy(), 1.0);

        scorer.observe(0.0, true, Difficulty::Normal);
        scorer.observe(0.0, true, Difficulty::Normal);
        assert_eq!(scorer.recent_len(), 4);
        assert_eq!(scorer.current_accuracy(), 0.5);

        for _ in 0..100 {
            scorer.observe(0.0, true, Difficulty::Normal);
            assert!(scorer.recent_len() <= 4);
        }
        assert_eq!(scorer.recent_len(), 4);
        assert_eq!(scorer.current_accuracy(), 0.0);
    }

    #[test]
    fn default_window_stabilises_at_43() {
        let mut scorer = ScoringEngine::new();
        for _ in 0..100 {
            scorer.observe(10.0, true, Difficulty::Easy);
        }
        assert_eq!(scorer.recent_len(), DEFAULT_ACCURACY_WINDOW);
    }

    #[test]
    fn reset_clears_everything() {
        let mut scorer = ScoringEngine::new();
        scorer.observe(10.0, true, Difficulty::Easy);
        scorer.reset();
        assert_eq!(scorer.snapshot(), ScoreSnapshot::default());
        assert_eq!(scorer.recent_len(), 0);
    }

    #[test]
    fn second_mic_is_weighted_down() {
        assert_eq!(combined_level(3.0, 2.0), 3.0);
        assert!((combined_level(1.0, 10.0) - 8.0).abs() < 1e-5);
    }
}
