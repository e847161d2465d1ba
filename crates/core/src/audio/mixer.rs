use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::{InputStream, OutputStream, StreamSet};
use crate::scoring::combined_level;
use crate::{AudioConfig, DeviceError};

/// Extra slack on top of one chunk's duration before a read gives up.
const READ_SLACK: Duration = Duration::from_millis(50);

/// Instantaneous per-mic levels, as shown on a level meter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MicLevels {
    pub mic1: f32,
    pub mic2: f32,
}

impl MicLevels {
    /// Level compared against the difficulty threshold.
    pub fn combined(&self) -> f32 {
        combined_level(self.mic1, self.mic2)
    }
}

/// Result of one capture cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub levels: MicLevels,
    /// Set when writing to the monitor failed this cycle.
    pub monitor_error: Option<DeviceError>,
}

/// Per-cycle read, gain, level and monitor mix.
///
/// Buffers are kept between cycles so the hot loop does not allocate once
/// the chunk size is stable.
#[derive(Debug, Default)]
pub struct CaptureMixer {
    raw1: Vec<i16>,
    raw2: Vec<i16>,
    gained1: Vec<f32>,
    gained2: Vec<f32>,
    mixed: Vec<i16>,
    output: Vec<i16>,
}

impl CaptureMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one cycle over whatever streams are open.
    ///
    /// Missing or failing mics contribute silence. The monitor is written
    /// only when `monitoring` is set and a monitor stream is open.
    pub fn cycle<I, O>(
        &mut self,
        streams: &mut StreamSet<I, O>,
        config: &AudioConfig,
        monitoring: bool,
    ) -> CycleOutcome
    where
        I: InputStream,
        O: OutputStream,
    {
        let frames = config.chunk_frames.max(1);
        let timeout = config.chunk_duration() * 2 + READ_SLACK;

        read_or_silence("mic1", streams.mic1.as_mut(), &mut self.raw1, frames, timeout);
        read_or_silence("mic2", streams.mic2.as_mut(), &mut self.raw2, frames, timeout);

        let levels = MicLevels {
            mic1: apply_gain(&self.raw1, config.gain_mic1, &mut self.gained1),
            mic2: apply_gain(&self.raw2, config.gain_mic2, &mut self.gained2),
        };

        let mut monitor_error = None;
        if monitoring {
            if let Some(monitor) = streams.monitor.as_mut() {
                mix_to_i16(&self.gained1, &self.gained2, &mut self.mixed);
                interleave(&self.mixed, streams.monitor_channels, &mut self.output);
                if let Err(err) = monitor.write(&self.output) {
                    monitor_error = Some(err);
                }
            }
        }

        CycleOutcome {
            levels,
            monitor_error,
        }
    }
}

fn read_or_silence<I: InputStream>(
    label: &'static str,
    stream: Option<&mut I>,
    buf: &mut Vec<i16>,
    frames: usize,
    timeout: Duration,
) {
    buf.clear();
    buf.resize(frames, 0);
    if let Some(stream) = stream {
        if let Err(err) = stream.read(buf, timeout) {
            tracing::trace!(stream = label, %err, "read failed, using silence");
            buf.fill(0);
        }
    }
}

/// Scales `samples` by `gain` into `out` and returns the level: the
/// Euclidean norm of the gained buffer divided by its length.
pub fn apply_gain(samples: &[i16], gain: f32, out: &mut Vec<f32>) -> f32 {
    out.clear();
    out.extend(samples.iter().map(|&s| s as f32 * gain));
    if out.is_empty() {
        return 0.0;
    }
    let energy: f64 = out.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (energy.sqrt() / out.len() as f64) as f32
}

/// Sums two gained buffers and hard-clips to the 16-bit range.
pub fn mix_to_i16(a: &[f32], b: &[f32], out: &mut Vec<i16>) {
    let len = a.len().max(b.len());
    out.clear();
    out.extend((0..len).map(|i| {
        let sum = a.get(i).copied().unwrap_or(0.0) + b.get(i).copied().unwrap_or(0.0);
        sum.clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }));
}

/// Copies mono samples into `channels` interleaved channels.
pub fn interleave(mono: &[i16], channels: u16, out: &mut Vec<i16>) {
    let channels = channels.max(1) as usize;
    out.clear();
    out.reserve(mono.len() * channels);
    for &sample in mono {
        out.extend(std::iter::repeat(sample).take(channels));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBackend, MockBackend, OutputFormat};

    #[test]
    fn level_is_norm_over_length() {
        let mut out = Vec::new();
        // norm of [3, 4] is 5, over 2 samples
        assert_eq!(apply_gain(&[3, 4], 1.0, &mut out), 2.5);
        assert_eq!(apply_gain(&[3, 4], 2.0, &mut out), 5.0);
        assert_eq!(out, vec![6.0, 8.0]);
        assert_eq!(apply_gain(&[], 1.0, &mut out), 0.0);
        assert_eq!(apply_gain(&[1000, -1000], 0.0, &mut out), 0.0);
    }

    #[test]
    fn mix_clips_to_i16() {
        let mut out = Vec::new();
        mix_to_i16(&[30_000.0, -30_000.0, 5.0], &[10_000.0, -10_000.0, 5.0], &mut out);
        assert_eq!(out, vec![i16::MAX, i16::MIN, 10]);
    }

    #[test]
    fn stereo_output_duplicates_samples() {
        let mut out = Vec::new();
        interleave(&[1, 2, 3], 2, &mut out);
        assert_eq!(out, vec![1, 1, 2, 2, 3, 3]);
        interleave(&[1, 2], 1, &mut out);
        assert_eq!(out, vec![1, 2]);
    }

    fn open_streams(
        backend: &MockBackend,
        monitor: bool,
    ) -> StreamSet<<MockBackend as AudioBackend>::Input, <MockBackend as AudioBackend>::Output>
    {
        let mut streams = StreamSet::default();
        streams.mic1 = backend.open_input(0, 44_100, 64).ok();
        if monitor {
            streams.monitor = backend
                .open_output(
                    OutputFormat {
                        channels: 2,
                        sample_rate: 44_100,
                    },
                    64,
                )
                .ok();
        }
        streams
    }

    #[test]
    fn cycle_measures_levels_and_feeds_monitor() {
        let backend = MockBackend::new().with_device("a", 800);
        let mut streams = open_streams(&backend, true);
        let config = AudioConfig {
            chunk_frames: 64,
            gain_mic1: 1.0,
            ..Default::default()
        };

        let outcome = CaptureMixer::new().cycle(&mut streams, &config, true);
        // square wave of 800 over 64 frames: 800 * 8 / 64
        assert!((outcome.levels.mic1 - 100.0).abs() < 1e-3);
        assert_eq!(outcome.levels.mic2, 0.0);
        assert!(outcome.monitor_error.is_none());
        assert_eq!(backend.written_samples(), 128);
    }

    #[test]
    fn failed_reads_become_silence() {
        let backend = MockBackend::new().with_flaky_device("a", 800);
        let mut streams = open_streams(&backend, false);
        let config = AudioConfig {
            chunk_frames: 32,
            ..Default::default()
        };
        let outcome = CaptureMixer::new().cycle(&mut streams, &config, false);
        assert_eq!(outcome.levels, MicLevels::default());
    }

    #[test]
    fn write_failure_is_reported_not_fatal() {
        let backend = MockBackend::new().with_device("a", 800);
        backend.set_fail_writes(true);
        let mut streams = open_streams(&backend, true);
        let config = AudioConfig {
            chunk_frames: 64,
            ..Default::default()
        };
        let outcome = CaptureMixer::new().cycle(&mut streams, &config, true);
        assert!(matches!(outcome.monitor_error, Some(DeviceError::Write(_))));
        assert!(outcome.levels.mic1 > 0.0);
    }

    #[test]
    fn monitor_untouched_when_disabled() {
        let backend = MockBackend::new().with_device("a", 800);
        let mut streams = open_streams(&backend, true);
        let config = AudioConfig {
            chunk_frames: 64,
            ..Default::default()
        };
        CaptureMixer::new().cycle(&mut streams, &config, false);
        assert_eq!(backend.written_samples(), 0);
    }
}
