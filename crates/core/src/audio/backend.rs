use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DeviceError;

/// An input-capable device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
}

/// Channel layout and rate of an output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    pub channels: u16,
    pub sample_rate: u32,
}

impl OutputFormat {
    pub const FALLBACK_RATE: u32 = 48_000;

    /// Formats tried in order when opening the monitor: stereo and mono at
    /// the native rate, then stereo and mono at 48 kHz.
    pub fn candidates(native_rate: u32) -> Vec<OutputFormat> {
        let mut candidates = Vec::with_capacity(4);
        for sample_rate in [native_rate, Self::FALLBACK_RATE] {
            for channels in [2, 1] {
                let format = OutputFormat {
                    channels,
                    sample_rate,
                };
                if !candidates.contains(&format) {
                    candidates.push(format);
                }
            }
        }
        candidates
    }
}

/// Mono 16-bit capture stream.
///
/// Implementations release the device on `close` and on drop. `close` must
/// be safe to call more than once.
pub trait InputStream {
    /// Fills `buf` with exactly `buf.len()` frames, waiting at most
    /// `timeout`.
    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<(), DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Interleaved 16-bit playback stream.
pub trait OutputStream {
    fn write(&mut self, interleaved: &[i16]) -> Result<(), DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Platform audio access.
///
/// The backend itself is shared between the control thread (enumeration)
/// and the audio worker (stream creation). Streams never leave the worker.
pub trait AudioBackend: Send + Sync + 'static {
    type Input: InputStream;
    type Output: OutputStream;

    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    fn open_input(
        &self,
        device: usize,
        sample_rate: u32,
        chunk_frames: usize,
    ) -> Result<Self::Input, DeviceError>;

    fn open_output(
        &self,
        format: OutputFormat,
        chunk_frames: usize,
    ) -> Result<Self::Output, DeviceError>;
}

/// Read-only view over the host's input devices.
pub struct DeviceCatalog;

impl DeviceCatalog {
    /// Lists input devices. Enumeration failures are logged and produce an
    /// empty list.
    pub fn list<B: AudioBackend>(backend: &B) -> Vec<DeviceDescriptor> {
        match backend.input_devices() {
            Ok(devices) => devices,
            Err(err) => {
                tracing::error!(%err, "failed to enumerate input devices");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_candidates_in_fallback_order() {
        let formats: Vec<(u16, u32)> = OutputFormat::candidates(44_100)
            .into_iter()
            .map(|f| (f.channels, f.sample_rate))
            .collect();
        assert_eq!(
            formats,
            vec![(2, 44_100), (1, 44_100), (2, 48_000), (1, 48_000)]
        );
    }

    #[test]
    fn native_48k_does_not_repeat_candidates() {
        assert_eq!(OutputFormat::candidates(48_000).len(), 2);
    }
}
