//! Host audio through cpal.
//!
//! cpal delivers samples on its own callback thread. Capture callbacks push
//! mono chunks into a bounded channel that [`CpalInput::read`] drains; the
//! monitor works the other way round.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::audio::{AudioBackend, DeviceDescriptor, InputStream, OutputFormat, OutputStream};
use crate::DeviceError;

/// Chunks buffered between the cpal callback and the audio worker.
const CHANNEL_CHUNKS: usize = 32;
/// Captured frames kept beyond what the reader asked for, in chunks.
const MAX_BACKLOG_CHUNKS: usize = 8;

/// The platform's default host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn input_device(&self, index: usize) -> Result<cpal::Device, DeviceError> {
        cpal::default_host()
            .input_devices()
            .map_err(|err| DeviceError::Backend(err.to_string()))?
            .nth(index)
            .ok_or(DeviceError::NotFound { index })
    }
}

impl AudioBackend for CpalBackend {
    type Input = CpalInput;
    type Output = CpalOutput;

    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|err| DeviceError::Backend(err.to_string()))?;
        Ok(devices
            .enumerate()
            .map(|(index, device)| DeviceDescriptor {
                index,
                name: device.name().unwrap_or_else(|_| "Unknown Device".into()),
            })
            .collect())
    }

    fn open_input(
        &self,
        device: usize,
        sample_rate: u32,
        chunk_frames: usize,
    ) -> Result<CpalInput, DeviceError> {
        let handle = self.input_device(device)?;
        let name = handle.name().unwrap_or_else(|_| format!("input {device}"));
        let default = handle
            .default_input_config()
            .map_err(|err| DeviceError::open(name.clone(), err))?;
        let channels = default.channels();
        let format = default.sample_format();

        let (tx, rx) = crossbeam_channel::bounded(CHANNEL_CHUNKS);
        let failed = Arc::new(AtomicBool::new(false));

        let requested = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let stream = match build_input(&handle, &requested, format, tx.clone(), failed.clone()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(
                    device = %name,
                    rate = sample_rate,
                    %err,
                    "requested rate rejected, using the device default"
                );
                let fallback: cpal::StreamConfig = default.config();
                build_input(&handle, &fallback, format, tx, failed.clone())
                    .map_err(|err| DeviceError::open(name.clone(), err))?
            }
        };
        stream
            .play()
            .map_err(|err| DeviceError::open(name.clone(), err))?;

        Ok(CpalInput {
            stream: Some(stream),
            rx,
            pending: VecDeque::with_capacity(chunk_frames * 2),
            max_backlog: chunk_frames.max(1) * MAX_BACKLOG_CHUNKS,
            failed,
        })
    }

    fn open_output(
        &self,
        format: OutputFormat,
        chunk_frames: usize,
    ) -> Result<CpalOutput, DeviceError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(DeviceError::NoOutputDevice)?;
        let what = format!("{}ch @ {}Hz output", format.channels, format.sample_rate);
        let sample_format = device
            .default_output_config()
            .map_err(|err| DeviceError::open(what.clone(), err))?
            .sample_format();
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = crossbeam_channel::bounded(CHANNEL_CHUNKS);
        let failed = Arc::new(AtomicBool::new(false));
        let stream = build_output(&device, &config, sample_format, rx, failed.clone())
            .map_err(|err| DeviceError::open(what.clone(), err))?;
        stream.play().map_err(|err| DeviceError::open(what, err))?;

        tracing::debug!(chunk_frames, "monitor stream running");
        Ok(CpalOutput {
            stream: Some(stream),
            tx,
            failed,
        })
    }
}

fn build_input(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    tx: Sender<Vec<i16>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, DeviceError> {
    let stream = match format {
        cpal::SampleFormat::I16 => input_stream::<i16>(device, config, tx, failed),
        cpal::SampleFormat::U16 => input_stream::<u16>(device, config, tx, failed),
        cpal::SampleFormat::F32 => input_stream::<f32>(device, config, tx, failed),
        other => return Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
    };
    stream.map_err(|err| DeviceError::Backend(err.to_string()))
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: Sender<Vec<i16>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // first channel only
            let mono: Vec<i16> = data
                .chunks(channels)
                .filter_map(|frame| frame.first().copied())
                .map(i16::from_sample)
                .collect();
            // a full channel means the reader is behind, drop the chunk
            let _ = tx.try_send(mono);
        },
        move |err| {
            tracing::warn!(%err, "input stream error");
            failed.store(true, Ordering::Release);
        },
        None,
    )
}

fn build_output(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    rx: Receiver<Vec<i16>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, DeviceError> {
    let stream = match format {
        cpal::SampleFormat::I16 => output_stream::<i16>(device, config, rx, failed),
        cpal::SampleFormat::U16 => output_stream::<u16>(device, config, rx, failed),
        cpal::SampleFormat::F32 => output_stream::<f32>(device, config, rx, failed),
        other => return Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
    };
    stream.map_err(|err| DeviceError::Backend(err.to_string()))
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    rx: Receiver<Vec<i16>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<i16>,
{
    let mut queued: VecDeque<i16> = VecDeque::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            while queued.len() < data.len() {
                match rx.try_recv() {
                    Ok(chunk) => queued.extend(chunk),
                    Err(_) => break,
                }
            }
            for slot in data.iter_mut() {
                // underruns play silence
                *slot = T::from_sample(queued.pop_front().unwrap_or(0));
            }
        },
        move |err| {
            tracing::warn!(%err, "output stream error");
            failed.store(true, Ordering::Release);
        },
        None,
    )
}

/// Capture stream for one device, downmixed to its first channel.
pub struct CpalInput {
    stream: Option<cpal::Stream>,
    rx: Receiver<Vec<i16>>,
    pending: VecDeque<i16>,
    max_backlog: usize,
    failed: Arc<AtomicBool>,
}

impl InputStream for CpalInput {
    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::Closed);
        }
        let deadline = Instant::now() + timeout;
        while self.pending.len() < buf.len() {
            if self.failed.load(Ordering::Acquire) {
                return Err(DeviceError::Read("input stream reported an error".into()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => return Err(DeviceError::Timeout(buf.len())),
                Err(RecvTimeoutError::Disconnected) => return Err(DeviceError::Closed),
            }
        }

        for (slot, sample) in buf.iter_mut().zip(self.pending.drain(..buf.len())) {
            *slot = sample;
        }
        if self.pending.len() > self.max_backlog {
            let stale = self.pending.len() - self.max_backlog;
            self.pending.drain(..stale);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|err| DeviceError::Backend(err.to_string()))?;
        }
        self.pending.clear();
        Ok(())
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Default output device, fed with interleaved chunks.
pub struct CpalOutput {
    stream: Option<cpal::Stream>,
    tx: Sender<Vec<i16>>,
    failed: Arc<AtomicBool>,
}

impl OutputStream for CpalOutput {
    fn write(&mut self, interleaved: &[i16]) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::Closed);
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(DeviceError::Write("output stream reported an error".into()));
        }
        match self.tx.try_send(interleaved.to_vec()) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => {
                Err(DeviceError::Write("output stream went away".into()))
            }
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|err| DeviceError::Backend(err.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
