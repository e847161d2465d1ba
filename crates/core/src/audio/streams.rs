use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::{AudioBackend, InputStream, OutputFormat, OutputStream};
use crate::AudioConfig;

/// How often a configured mic that failed to open is retried.
pub const REOPEN_INTERVAL: Duration = Duration::from_secs(2);

/// Open handles. Owned by [`StreamLifecycleManager`] only.
#[derive(Debug)]
pub struct StreamSet<I, O> {
    pub mic1: Option<I>,
    pub mic2: Option<I>,
    pub monitor: Option<O>,
    pub monitor_channels: u16,
}

impl<I, O> Default for StreamSet<I, O> {
    fn default() -> Self {
        Self {
            mic1: None,
            mic2: None,
            monitor: None,
            monitor_channels: 2,
        }
    }
}

impl<I: InputStream, O: OutputStream> StreamSet<I, O> {
    pub fn is_empty(&self) -> bool {
        self.mic1.is_none() && self.mic2.is_none() && self.monitor.is_none()
    }

    /// Closes every handle. A failure on one does not stop the others.
    /// Returns how many closes failed.
    pub fn close_all(&mut self) -> usize {
        let mut failures = 0;
        for (label, slot) in [("mic1", &mut self.mic1), ("mic2", &mut self.mic2)] {
            if let Some(mut stream) = slot.take() {
                if let Err(err) = stream.close() {
                    tracing::warn!(stream = label, %err, "failed to close input stream");
                    failures += 1;
                }
            }
        }
        if let Some(mut monitor) = self.monitor.take() {
            if let Err(err) = monitor.close() {
                tracing::warn!(%err, "failed to close monitor stream");
                failures += 1;
            }
        }
        failures
    }
}

/// Outcome of [`StreamLifecycleManager::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub mic1_open: bool,
    pub mic2_open: bool,
    pub monitor: Option<OutputFormat>,
    /// Whether monitoring is actually running. False when it was requested
    /// but every output format failed or a write failed.
    pub monitoring_enabled: bool,
}

impl StreamStatus {
    pub fn any_input(&self) -> bool {
        self.mic1_open || self.mic2_open
    }
}

/// The parts of [`AudioConfig`] that the open streams depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamKey {
    mic1: Option<usize>,
    mic2: Option<usize>,
    monitoring: bool,
    chunk_frames: usize,
    sample_rate: u32,
}

impl From<&AudioConfig> for StreamKey {
    fn from(config: &AudioConfig) -> Self {
        Self {
            mic1: config.mic1_device,
            mic2: config.mic2_device,
            monitoring: config.monitoring_enabled,
            chunk_frames: config.chunk_frames,
            sample_rate: config.sample_rate,
        }
    }
}

/// Opens and closes the capture and monitor streams so they match the
/// requested configuration.
pub struct StreamLifecycleManager<B: AudioBackend> {
    backend: Arc<B>,
    streams: StreamSet<B::Input, B::Output>,
    opened_for: Option<StreamKey>,
    monitor_format: Option<OutputFormat>,
    /// Monitoring stays off for this configuration after it failed once.
    monitor_suppressed_for: Option<StreamKey>,
    last_open_attempt: Option<Instant>,
    reopen_interval: Duration,
}

impl<B: AudioBackend> StreamLifecycleManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_reopen_interval(backend, REOPEN_INTERVAL)
    }

    /// Like [`StreamLifecycleManager::new`] with a custom delay between
    /// attempts to reopen a mic that failed.
    pub fn with_reopen_interval(backend: Arc<B>, reopen_interval: Duration) -> Self {
        Self {
            backend,
            streams: StreamSet::default(),
            opened_for: None,
            monitor_format: None,
            monitor_suppressed_for: None,
            last_open_attempt: None,
            reopen_interval,
        }
    }

    /// Brings the open streams in line with `config`.
    ///
    /// When `paused` everything is closed so the devices are released, and
    /// nothing is opened until a later call with `paused == false`.
    pub fn apply(&mut self, config: &AudioConfig, paused: bool) -> StreamStatus {
        if paused {
            if !self.streams.is_empty() {
                tracing::info!("pausing, releasing audio devices");
            }
            self.close_all();
            return self.status();
        }

        let key = StreamKey::from(config);
        if self.opened_for == Some(key) {
            if self.missing_mic(config) && self.reopen_due() {
                self.reopen_missing_mics(config);
            }
            return self.status();
        }

        if self.opened_for.is_some() {
            tracing::info!("audio configuration changed, restarting streams");
        }
        self.close_all();
        self.open(config, key);
        self.status()
    }

    /// Closes every stream. Safe to call repeatedly.
    pub fn close_all(&mut self) {
        let failures = self.streams.close_all();
        if failures > 0 {
            tracing::warn!(failures, "some streams did not close cleanly");
        }
        self.opened_for = None;
        self.monitor_format = None;
    }

    /// Drops the monitor after a write failure. It stays off until the
    /// configuration changes.
    pub fn disable_monitor(&mut self) {
        if let Some(mut monitor) = self.streams.monitor.take() {
            if let Err(err) = monitor.close() {
                tracing::warn!(%err, "failed to close monitor stream");
            }
        }
        self.monitor_format = None;
        self.monitor_suppressed_for = self.opened_for;
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            mic1_open: self.streams.mic1.is_some(),
            mic2_open: self.streams.mic2.is_some(),
            monitor: self.monitor_format,
            monitoring_enabled: self.streams.monitor.is_some(),
        }
    }

    pub fn streams_mut(&mut self) -> &mut StreamSet<B::Input, B::Output> {
        &mut self.streams
    }

    fn open(&mut self, config: &AudioConfig, key: StreamKey) {
        tracing::info!(
            mic1 = ?config.mic1_device,
            mic2 = ?config.mic2_device,
            monitoring = config.monitoring_enabled,
            chunk_frames = config.chunk_frames,
            "opening streams"
        );
        self.last_open_attempt = Some(Instant::now());
        self.streams.mic1 = self.open_mic("mic1", config.mic1_device, config);
        self.streams.mic2 = match config.mic2_device {
            Some(device) if config.mic1_device == Some(device) => {
                tracing::info!(device, "mic2 shares mic1's device, ignoring it");
                None
            }
            other => self.open_mic("mic2", other, config),
        };

        if self.monitor_suppressed_for != Some(key) {
            self.monitor_suppressed_for = None;
        }
        if config.monitoring_enabled && self.monitor_suppressed_for.is_none() {
            self.open_monitor(config, key);
        }
        self.opened_for = Some(key);
    }

    fn open_mic(
        &self,
        label: &'static str,
        device: Option<usize>,
        config: &AudioConfig,
    ) -> Option<B::Input> {
        let device = device?;
        match self
            .backend
            .open_input(device, config.sample_rate, config.chunk_frames)
        {
            Ok(stream) => {
                tracing::info!(stream = label, device, "input stream opened");
                Some(stream)
            }
            Err(err) => {
                tracing::warn!(stream = label, device, %err, "input stream unavailable, reading silence");
                None
            }
        }
    }

    fn open_monitor(&mut self, config: &AudioConfig, key: StreamKey) {
        for format in OutputFormat::candidates(config.sample_rate) {
            match self.backend.open_output(format, config.chunk_frames) {
                Ok(stream) => {
                    tracing::info!(
                        channels = format.channels,
                        rate = format.sample_rate,
                        "monitor stream opened"
                    );
                    self.streams.monitor = Some(stream);
                    self.streams.monitor_channels = format.channels;
                    self.monitor_format = Some(format);
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        channels = format.channels,
                        rate = format.sample_rate,
                        %err,
                        "monitor format rejected"
                    );
                }
            }
        }
        tracing::error!("every monitor format failed, monitoring disabled");
        self.monitor_suppressed_for = Some(key);
    }

    fn missing_mic(&self, config: &AudioConfig) -> bool {
        let mic2_expected = config.mic2_device.is_some() && config.mic2_device != config.mic1_device;
        (config.mic1_device.is_some() && self.streams.mic1.is_none())
            || (mic2_expected && self.streams.mic2.is_none())
    }

    fn reopen_due(&self) -> bool {
        self.last_open_attempt
            .map(|at| at.elapsed() >= self.reopen_interval)
            .unwrap_or(true)
    }

    fn reopen_missing_mics(&mut self, config: &AudioConfig) {
        self.last_open_attempt = Some(Instant::now());
        if self.streams.mic1.is_none() {
            self.streams.mic1 = self.open_mic("mic1", config.mic1_device, config);
        }
        if self.streams.mic2.is_none() && config.mic2_device != config.mic1_device {
            self.streams.mic2 = self.open_mic("mic2", config.mic2_device, config);
        }
    }
}

impl<B: AudioBackend> Drop for StreamLifecycleManager<B> {
    fn drop(&mut self) {
        self.streams.close_all();
    }
}
