use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use portable_atomic::AtomicF32;

use crate::{AudioConfig, KaraokeError, Result, ScoreSnapshot, ScoringEngine};

mod backend;
#[cfg(feature = "cpal")]
mod cpal_backend;
mod mixer;
mod mock;
mod streams;

pub use backend::{
    AudioBackend, DeviceCatalog, DeviceDescriptor, InputStream, OutputFormat, OutputStream,
};
#[cfg(feature = "cpal")]
pub use cpal_backend::{CpalBackend, CpalInput, CpalOutput};
pub use mixer::{apply_gain, interleave, mix_to_i16, CaptureMixer, CycleOutcome, MicLevels};
pub use mock::{MockBackend, MockInput, MockOutput};
pub use streams::{StreamLifecycleManager, StreamSet, StreamStatus, REOPEN_INTERVAL};

/// How long the paused worker waits for a command before looking again.
const PAUSE_POLL: Duration = Duration::from_millis(100);
const COMMAND_CAPACITY: usize = 64;
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Requests sent from the control side to the audio worker. They are only
/// acted upon at the top of a cycle, never in the middle of a read or
/// write.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Configure(AudioConfig),
    Pause(bool),
    Reset,
    Shutdown,
}

/// What the audio worker is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnginePhase {
    Starting = 0,
    Running = 1,
    Paused = 2,
    Stopped = 3,
}

impl EnginePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EnginePhase::Starting,
            1 => EnginePhase::Running,
            2 => EnginePhase::Paused,
            _ => EnginePhase::Stopped,
        }
    }
}

/// Score and the levels of the cycle that produced it. Published together
/// so readers never pair a score with levels from another cycle.
#[derive(Debug, Default)]
struct CycleState {
    scoring: ScoringEngine,
    levels: MicLevels,
}

/// Values shared between the worker and the control side.
#[derive(Debug)]
struct Shared {
    singing_segment: AtomicBool,
    monitoring_active: AtomicBool,
    /// Per-mic meters, readable without taking the state lock.
    mic1_level: AtomicF32,
    mic2_level: AtomicF32,
    phase: AtomicU8,
    /// Number of commands the worker has fully applied.
    applied: AtomicU64,
    state: Mutex<CycleState>,
}

impl Shared {
    fn new() -> Self {
        Self {
            singing_segment: AtomicBool::new(false),
            monitoring_active: AtomicBool::new(false),
            mic1_level: AtomicF32::new(0.0),
            mic2_level: AtomicF32::new(0.0),
            phase: AtomicU8::new(EnginePhase::Starting as u8),
            applied: AtomicU64::new(0),
            state: Mutex::new(CycleState::default()),
        }
    }

    fn store_meters(&self, levels: MicLevels) {
        self.mic1_level.store(levels.mic1, Ordering::Release);
        self.mic2_level.store(levels.mic2, Ordering::Release);
    }

    fn set_phase(&self, phase: EnginePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn phase(&self) -> EnginePhase {
        EnginePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CycleState>> {
        self.state
            .lock()
            .map_err(|_| KaraokeError::Poisoned("scoring state"))
    }
}

/// Live capture and scoring engine.
///
/// Owns a dedicated worker thread that reads the microphones, feeds the
/// monitor and scores every cycle. The engine starts paused; nothing is
/// opened until [`AudioEngine::set_paused`] is called with `false`.
pub struct AudioEngine<B: AudioBackend> {
    backend: Arc<B>,
    commands: Sender<EngineCommand>,
    shared: Arc<Shared>,
    sent: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl<B: AudioBackend> AudioEngine<B> {
    /// Spawns the audio worker with an initial configuration.
    pub fn start(backend: B, config: AudioConfig) -> Result<Self> {
        let backend = Arc::new(backend);
        let (commands, inbox) = crossbeam_channel::bounded(COMMAND_CAPACITY);
        let shared = Arc::new(Shared::new());

        let worker = {
            let backend = backend.clone();
            let shared = shared.clone();
            let config = config.sanitized();
            std::thread::Builder::new()
                .name("karaoke-audio".into())
                .spawn(move || Worker::new(backend, config, inbox, shared).run())?
        };
        tracing::info!("audio engine started");

        Ok(Self {
            backend,
            commands,
            shared,
            sent: AtomicU64::new(0),
            worker: Some(worker),
        })
    }

    /// Stages a new configuration. Safe to call at any time; the worker
    /// picks it up at the top of its next cycle.
    ///
    /// Never blocks. Fails with [`KaraokeError::EngineBusy`] when the worker
    /// is stuck and its command queue is full.
    pub fn set_config(&self, config: AudioConfig) -> Result<()> {
        self.send(EngineCommand::Configure(config.sanitized())).map(drop)
    }

    /// Pausing closes every stream and releases the devices.
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        tracing::info!(paused, "audio pause requested");
        self.send(EngineCommand::Pause(paused)).map(drop)
    }

    /// Pauses and blocks until the worker has closed its streams, so no
    /// further scoring can happen. Returns `false` on timeout.
    pub fn pause_and_wait(&self, timeout: Duration) -> Result<bool> {
        let ticket = self.send(EngineCommand::Pause(true))?;
        Ok(self.wait_applied(ticket, timeout))
    }

    /// Blocks until every command sent so far has been applied, including
    /// opening streams after a resume. Returns `false` on timeout.
    pub fn sync(&self, timeout: Duration) -> bool {
        self.wait_applied(self.sent.load(Ordering::Acquire), timeout)
    }

    /// Clears the score. Ordered with respect to other commands, so a reset
    /// followed by a resume never scores stale state.
    pub fn reset(&self) -> Result<()> {
        self.send(EngineCommand::Reset).map(drop)
    }

    /// Tells the scorer whether the current moment is inside a sung line.
    pub fn set_singing_segment(&self, active: bool) {
        self.shared.singing_segment.store(active, Ordering::Release);
    }

    pub fn singing_segment(&self) -> bool {
        self.shared.singing_segment.load(Ordering::Acquire)
    }

    pub fn score(&self) -> Result<u8> {
        Ok(self.shared.lock_state()?.scoring.score())
    }

    pub fn current_accuracy(&self) -> Result<f32> {
        Ok(self.shared.lock_state()?.scoring.current_accuracy())
    }

    pub fn score_snapshot(&self) -> Result<ScoreSnapshot> {
        Ok(self.shared.lock_state()?.scoring.snapshot())
    }

    /// Both mic levels from the same cycle, the one last scored.
    pub fn mic_levels(&self) -> Result<MicLevels> {
        Ok(self.shared.lock_state()?.levels)
    }

    /// Lock-free meter for mic 1. Not synchronised with mic 2.
    pub fn mic1_level(&self) -> f32 {
        self.shared.mic1_level.load(Ordering::Acquire)
    }

    /// Lock-free meter for mic 2. Not synchronised with mic 1.
    pub fn mic2_level(&self) -> f32 {
        self.shared.mic2_level.load(Ordering::Acquire)
    }

    /// False when monitoring is off, was never requested, or disabled
    /// itself after a device failure.
    pub fn monitoring_active(&self) -> bool {
        self.shared.monitoring_active.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> EnginePhase {
        self.shared.phase()
    }

    pub fn input_devices(&self) -> Vec<DeviceDescriptor> {
        DeviceCatalog::list(self.backend.as_ref())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Stops the worker, waiting at most `timeout` for it to exit. A worker
    /// that does not finish in time is detached; it still closes its streams
    /// when it eventually leaves its loop.
    pub fn shutdown(mut self, timeout: Duration) {
        self.stop(timeout);
    }

    fn stop(&mut self, timeout: Duration) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        // A full queue means the worker is stuck in a read. It still exits
        // once the sender is dropped and the queue drains.
        if let Err(SendTimeoutError::Timeout(_)) =
            self.commands.send_timeout(EngineCommand::Shutdown, timeout)
        {
            tracing::warn!("command queue full, shutdown request not delivered");
        }

        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(WAIT_STEP);
        }
        if worker.is_finished() {
            if worker.join().is_err() {
                tracing::error!("audio worker panicked");
            }
            tracing::info!("audio engine stopped");
        } else {
            tracing::warn!(?timeout, "audio worker did not stop in time, detaching");
        }
    }

    fn send(&self, command: EngineCommand) -> Result<u64> {
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => KaraokeError::EngineBusy,
            TrySendError::Disconnected(_) => KaraokeError::EngineStopped,
        })?;
        Ok(self.sent.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn wait_applied(&self, ticket: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.applied.load(Ordering::Acquire) >= ticket {
                return true;
            }
            if self.shared.phase() == EnginePhase::Stopped || Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_STEP);
        }
    }
}

impl<B: AudioBackend> Drop for AudioEngine<B> {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

impl<B: AudioBackend> std::fmt::Debug for AudioEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("phase", &self.phase())
            .field("mic1_level", &self.mic1_level())
            .field("mic2_level", &self.mic2_level())
            .finish()
    }
}

/// State owned by the audio thread.
struct Worker<B: AudioBackend> {
    streams: StreamLifecycleManager<B>,
    mixer: CaptureMixer,
    config: AudioConfig,
    paused: bool,
    inbox: Receiver<EngineCommand>,
    shared: Arc<Shared>,
    received: u64,
}

enum Flow {
    Continue,
    Exit,
}

impl<B: AudioBackend> Worker<B> {
    fn new(
        backend: Arc<B>,
        config: AudioConfig,
        inbox: Receiver<EngineCommand>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            streams: StreamLifecycleManager::new(backend),
            mixer: CaptureMixer::new(),
            config,
            paused: true,
            inbox,
            shared,
            received: 0,
        }
    }

    fn run(mut self) {
        tracing::debug!("audio worker running");
        loop {
            if let Flow::Exit = self.drain_commands() {
                break;
            }

            if self.paused {
                self.streams.apply(&self.config, true);
                self.idle();
                match self.inbox.recv_timeout(PAUSE_POLL) {
                    Ok(command) => {
                        if let Flow::Exit = self.handle(command) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            self.cycle();
        }

        self.streams.close_all();
        self.clear_levels();
        self.shared.monitoring_active.store(false, Ordering::Release);
        self.shared.set_phase(EnginePhase::Stopped);
        tracing::debug!("audio worker exited");
    }

    fn drain_commands(&mut self) -> Flow {
        loop {
            match self.inbox.try_recv() {
                Ok(command) => {
                    if let Flow::Exit = self.handle(command) {
                        return Flow::Exit;
                    }
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => return Flow::Exit,
            }
        }
    }

    fn handle(&mut self, command: EngineCommand) -> Flow {
        self.received += 1;
        match command {
            EngineCommand::Configure(next) => {
                if self.config.requires_restart(&next) {
                    tracing::info!("stream restart staged for next cycle");
                }
                self.config = next;
            }
            EngineCommand::Pause(paused) => {
                if self.paused != paused {
                    tracing::info!(paused, "audio processing paused state changed");
                }
                self.paused = paused;
            }
            EngineCommand::Reset => match self.shared.lock_state() {
                Ok(mut state) => state.scoring.reset(),
                Err(err) => tracing::error!(%err, "could not reset score"),
            },
            EngineCommand::Shutdown => return Flow::Exit,
        }
        Flow::Continue
    }

    fn idle(&mut self) {
        self.clear_levels();
        self.shared.monitoring_active.store(false, Ordering::Release);
        self.shared.set_phase(EnginePhase::Paused);
        self.shared.applied.store(self.received, Ordering::Release);
    }

    fn cycle(&mut self) {
        let status = self.streams.apply(&self.config, false);
        self.shared
            .monitoring_active
            .store(status.monitoring_enabled, Ordering::Release);
        self.shared.set_phase(EnginePhase::Running);
        self.shared.applied.store(self.received, Ordering::Release);

        let outcome = self
            .mixer
            .cycle(self.streams.streams_mut(), &self.config, status.monitoring_enabled);
        if let Some(err) = outcome.monitor_error {
            tracing::warn!(%err, "monitor write failed, monitoring disabled");
            self.streams.disable_monitor();
            self.shared.monitoring_active.store(false, Ordering::Release);
        }
        self.publish(outcome.levels);

        if !status.any_input() {
            // Nothing paces the loop without a blocking read.
            std::thread::sleep(self.config.chunk_duration());
        }
    }

    /// Scores the cycle and publishes its levels under one lock.
    fn publish(&self, levels: MicLevels) {
        self.shared.store_meters(levels);
        let singing = self.shared.singing_segment.load(Ordering::Acquire);
        match self.shared.lock_state() {
            Ok(mut state) => {
                state.levels = levels;
                state
                    .scoring
                    .observe(levels.combined(), singing, self.config.difficulty);
            }
            Err(err) => tracing::error!(%err, "skipping score update"),
        }
    }

    fn clear_levels(&self) {
        self.shared.store_meters(MicLevels::default());
        if let Ok(mut state) = self.shared.lock_state() {
            state.levels = MicLevels::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Difficulty;

    const WAIT: Duration = Duration::from_secs(5);

    fn backend() -> MockBackend {
        MockBackend::new()
            .with_device("lead", 2000)
            .with_device("duet", 2000)
            .with_read_delay(Duration::from_millis(1))
    }

    fn config(mic1: Option<usize>) -> AudioConfig {
        AudioConfig {
            mic1_device: mic1,
            chunk_frames: 64,
            difficulty: Difficulty::Easy,
            ..Default::default()
        }
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn starts_paused_without_opening_devices() {
        let mock = backend();
        let engine = AudioEngine::start(mock.clone(), config(Some(0))).unwrap();
        assert!(engine.sync(WAIT));
        assert!(wait_until(|| engine.phase() == EnginePhase::Paused));
        assert_eq!(mock.input_opens(), 0);
        engine.shutdown(WAIT);
    }

    #[test]
    fn scores_while_singing() {
        let mock = backend();
        let engine = AudioEngine::start(mock.clone(), config(Some(0))).unwrap();
        engine.set_singing_segment(true);
        engine.set_paused(false).unwrap();
        assert!(engine.sync(WAIT));
        assert_eq!(mock.open_inputs(), 1);

        assert!(wait_until(|| engine
            .score_snapshot()
            .map(|s| s.total_samples >= 10)
            .unwrap_or(false)));
        assert_eq!(engine.score().unwrap(), 100);
        assert!(engine.current_accuracy().unwrap() > 0.99);
        assert!(engine.mic1_level() > 1.5);

        assert!(engine.pause_and_wait(WAIT).unwrap());
        assert_eq!(mock.open_inputs(), 0);
        let frozen = engine.score_snapshot().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.score_snapshot().unwrap(), frozen);

        engine.shutdown(WAIT);
    }

    #[test]
    fn nothing_counts_outside_singing_segments() {
        let mock = backend();
        let engine = AudioEngine::start(mock, config(Some(0))).unwrap();
        engine.set_paused(false).unwrap();
        assert!(engine.sync(WAIT));
        assert!(wait_until(|| engine.mic1_level() > 0.0));
        assert_eq!(engine.score_snapshot().unwrap().total_samples, 0);
        assert_eq!(engine.score().unwrap(), 0);
        engine.shutdown(WAIT);
    }

    #[test]
    fn missing_mic_reads_as_silence() {
        let mock = backend();
        let engine = AudioEngine::start(mock, config(Some(9))).unwrap();
        engine.set_singing_segment(true);
        engine.set_paused(false).unwrap();
        assert!(engine.sync(WAIT));
        assert_eq!(engine.phase(), EnginePhase::Running);

        assert!(wait_until(|| engine
            .score_snapshot()
            .map(|s| s.total_samples >= 3)
            .unwrap_or(false)));
        assert_eq!(engine.score().unwrap(), 0);
        assert_eq!(engine.mic_levels().unwrap(), MicLevels::default());
        engine.shutdown(WAIT);
    }

    #[test]
    fn level_pair_always_comes_from_one_cycle() {
        let mock = MockBackend::new()
            .with_device("lead", 2000)
            .with_device("duet", 1000)
            .with_read_delay(Duration::from_millis(1));
        let engine = AudioEngine::start(
            mock,
            AudioConfig {
                mic2_device: Some(1),
                ..config(Some(0))
            },
        )
        .unwrap();
        engine.set_paused(false).unwrap();
        assert!(wait_until(|| engine.mic_levels().unwrap().mic1 > 0.0));

        for _ in 0..200 {
            let levels = engine.mic_levels().unwrap();
            assert!(levels.mic1 > 0.0);
            assert!((levels.mic1 - 2.0 * levels.mic2).abs() < 1e-3);
        }
        assert!(engine.mic2_level() > 0.0);

        assert!(engine.pause_and_wait(WAIT).unwrap());
        assert_eq!(engine.mic_levels().unwrap(), MicLevels::default());
        assert_eq!(engine.mic1_level(), 0.0);
        engine.shutdown(WAIT);
    }

    #[test]
    fn reset_is_ordered_before_resume() {
        let mock = backend();
        let engine = AudioEngine::start(mock, config(Some(0))).unwrap();
        engine.set_singing_segment(true);
        engine.set_paused(false).unwrap();
        assert!(wait_until(|| engine
            .score_snapshot()
            .map(|s| s.total_samples > 0)
            .unwrap_or(false)));

        assert!(engine.pause_and_wait(WAIT).unwrap());
        engine.reset().unwrap();
        assert!(engine.sync(WAIT));
        assert_eq!(engine.score_snapshot().unwrap(), ScoreSnapshot::default());
        engine.shutdown(WAIT);
    }

    #[test]
    fn reconfigure_switches_devices_mid_run() {
        let mock = backend();
        mock.set_amplitude(1, 0);
        let engine = AudioEngine::start(mock.clone(), config(Some(0))).unwrap();
        engine.set_paused(false).unwrap();
        assert!(wait_until(|| engine.mic1_level() > 0.0));

        engine.set_config(config(Some(1))).unwrap();
        assert!(engine.sync(WAIT));
        assert!(wait_until(|| engine.mic1_level() == 0.0));
        assert_eq!(mock.open_inputs(), 1);
        assert_eq!(mock.input_opens(), 2);
        engine.shutdown(WAIT);
    }

    #[test]
    fn monitor_write_failure_disables_monitoring_only() {
        let mock = backend();
        let engine = AudioEngine::start(
            mock.clone(),
            AudioConfig {
                monitoring_enabled: true,
                ..config(Some(0))
            },
        )
        .unwrap();
        engine.set_singing_segment(true);
        engine.set_paused(false).unwrap();
        assert!(wait_until(|| mock.written_samples() > 0));
        assert!(engine.monitoring_active());

        mock.set_fail_writes(true);
        assert!(wait_until(|| !engine.monitoring_active()));
        assert_eq!(mock.open_outputs(), 0);

        let before = engine.score_snapshot().unwrap().total_samples;
        assert!(wait_until(|| engine
            .score_snapshot()
            .map(|s| s.total_samples > before + 3)
            .unwrap_or(false)));
        engine.shutdown(WAIT);
    }

    #[test]
    fn shutdown_releases_devices_and_rejects_commands() {
        let mock = backend();
        let engine = AudioEngine::start(
            mock.clone(),
            AudioConfig {
                monitoring_enabled: true,
                ..config(Some(0))
            },
        )
        .unwrap();
        engine.set_paused(false).unwrap();
        assert!(engine.sync(WAIT));
        assert_eq!(mock.open_inputs(), 1);

        engine.shutdown(WAIT);
        assert_eq!(mock.open_inputs(), 0);
        assert_eq!(mock.open_outputs(), 0);
    }

    #[test]
    fn stuck_worker_blocks_neither_commands_nor_shutdown() {
        let mock = MockBackend::new()
            .with_device("slow", 2000)
            .with_read_delay(Duration::from_secs(2));
        let engine = AudioEngine::start(mock.clone(), config(Some(0))).unwrap();
        engine.set_paused(false).unwrap();
        assert!(wait_until(|| mock.open_inputs() == 1));

        // the worker is now inside a two second read
        for _ in 0..COMMAND_CAPACITY {
            engine.set_config(config(Some(0))).unwrap();
        }
        let started = Instant::now();
        assert!(matches!(
            engine.set_config(config(Some(0))),
            Err(KaraokeError::EngineBusy)
        ));
        engine.shutdown(Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn lists_devices_from_the_backend() {
        let engine = AudioEngine::start(backend(), AudioConfig::default()).unwrap();
        let names: Vec<String> = engine.input_devices().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["lead".to_string(), "duet".to_string()]);

        let broken = MockBackend::new().fail_enumeration();
        assert!(DeviceCatalog::list(&broken).is_empty());
    }
}
