//! In-memory audio backend with scripted devices.
//!
//! Used by tests and by builds without real audio support.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::audio::{AudioBackend, DeviceDescriptor, InputStream, OutputFormat, OutputStream};
use crate::DeviceError;

#[derive(Debug, Clone)]
struct MockDevice {
    name: String,
    amplitude: i16,
    fail_open: bool,
    fail_reads: bool,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    rejected_outputs: Vec<OutputFormat>,
    reject_all_outputs: bool,
    fail_writes: bool,
    fail_enumeration: bool,
    read_delay: Duration,
    open_inputs: usize,
    open_outputs: usize,
    input_opens: usize,
    written_samples: usize,
}

/// Scripted backend. Clones share the same state, so a test can keep one
/// handle to inspect what the engine did with another.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device producing a square wave of the given amplitude.
    pub fn with_device(self, name: impl Into<String>, amplitude: i16) -> Self {
        self.lock().devices.push(MockDevice {
            name: name.into(),
            amplitude,
            fail_open: false,
            fail_reads: false,
        });
        self
    }

    /// Adds a device that is listed but cannot be opened.
    pub fn with_busy_device(self, name: impl Into<String>) -> Self {
        self.lock().devices.push(MockDevice {
            name: name.into(),
            amplitude: 0,
            fail_open: true,
            fail_reads: false,
        });
        self
    }

    /// Adds a device that opens but fails every read.
    pub fn with_flaky_device(self, name: impl Into<String>, amplitude: i16) -> Self {
        self.lock().devices.push(MockDevice {
            name: name.into(),
            amplitude,
            fail_open: false,
            fail_reads: true,
        });
        self
    }

    pub fn reject_output(self, format: OutputFormat) -> Self {
        self.lock().rejected_outputs.push(format);
        self
    }

    pub fn reject_all_outputs(self) -> Self {
        self.lock().reject_all_outputs = true;
        self
    }

    pub fn fail_enumeration(self) -> Self {
        self.lock().fail_enumeration = true;
        self
    }

    /// Delay applied to every read, standing in for the device's pacing.
    pub fn with_read_delay(self, delay: Duration) -> Self {
        self.lock().read_delay = delay;
        self
    }

    pub fn set_amplitude(&self, device: usize, amplitude: i16) {
        if let Some(device) = self.lock().devices.get_mut(device) {
            device.amplitude = amplitude;
        }
    }

    /// Makes a listed device refuse, or accept again, new opens.
    pub fn set_busy(&self, device: usize, busy: bool) {
        if let Some(device) = self.lock().devices.get_mut(device) {
            device.fail_open = busy;
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn open_inputs(&self) -> usize {
        self.lock().open_inputs
    }

    pub fn open_outputs(&self) -> usize {
        self.lock().open_outputs
    }

    /// Number of successful input opens since creation.
    pub fn input_opens(&self) -> usize {
        self.lock().input_opens
    }

    pub fn written_samples(&self) -> usize {
        self.lock().written_samples
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AudioBackend for MockBackend {
    type Input = MockInput;
    type Output = MockOutput;

    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let state = self.lock();
        if state.fail_enumeration {
            return Err(DeviceError::Backend("enumeration failed".into()));
        }
        Ok(state
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| DeviceDescriptor {
                index,
                name: device.name.clone(),
            })
            .collect())
    }

    fn open_input(
        &self,
        device: usize,
        _sample_rate: u32,
        _chunk_frames: usize,
    ) -> Result<MockInput, DeviceError> {
        let mut state = self.lock();
        let entry = state
            .devices
            .get(device)
            .ok_or(DeviceError::NotFound { index: device })?;
        if entry.fail_open {
            return Err(DeviceError::open(entry.name.clone(), "device busy"));
        }
        state.open_inputs += 1;
        state.input_opens += 1;
        Ok(MockInput {
            state: Some(self.state.clone()),
            device,
            phase: false,
        })
    }

    fn open_output(
        &self,
        format: OutputFormat,
        _chunk_frames: usize,
    ) -> Result<MockOutput, DeviceError> {
        let mut state = self.lock();
        if state.reject_all_outputs || state.rejected_outputs.contains(&format) {
            return Err(DeviceError::open(
                format!("{}ch @ {}Hz output", format.channels, format.sample_rate),
                "format not supported",
            ));
        }
        state.open_outputs += 1;
        Ok(MockOutput {
            state: Some(self.state.clone()),
        })
    }
}

#[derive(Debug)]
pub struct MockInput {
    state: Option<Arc<Mutex<MockState>>>,
    device: usize,
    phase: bool,
}

impl InputStream for MockInput {
    fn read(&mut self, buf: &mut [i16], _timeout: Duration) -> Result<(), DeviceError> {
        let shared = self.state.as_ref().ok_or(DeviceError::Closed)?;
        let (amplitude, fail, delay) = {
            let state = lock_state(shared);
            let device = state
                .devices
                .get(self.device)
                .ok_or(DeviceError::NotFound { index: self.device })?;
            (device.amplitude, device.fail_reads, state.read_delay)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if fail {
            return Err(DeviceError::Read("mock read failure".into()));
        }
        for sample in buf.iter_mut() {
            self.phase = !self.phase;
            *sample = if self.phase {
                amplitude
            } else {
                amplitude.saturating_neg()
            };
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(shared) = self.state.take() {
            lock_state(&shared).open_inputs -= 1;
        }
        Ok(())
    }
}

impl Drop for MockInput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[derive(Debug)]
pub struct MockOutput {
    state: Option<Arc<Mutex<MockState>>>,
}

impl OutputStream for MockOutput {
    fn write(&mut self, interleaved: &[i16]) -> Result<(), DeviceError> {
        let shared = self.state.as_ref().ok_or(DeviceError::Closed)?;
        let mut state = lock_state(shared);
        if state.fail_writes {
            return Err(DeviceError::Write("mock write failure".into()));
        }
        state.written_samples += interleaved.len();
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(shared) = self.state.take() {
            lock_state(&shared).open_outputs -= 1;
        }
        Ok(())
    }
}

impl Drop for MockOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
