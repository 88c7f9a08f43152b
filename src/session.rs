use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::{BufferLayout, ConfigError, ScanMode, SessionConfig};
use crate::device::{check_capabilities, DaqDevice, DeviceDescriptor, DeviceDriver, DeviceError, ScanRequest};
use crate::drain::{DrainError, DrainLoop, DrainStats};
use crate::queue::{channel_queues, DisplayQueues, QUEUE_CAPACITY};
use crate::recording::{RecordingError, RecordingHeader, RecordingWriter};

/// Duty cycle used by [`DaqSession::start_pulsing`].
pub const DEFAULT_DUTY_CYCLE: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected to a DAQ device")]
    NotConnected,

    #[error("Cannot start a new session while {0}")]
    Busy(SessionState),

    #[error("Failed to allocate the acquisition buffer: {0}")]
    Allocation(DeviceError),

    #[error("Failed to spawn drain thread: {0}")]
    Spawn(std::io::Error),

    #[error("Drain thread panicked")]
    DrainPanicked,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),
}

/// Where a [`DaqSession`] is in its lifecycle.
///
/// `Idle` means no board is connected. A connected board that is not
/// acquiring is `Connected`: `stop` returns there from `Viewing` or
/// `Recording`, and so does a session whose drain loop ended on its own.
/// Only `release_device` goes back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device connected.
    Idle,
    /// Device connected, no acquisition running.
    Connected,
    Viewing,
    Recording,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Viewing => "viewing",
            Self::Recording => "recording",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveMode {
    Viewing,
    Recording,
}

/// Counters of the current (or last) session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks: u64,
    pub samples: u64,
    /// Display samples dropped per channel on full queues.
    pub queue_drops: Vec<u64>,
}

/// Everything belonging to one running drain thread.
struct ActiveSession {
    mode: ActiveMode,
    worker: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<DrainStats>,
    queues: DisplayQueues,
    config: SessionConfig,
    actual_rate: f64,
}

/// Owns the connection to one DAQ board and the acquisition running on it.
///
/// Only one of viewing or recording can be active at a time, and starting
/// either requires the previous session to be stopped. The pulse output is
/// independent and may run with or without an acquisition.
pub struct DaqSession {
    driver: Box<dyn DeviceDriver>,
    devices: Vec<DeviceDescriptor>,
    device: Option<Arc<dyn DaqDevice>>,
    input_mode: Option<ScanMode>,
    active: Option<ActiveSession>,
    last_stats: SessionStats,
    fault: Arc<Mutex<Option<DrainError>>>,
    file_name: Option<PathBuf>,
    pulse: Option<(f64, f64)>,
}

impl DaqSession {
    pub fn new(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            driver,
            devices: Vec::new(),
            device: None,
            input_mode: None,
            active: None,
            last_stats: SessionStats::default(),
            fault: Arc::new(Mutex::new(None)),
            file_name: None,
            pulse: None,
        }
    }

    /// Enumerate attached boards.
    pub fn scan_devices(&mut self) -> Result<&[DeviceDescriptor], SessionError> {
        self.devices = self.driver.scan_devices()?;
        for (index, device) in self.devices.iter().enumerate() {
            log::info!("Found DAQ device {index}: {device}");
        }
        Ok(&self.devices)
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Connect to the board at `index` of the last scan, replacing any
    /// current connection. Counters start from zero.
    pub fn connect(&mut self, index: usize) -> Result<&DeviceDescriptor, SessionError> {
        if self.device.is_some() {
            self.release_device()?;
        }

        let device = self.driver.connect(index)?;
        if let Err(err) = check_capabilities(device.descriptor()) {
            log::error!("Rejecting {}: {err}", device.descriptor());
            if let Err(release_err) = device.release() {
                log::warn!("Failed to release rejected device: {release_err}");
            }
            return Err(err.into());
        }
        if device.descriptor().num_counters > 0 {
            device.reset_counters()?;
        }

        let mode = device.descriptor().preferred_scan_mode();
        log::info!(
            "Connected to {} ({} input mode)",
            device.descriptor(),
            match mode {
                ScanMode::SingleEnded => "single-ended",
                ScanMode::Differential => "differential",
            }
        );
        self.input_mode = Some(mode);
        Ok(self.device.insert(device).descriptor())
    }

    /// Input mode picked for the connected board, used by sessions whose
    /// config does not name one.
    pub fn input_mode(&self) -> Option<ScanMode> {
        self.input_mode
    }

    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref().map(|d| d.descriptor())
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    /// Stop any acquisition and pulse output, then release the board.
    pub fn release_device(&mut self) -> Result<(), SessionError> {
        self.stop()?;
        if self.pulse.is_some() {
            self.stop_pulsing()?;
        }
        self.input_mode = None;
        if let Some(device) = self.device.take() {
            device.release()?;
            log::info!("Released {}", device.descriptor());
        }
        Ok(())
    }

    /// Start acquiring into the display queues only.
    pub fn start_viewing(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        self.start(config, None)
    }

    /// Start acquiring into `path` and the display queues.
    pub fn start_recording(
        &mut self,
        config: SessionConfig,
        path: impl AsRef<Path>,
    ) -> Result<(), SessionError> {
        self.start(config, Some(path.as_ref()))
    }

    fn start(&mut self, config: SessionConfig, path: Option<&Path>) -> Result<(), SessionError> {
        let device = self.device.clone().ok_or(SessionError::NotConnected)?;
        self.reap_finished()?;
        if self.active.is_some() {
            return Err(SessionError::Busy(self.state()));
        }

        let span = tracing::info_span!(
            "session_start",
            device = %device.descriptor(),
            recording = path.is_some()
        );
        let _enter = span.enter();

        let descriptor = device.descriptor();
        let mode = self
            .input_mode
            .unwrap_or_else(|| descriptor.preferred_scan_mode());
        let config = config.or_scan_mode(mode);
        config.validate_for(&*device)?;
        let config = if config.device().is_empty() {
            config.with_device(&descriptor.to_string())
        } else {
            config
        };
        let layout = BufferLayout::new(&config, descriptor.packet_size);
        if descriptor.num_counters > 0 {
            device.reset_counters()?;
        }

        let range = config.channel_range();
        let request = ScanRequest {
            low_channel: range.low(),
            high_channel: range.high(),
            mode: config.scan_mode().unwrap_or(mode),
            range: config.voltage_range(),
            rate: config.sampling_rate(),
            capacity: layout.capacity,
        };
        let actual_rate = device.start_continuous_scan(&request).map_err(|err| match err {
            DeviceError::BufferAllocation { .. } => SessionError::Allocation(err),
            other => SessionError::Device(other),
        })?;
        if (actual_rate - config.sampling_rate()).abs() > f64::EPSILON {
            log::info!(
                "Sampling rate adjusted from {} Hz to {actual_rate} Hz",
                config.sampling_rate()
            );
        }

        match self.spawn_drain(&device, config, layout, actual_rate, path) {
            Ok(active) => {
                log::info!(
                    "Started {} {} channels {}..={} at {actual_rate} Hz",
                    if path.is_some() { "recording" } else { "viewing" },
                    device.descriptor(),
                    range.low(),
                    range.high()
                );
                self.active = Some(active);
                Ok(())
            }
            Err(err) => {
                if let Err(stop_err) = device.stop_scan() {
                    log::warn!("Failed to stop scan after failed start: {stop_err}");
                }
                Err(err)
            }
        }
    }

    fn spawn_drain(
        &mut self,
        device: &Arc<dyn DaqDevice>,
        config: SessionConfig,
        layout: BufferLayout,
        actual_rate: f64,
        path: Option<&Path>,
    ) -> Result<ActiveSession, SessionError> {
        let (fanout, queues) = channel_queues(config.channel_range(), QUEUE_CAPACITY);
        let mut drain = DrainLoop::new(Arc::clone(device), layout).with_fanout(fanout);

        let mode = match path {
            Some(path) => {
                let header = RecordingHeader::for_session(&config, actual_rate);
                let writer = RecordingWriter::create(path, &header)?;
                self.file_name = Some(path.to_path_buf());
                drain = drain.with_writer(writer);
                ActiveMode::Recording
            }
            None => ActiveMode::Viewing,
        };

        let stats = drain.stats();
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        *self.fault.lock() = None;

        let worker = {
            let stop = Arc::clone(&stop);
            let running = Arc::clone(&running);
            let fault = Arc::clone(&self.fault);
            thread::Builder::new()
                .name("daq-drain".to_string())
                .spawn(move || {
                    if let Err(err) = drain.run(&stop) {
                        *fault.lock() = Some(err);
                    }
                    running.store(false, Ordering::SeqCst);
                })
                .map_err(SessionError::Spawn)?
        };

        Ok(ActiveSession {
            mode,
            worker,
            stop,
            running,
            stats,
            queues,
            config,
            actual_rate,
        })
    }

    /// Stop the acquisition and wait for the drain thread to finish.
    ///
    /// The scan is stopped first, so every whole chunk already in the ring
    /// still reaches the file. Returns once the recording file is closed.
    /// Calling this with nothing running does nothing.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        if let Some(device) = &self.device {
            if let Err(err) = device.stop_scan() {
                log::error!("Failed to stop scan: {err}");
                active.stop.store(true, Ordering::SeqCst);
            }
        } else {
            active.stop.store(true, Ordering::SeqCst);
        }

        let joined = active.worker.join();
        self.last_stats = SessionStats {
            chunks: active.stats.chunks(),
            samples: active.stats.samples(),
            queue_drops: active.queues.drops(),
        };
        if joined.is_err() {
            log::error!("Drain thread panicked");
            return Err(SessionError::DrainPanicked);
        }

        log::info!(
            "Stopped {} after {} samples",
            match active.mode {
                ActiveMode::Viewing => "viewing",
                ActiveMode::Recording => "recording",
            },
            self.last_stats.samples
        );
        Ok(())
    }

    /// Join a drain thread that already ended on its own.
    fn reap_finished(&mut self) -> Result<(), SessionError> {
        let finished = self
            .active
            .as_ref()
            .is_some_and(|active| !active.running.load(Ordering::SeqCst));
        if finished {
            self.stop()?;
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        match &self.active {
            Some(active) if active.running.load(Ordering::SeqCst) => match active.mode {
                ActiveMode::Viewing => SessionState::Viewing,
                ActiveMode::Recording => SessionState::Recording,
            },
            _ if self.device.is_some() => SessionState::Connected,
            _ => SessionState::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state() == SessionState::Recording
    }

    pub fn is_viewing(&self) -> bool {
        self.state() == SessionState::Viewing
    }

    pub fn is_pulsing(&self) -> bool {
        self.pulse.is_some()
    }

    /// Per-channel queues of the running session.
    pub fn data_queues(&self) -> Option<&DisplayQueues> {
        self.active.as_ref().map(|active| &active.queues)
    }

    /// Configuration and achieved rate of the running session.
    pub fn active_config(&self) -> Option<(&SessionConfig, f64)> {
        self.active
            .as_ref()
            .map(|active| (&active.config, active.actual_rate))
    }

    /// Path of the current or most recent recording.
    pub fn file_name(&self) -> Option<&Path> {
        self.file_name.as_deref()
    }

    /// Why the last session ended on its own, if it did.
    pub fn take_fault(&self) -> Option<DrainError> {
        self.fault.lock().take()
    }

    pub fn has_fault(&self) -> bool {
        self.fault.lock().is_some()
    }

    pub fn stats(&self) -> SessionStats {
        match &self.active {
            Some(active) => SessionStats {
                chunks: active.stats.chunks(),
                samples: active.stats.samples(),
                queue_drops: active.queues.drops(),
            },
            None => self.last_stats.clone(),
        }
    }

    fn connected_device(&self) -> Result<&Arc<dyn DaqDevice>, SessionError> {
        self.device.as_ref().ok_or(SessionError::NotConnected)
    }

    pub fn reset_counters(&self) -> Result<(), SessionError> {
        self.connected_device()?.reset_counters()?;
        Ok(())
    }

    /// Current value of every counter channel of the board.
    pub fn read_counters(&self) -> Result<Vec<u64>, SessionError> {
        let device = self.connected_device()?;
        let counters = (0..device.descriptor().num_counters)
            .map(|id| device.read_counter(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counters)
    }

    pub fn start_pulsing(&mut self, frequency: f64) -> Result<(f64, f64), SessionError> {
        self.start_pulsing_with_duty(frequency, DEFAULT_DUTY_CYCLE)
    }

    /// Start the pulse train, replacing one already running. Returns the
    /// frequency and duty cycle the timer actually produces.
    pub fn start_pulsing_with_duty(
        &mut self,
        frequency: f64,
        duty_cycle: f64,
    ) -> Result<(f64, f64), SessionError> {
        let device = self.connected_device()?;
        if self.pulse.is_some() {
            device.stop_pulse()?;
        }
        let (actual_frequency, actual_duty) = device.start_pulse(frequency, duty_cycle)?;
        log::info!("Pulsing at {actual_frequency} Hz, duty cycle {actual_duty}");
        self.pulse = Some((actual_frequency, actual_duty));
        Ok((actual_frequency, actual_duty))
    }

    pub fn stop_pulsing(&mut self) -> Result<(), SessionError> {
        if self.pulse.is_none() {
            return Ok(());
        }
        self.connected_device()?.stop_pulse()?;
        self.pulse = None;
        log::info!("Pulse output stopped");
        Ok(())
    }

    /// Frequency and duty cycle of the running pulse train.
    pub fn pulse(&self) -> Option<(f64, f64)> {
        self.pulse
    }
}

impl Drop for DaqSession {
    fn drop(&mut self) {
        if let Err(err) = self.release_device() {
            log::error!("Failed to release DAQ device: {err}");
        }
    }
}
