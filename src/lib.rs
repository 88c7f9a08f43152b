//! # MCC Recorder RS
//!
//! A Rust library for continuous multi-channel acquisition from Measurement
//! Computing DAQ boards.
//!
//! The board scans a contiguous channel range into a driver-owned circular
//! buffer. A dedicated drain thread follows the hardware through that buffer,
//! copying every sample exactly once into a binary recording file and into
//! bounded per-channel queues for live display.
//!
//! ## Features
//!
//! - **Lossless draining**: Chunked copies out of the ring with wrap-around handling
//! - **Overrun detection**: Acquisition halts instead of silently skipping samples
//! - **Binary recordings**: Self-describing JSON header followed by raw little-endian `f64` samples
//! - **Live display queues**: Non-blocking per-channel fan-out that never stalls the drain thread
//! - **DataFrame output**: Recordings load into `polars` DataFrames and export to CSV
//! - **Counters and pulse output**: Counter readout and a pulse train independent of acquisition
//! - **Simulated hardware**: A deterministic device for tests and demos
//!
//! ## Examples
//!
//! ### Recording a Session
//!
//! ```rust,no_run
//! use mccrecorder::{DaqSession, SessionConfig, SimulatedDevice, SimulatedDriver, Pacing};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let device = Arc::new(SimulatedDevice::builder().pacing(Pacing::RealTime).build());
//! let mut session = DaqSession::new(Box::new(SimulatedDriver::new(vec![device])));
//!
//! session.scan_devices()?;
//! session.connect(0)?;
//!
//! let config = SessionConfig::builder()
//!     .channel_range(0, 3)
//!     .sampling_rate(10_000.0)
//!     .build()?;
//! session.start_recording(config, "recording.bin")?;
//! std::thread::sleep(Duration::from_secs(1));
//! session.stop()?;
//!
//! if let Some(err) = session.take_fault() {
//!     eprintln!("Recording ended early: {err}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Live Display
//!
//! ```rust,no_run
//! use mccrecorder::{DaqSession, SessionConfig, SignalHistory, MAX_SAMPLES_PER_REFRESH, REFRESH_INTERVAL};
//! # use mccrecorder::{SimulatedDevice, SimulatedDriver};
//! # use std::sync::Arc;
//! # let device = Arc::new(SimulatedDevice::builder().build());
//! # let mut session = DaqSession::new(Box::new(SimulatedDriver::new(vec![device])));
//! # session.scan_devices()?;
//! # session.connect(0)?;
//!
//! let config = SessionConfig::builder().channel_range(0, 1).build()?;
//! let rate = config.sampling_rate();
//! session.start_viewing(config)?;
//!
//! let mut history = SignalHistory::new(2, rate, 10.0);
//! while session.is_viewing() {
//!     if let Some(queues) = session.data_queues() {
//!         history.update(&queues.refresh(MAX_SAMPLES_PER_REFRESH));
//!     }
//!     std::thread::sleep(REFRESH_INTERVAL);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Reading a Recording
//!
//! ```rust,no_run
//! use mccrecorder::Recording;
//!
//! let recording = Recording::open("recording.bin")?;
//! println!(
//!     "{} samples of {} channels at {} Hz",
//!     recording.num_samples(),
//!     recording.num_channels(),
//!     recording.header.sampling_rate
//! );
//!
//! let df = recording.to_dataframe()?;
//! println!("{df}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod control;
pub mod device;
pub mod drain;
pub mod queue;
pub mod recording;
pub mod ring;
pub mod session;
pub mod simulated;

// Re-export the main types for convenience
pub use config::{
    AcquisitionSettings, BufferLayout, ChannelRange, ChannelSettings, ConfigError, ScanMode,
    SessionConfig, SessionConfigBuilder, VoltageRange,
};

pub use device::{
    DaqDevice, DeviceDescriptor, DeviceDriver, DeviceError, ScanRequest, ScanState, ScanStatus,
};

pub use drain::{DrainError, DrainLoop, DrainStep, OverrunPhase};

pub use queue::{
    DisplayBatch, DisplayQueues, SignalHistory, MAX_SAMPLES_PER_REFRESH, QUEUE_CAPACITY,
    REFRESH_INTERVAL,
};

pub use recording::{Recording, RecordingError, RecordingHeader, RecordingWriter};

pub use session::{DaqSession, SessionError, SessionState, SessionStats};

pub use control::{ControlError, RemoteCommand, RemoteController, StatusReply};

pub use simulated::{BufferModel, Pacing, SimulatedDevice, SimulatedDriver};
