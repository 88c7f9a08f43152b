use std::fmt;
use std::sync::Arc;

use crate::config::{ScanMode, VoltageRange};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No DAQ devices found")]
    NoDevicesFound,

    #[error("Device index {index} out of range ({available} devices found)")]
    InvalidDeviceIndex { index: usize, available: usize },

    #[error("The DAQ device {0} does not support analog input")]
    NoAnalogInput(String),

    #[error("The DAQ device {0} does not support hardware paced analog input")]
    NoHardwarePacer(String),

    #[error("The DAQ device {0} has no counter channel {1}")]
    NoSuchCounter(String, u32),

    #[error("The DAQ device {0} has no pulse output")]
    NoPulseOutput(String),

    #[error("Failed to allocate a scan buffer of {samples} samples")]
    BufferAllocation { samples: usize },

    #[error("Buffer read {start}..{end} outside of the {capacity} sample scan buffer")]
    BufferRange {
        start: usize,
        end: usize,
        capacity: usize,
    },

    #[error("No scan is running")]
    NoActiveScan,

    #[error("A scan is already running")]
    ScanAlreadyRunning,

    #[error("Device has been released")]
    Released,

    #[error("Driver error {code}: {message}")]
    Driver { code: i32, message: String },
}

/// What device enumeration reports about one board.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub product_name: String,
    pub unique_id: String,
    pub has_analog_input: bool,
    pub has_pacer: bool,
    pub single_ended_channels: u32,
    pub differential_channels: u32,
    pub ranges: Vec<VoltageRange>,
    /// Ring buffer sizes must be a multiple of this many points per channel.
    pub packet_size: usize,
    pub num_counters: u32,
    pub has_pulse_output: bool,
}

impl DeviceDescriptor {
    pub fn channels_in_mode(&self, mode: ScanMode) -> u32 {
        match mode {
            ScanMode::SingleEnded => self.single_ended_channels,
            ScanMode::Differential => self.differential_channels,
        }
    }

    /// Single-ended unless the board only offers differential inputs.
    pub fn preferred_scan_mode(&self) -> ScanMode {
        if self.single_ended_channels > 0 {
            ScanMode::SingleEnded
        } else {
            ScanMode::Differential
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.product_name, self.unique_id)
    }
}

/// Parameters of a continuous background scan into a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanRequest {
    pub low_channel: u32,
    pub high_channel: u32,
    pub mode: ScanMode,
    pub range: VoltageRange,
    /// Requested rate in samples per second per channel.
    pub rate: f64,
    /// Ring buffer size in samples (all channels).
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Running,
}

/// Snapshot of the background scan as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStatus {
    pub state: ScanState,
    /// Samples written into the ring since the scan started.
    pub total_count: u64,
    /// Ring index the driver is writing at.
    pub buffer_index: usize,
}

/// A connected board. All calls take `&self`, since the drain thread polls the
/// scan while the control path reads counters or toggles the pulse output.
///
/// `start_continuous_scan` allocates the ring buffer and returns once the
/// scan is running, with the rate the hardware actually achieved.
/// `read_buffer` copies samples out of the ring as volts; it never wraps,
/// callers split reads at the end of the ring themselves.
pub trait DaqDevice: Send + Sync {
    fn descriptor(&self) -> &DeviceDescriptor;

    fn supported_ranges(&self) -> Vec<VoltageRange> {
        self.descriptor().ranges.clone()
    }

    fn start_continuous_scan(&self, request: &ScanRequest) -> Result<f64, DeviceError>;

    fn scan_status(&self) -> Result<ScanStatus, DeviceError>;

    fn read_buffer(&self, start: usize, dest: &mut [f64]) -> Result<(), DeviceError>;

    /// Stop the background scan. The ring stays readable until the next scan
    /// starts or the device is released. Stopping an idle device is not an error.
    fn stop_scan(&self) -> Result<(), DeviceError>;

    fn reset_counters(&self) -> Result<(), DeviceError>;

    fn read_counter(&self, id: u32) -> Result<u64, DeviceError>;

    /// Returns the `(frequency, duty_cycle)` the timer output actually produces.
    fn start_pulse(&self, frequency: f64, duty_cycle: f64) -> Result<(f64, f64), DeviceError>;

    fn stop_pulse(&self) -> Result<(), DeviceError>;

    fn release(&self) -> Result<(), DeviceError>;
}

/// Entry point of a vendor driver: enumerate boards and open one.
pub trait DeviceDriver: Send {
    fn scan_devices(&mut self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    fn connect(&mut self, index: usize) -> Result<Arc<dyn DaqDevice>, DeviceError>;
}

/// Reject boards that cannot run a paced analog scan.
pub fn check_capabilities(descriptor: &DeviceDescriptor) -> Result<(), DeviceError> {
    if !descriptor.has_analog_input {
        return Err(DeviceError::NoAnalogInput(descriptor.to_string()));
    }
    if !descriptor.has_pacer {
        return Err(DeviceError::NoHardwarePacer(descriptor.to_string()));
    }
    if descriptor.num_counters == 0 {
        log::info!("{} does not support counters", descriptor);
    }
    Ok(())
}
