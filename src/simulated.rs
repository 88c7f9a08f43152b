//! Synthetic DAQ hardware.
//!
//! [`SimulatedDevice`] implements [`DaqDevice`] with an in-memory ring buffer
//! written by a fake scan engine. Samples come from a deterministic signal
//! function of `(scan index, channel)`, so a recording can be checked against
//! the exact stream the "hardware" produced.
//!
//! The ring uses one of the two memory models real drivers expose: a buffer of
//! already scaled volts that can be indexed directly, or a buffer of 16-bit
//! converter counts that is scaled to volts on every read.
//!
//! With [`Pacing::Manual`] nothing is written until the test calls
//! [`SimulatedDevice::advance`]; with [`Pacing::RealTime`] a pacer thread
//! writes at the configured rate.

use parking_lot::Mutex;
use std::collections::TryReserveError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::VoltageRange;
use crate::device::{
    DaqDevice, DeviceDescriptor, DeviceDriver, DeviceError, ScanRequest, ScanState, ScanStatus,
};

/// Pacer time base; requested rates are rounded to a whole divisor of it.
pub const PACER_CLOCK_HZ: f64 = 1_000_000.0;
const PACER_TICK: Duration = Duration::from_millis(1);
const RAW_FULL_SCALE: f64 = 65535.0;

pub type SignalFn = Arc<dyn Fn(u64, u32) -> f64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferModel {
    /// Ring holds `f64` volts.
    Scaled,
    /// Ring holds unsigned 16-bit counts across the voltage range.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Manual,
    RealTime,
}

enum RingStorage {
    Scaled(Vec<f64>),
    Raw {
        counts: Vec<u16>,
        range: VoltageRange,
    },
}

impl RingStorage {
    fn allocate(
        model: BufferModel,
        capacity: usize,
        range: VoltageRange,
    ) -> Result<Self, TryReserveError> {
        Ok(match model {
            BufferModel::Scaled => {
                let mut data = Vec::new();
                data.try_reserve_exact(capacity)?;
                data.resize(capacity, 0.0);
                Self::Scaled(data)
            }
            BufferModel::Raw => {
                let mut counts = Vec::new();
                counts.try_reserve_exact(capacity)?;
                counts.resize(capacity, 0);
                Self::Raw { counts, range }
            }
        })
    }

    fn len(&self) -> usize {
        match self {
            Self::Scaled(data) => data.len(),
            Self::Raw { counts, .. } => counts.len(),
        }
    }

    fn store(&mut self, index: usize, volts: f64) {
        match self {
            Self::Scaled(data) => data[index] = volts,
            Self::Raw { counts, range } => counts[index] = volts_to_counts(*range, volts),
        }
    }

    fn load(&self, start: usize, dest: &mut [f64]) {
        let end = start + dest.len();
        match self {
            Self::Scaled(data) => dest.copy_from_slice(&data[start..end]),
            Self::Raw { counts, range } => {
                for (out, &count) in dest.iter_mut().zip(&counts[start..end]) {
                    *out = counts_to_volts(*range, count);
                }
            }
        }
    }
}

pub fn volts_to_counts(range: VoltageRange, volts: f64) -> u16 {
    let (min, max) = range.span();
    let scaled = ((volts - min) / (max - min) * RAW_FULL_SCALE).round();
    scaled.clamp(0.0, RAW_FULL_SCALE) as u16
}

pub fn counts_to_volts(range: VoltageRange, count: u16) -> f64 {
    let (min, max) = range.span();
    min + f64::from(count) / RAW_FULL_SCALE * (max - min)
}

struct ScanEngine {
    ring: Option<RingStorage>,
    request: Option<ScanRequest>,
    running: bool,
    total_count: u64,
    advance_on_read: u64,
}

impl ScanEngine {
    fn write(&mut self, signal: &SignalFn, count: u64) {
        let (Some(ring), Some(request)) = (self.ring.as_mut(), self.request.as_ref()) else {
            return;
        };
        let num_channels = u64::from(request.high_channel - request.low_channel + 1);
        let capacity = ring.len() as u64;

        for _ in 0..count {
            let n = self.total_count;
            let channel = request.low_channel + (n % num_channels) as u32;
            ring.store((n % capacity) as usize, signal(n / num_channels, channel));
            self.total_count += 1;
        }
    }
}

struct Pacer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SimulatedDevice {
    descriptor: DeviceDescriptor,
    model: BufferModel,
    pacing: Pacing,
    signal: SignalFn,
    max_buffer_samples: usize,
    engine: Arc<Mutex<ScanEngine>>,
    pacer: Mutex<Option<Pacer>>,
    counters: Mutex<Vec<u64>>,
    pulse: Mutex<Option<(f64, f64)>>,
    released: AtomicBool,
}

impl SimulatedDevice {
    pub fn builder() -> SimulatedDeviceBuilder {
        SimulatedDeviceBuilder::new()
    }

    /// Default signal: channel `c` at scan `n` reads `c + n / 1_000_000`,
    /// unique per sample and exact in `f64`.
    pub fn ramp_signal() -> SignalFn {
        Arc::new(|scan, channel| f64::from(channel) + scan as f64 * 1e-6)
    }

    pub fn sine_signal(frequency: f64, sampling_rate: f64) -> SignalFn {
        Arc::new(move |scan, channel| {
            let t = scan as f64 / sampling_rate;
            let phase = f64::from(channel) * std::f64::consts::FRAC_PI_4;
            (2.0 * std::f64::consts::PI * frequency * t + phase).sin()
        })
    }

    /// Value the signal produces for `channel` at `scan`, before any raw-count quantization.
    pub fn expected_sample(&self, scan: u64, channel: u32) -> f64 {
        (self.signal)(scan, channel)
    }

    /// Let the scan engine write `count` more samples into the ring.
    pub fn advance(&self, count: u64) {
        self.engine.lock().write(&self.signal, count);
    }

    /// The next `read_buffer` call lets the engine write `count` samples right
    /// after the copy, as if the hardware raced the reader.
    pub fn advance_during_next_read(&self, count: u64) {
        self.engine.lock().advance_on_read = count;
    }

    pub fn total_count(&self) -> u64 {
        self.engine.lock().total_count
    }

    pub fn is_scanning(&self) -> bool {
        self.engine.lock().running
    }

    pub fn pulse_output(&self) -> Option<(f64, f64)> {
        *self.pulse.lock()
    }

    /// Register `edges` input edges on counter `id`.
    pub fn count_edges(&self, id: u32, edges: u64) {
        if let Some(counter) = self.counters.lock().get_mut(id as usize) {
            *counter += edges;
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn ensure_not_released(&self) -> Result<(), DeviceError> {
        if self.is_released() {
            return Err(DeviceError::Released);
        }
        Ok(())
    }

    fn achievable_rate(rate: f64) -> f64 {
        let divisor = (PACER_CLOCK_HZ / rate).round().max(1.0);
        PACER_CLOCK_HZ / divisor
    }

    fn spawn_pacer(&self, rate: f64, num_channels: u64) -> Pacer {
        let stop = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(&self.engine);
        let signal = Arc::clone(&self.signal);
        let thread_stop = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let start = Instant::now();
            let mut produced = 0u64;
            while !thread_stop.load(Ordering::SeqCst) {
                thread::sleep(PACER_TICK);
                let due = (start.elapsed().as_secs_f64() * rate) as u64 * num_channels;
                if due > produced {
                    engine.lock().write(&signal, due - produced);
                    produced = due;
                }
            }
        });

        Pacer { stop, handle }
    }

    fn stop_pacer(&self) {
        if let Some(pacer) = self.pacer.lock().take() {
            pacer.stop.store(true, Ordering::SeqCst);
            if pacer.handle.join().is_err() {
                log::error!("Simulated pacer thread panicked");
            }
        }
    }
}

impl DaqDevice for SimulatedDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn start_continuous_scan(&self, request: &ScanRequest) -> Result<f64, DeviceError> {
        self.ensure_not_released()?;
        let actual_rate = Self::achievable_rate(request.rate);
        {
            let mut engine = self.engine.lock();
            if engine.running {
                return Err(DeviceError::ScanAlreadyRunning);
            }
            if request.capacity == 0 || request.capacity > self.max_buffer_samples {
                return Err(DeviceError::BufferAllocation {
                    samples: request.capacity,
                });
            }
            let ring = RingStorage::allocate(self.model, request.capacity, request.range)
                .map_err(|_| DeviceError::BufferAllocation {
                    samples: request.capacity,
                })?;

            engine.ring = Some(ring);
            engine.request = Some(*request);
            engine.total_count = 0;
            engine.advance_on_read = 0;
            engine.running = true;
        }

        if self.pacing == Pacing::RealTime {
            let num_channels = u64::from(request.high_channel - request.low_channel + 1);
            *self.pacer.lock() = Some(self.spawn_pacer(actual_rate, num_channels));
        }

        log::debug!(
            "Simulated scan of channels {}..={} started at {} Hz ({} sample ring)",
            request.low_channel,
            request.high_channel,
            actual_rate,
            request.capacity
        );
        Ok(actual_rate)
    }

    fn scan_status(&self) -> Result<ScanStatus, DeviceError> {
        self.ensure_not_released()?;
        let engine = self.engine.lock();
        let capacity = engine.ring.as_ref().map_or(0, RingStorage::len);
        Ok(ScanStatus {
            state: if engine.running {
                ScanState::Running
            } else {
                ScanState::Idle
            },
            total_count: engine.total_count,
            buffer_index: if capacity == 0 {
                0
            } else {
                (engine.total_count % capacity as u64) as usize
            },
        })
    }

    fn read_buffer(&self, start: usize, dest: &mut [f64]) -> Result<(), DeviceError> {
        self.ensure_not_released()?;
        let mut engine = self.engine.lock();
        let ring = engine.ring.as_ref().ok_or(DeviceError::NoActiveScan)?;
        let capacity = ring.len();
        let end = start + dest.len();
        if end > capacity {
            return Err(DeviceError::BufferRange {
                start,
                end,
                capacity,
            });
        }
        ring.load(start, dest);

        let racing = std::mem::take(&mut engine.advance_on_read);
        if racing > 0 {
            engine.write(&self.signal, racing);
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), DeviceError> {
        self.stop_pacer();
        let mut engine = self.engine.lock();
        if engine.running {
            log::debug!("Simulated scan stopped after {} samples", engine.total_count);
        }
        engine.running = false;
        Ok(())
    }

    fn reset_counters(&self) -> Result<(), DeviceError> {
        self.ensure_not_released()?;
        self.counters.lock().iter_mut().for_each(|c| *c = 0);
        Ok(())
    }

    fn read_counter(&self, id: u32) -> Result<u64, DeviceError> {
        self.ensure_not_released()?;
        self.counters
            .lock()
            .get(id as usize)
            .copied()
            .ok_or_else(|| DeviceError::NoSuchCounter(self.descriptor.to_string(), id))
    }

    fn start_pulse(&self, frequency: f64, duty_cycle: f64) -> Result<(f64, f64), DeviceError> {
        self.ensure_not_released()?;
        if !self.descriptor.has_pulse_output {
            return Err(DeviceError::NoPulseOutput(self.descriptor.to_string()));
        }
        let frequency = Self::achievable_rate(frequency.clamp(f64::MIN_POSITIVE, PACER_CLOCK_HZ / 2.0));
        let duty_cycle = duty_cycle.clamp(0.01, 0.99);
        *self.pulse.lock() = Some((frequency, duty_cycle));
        Ok((frequency, duty_cycle))
    }

    fn stop_pulse(&self) -> Result<(), DeviceError> {
        *self.pulse.lock() = None;
        Ok(())
    }

    fn release(&self) -> Result<(), DeviceError> {
        self.stop_scan()?;
        self.stop_pulse()?;
        self.engine.lock().ring = None;
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop_pacer();
    }
}

pub struct SimulatedDeviceBuilder {
    descriptor: DeviceDescriptor,
    model: BufferModel,
    pacing: Pacing,
    signal: SignalFn,
    max_buffer_samples: usize,
}

impl SimulatedDeviceBuilder {
    pub fn new() -> Self {
        Self {
            descriptor: DeviceDescriptor {
                product_name: "USB-1608G".to_string(),
                unique_id: "SIM0001".to_string(),
                has_analog_input: true,
                has_pacer: true,
                single_ended_channels: 16,
                differential_channels: 8,
                ranges: vec![
                    VoltageRange::Bip10Volts,
                    VoltageRange::Bip5Volts,
                    VoltageRange::Bip2Volts,
                    VoltageRange::Bip1Volts,
                ],
                packet_size: 1,
                num_counters: 2,
                has_pulse_output: true,
            },
            model: BufferModel::Scaled,
            pacing: Pacing::Manual,
            signal: SimulatedDevice::ramp_signal(),
            max_buffer_samples: 64 * 1024 * 1024,
        }
    }

    pub fn descriptor(mut self, descriptor: DeviceDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn buffer_model(mut self, model: BufferModel) -> Self {
        self.model = model;
        self
    }

    pub fn pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn signal(mut self, signal: SignalFn) -> Self {
        self.signal = signal;
        self
    }

    /// Largest ring the device agrees to allocate.
    pub fn max_buffer_samples(mut self, samples: usize) -> Self {
        self.max_buffer_samples = samples;
        self
    }

    pub fn build(self) -> SimulatedDevice {
        let num_counters = self.descriptor.num_counters as usize;
        SimulatedDevice {
            descriptor: self.descriptor,
            model: self.model,
            pacing: self.pacing,
            signal: self.signal,
            max_buffer_samples: self.max_buffer_samples,
            engine: Arc::new(Mutex::new(ScanEngine {
                ring: None,
                request: None,
                running: false,
                total_count: 0,
                advance_on_read: 0,
            })),
            pacer: Mutex::new(None),
            counters: Mutex::new(vec![0; num_counters]),
            pulse: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }
}

impl Default for SimulatedDeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver over a fixed set of simulated boards.
pub struct SimulatedDriver {
    devices: Vec<Arc<SimulatedDevice>>,
}

impl SimulatedDriver {
    pub fn new(devices: Vec<Arc<SimulatedDevice>>) -> Self {
        Self { devices }
    }
}

impl DeviceDriver for SimulatedDriver {
    fn scan_devices(&mut self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        if self.devices.is_empty() {
            log::error!("No DAQ devices found");
            return Err(DeviceError::NoDevicesFound);
        }
        log::debug!("Found {} DAQ device(s)", self.devices.len());
        Ok(self.devices.iter().map(|d| d.descriptor().clone()).collect())
    }

    fn connect(&mut self, index: usize) -> Result<Arc<dyn DaqDevice>, DeviceError> {
        let device = self
            .devices
            .get(index)
            .ok_or(DeviceError::InvalidDeviceIndex {
                index,
                available: self.devices.len(),
            })?;
        device.released.store(false, Ordering::SeqCst);
        Ok(Arc::clone(device) as Arc<dyn DaqDevice>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanMode;

    fn request(capacity: usize) -> ScanRequest {
        ScanRequest {
            low_channel: 2,
            high_channel: 3,
            mode: ScanMode::SingleEnded,
            range: VoltageRange::Bip10Volts,
            rate: 1000.0,
            capacity,
        }
    }

    #[test]
    fn test_manual_advance_fills_ring_interleaved() {
        let device = SimulatedDevice::builder().build();
        device.start_continuous_scan(&request(8)).unwrap();
        device.advance(6);

        let status = device.scan_status().unwrap();
        assert_eq!(status.state, ScanState::Running);
        assert_eq!(status.total_count, 6);
        assert_eq!(status.buffer_index, 6);

        let mut dest = [0.0; 6];
        device.read_buffer(0, &mut dest).unwrap();
        assert_eq!(
            dest,
            [
                device.expected_sample(0, 2),
                device.expected_sample(0, 3),
                device.expected_sample(1, 2),
                device.expected_sample(1, 3),
                device.expected_sample(2, 2),
                device.expected_sample(2, 3),
            ]
        );
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let device = SimulatedDevice::builder().build();
        device.start_continuous_scan(&request(4)).unwrap();
        device.advance(6);

        let mut dest = [0.0; 2];
        device.read_buffer(0, &mut dest).unwrap();
        assert_eq!(dest, [device.expected_sample(2, 2), device.expected_sample(2, 3)]);
        assert_eq!(device.scan_status().unwrap().buffer_index, 2);
    }

    #[test]
    fn test_read_past_end_is_rejected() {
        let device = SimulatedDevice::builder().build();
        device.start_continuous_scan(&request(4)).unwrap();
        let mut dest = [0.0; 3];
        assert!(matches!(
            device.read_buffer(2, &mut dest),
            Err(DeviceError::BufferRange { start: 2, end: 5, capacity: 4 })
        ));
    }

    #[test]
    fn test_raw_model_scales_counts() {
        let device = SimulatedDevice::builder()
            .buffer_model(BufferModel::Raw)
            .signal(Arc::new(|_, channel| if channel == 2 { -10.0 } else { 3.3 }))
            .build();
        device.start_continuous_scan(&request(4)).unwrap();
        device.advance(2);

        let mut dest = [0.0; 2];
        device.read_buffer(0, &mut dest).unwrap();
        let lsb = 20.0 / RAW_FULL_SCALE;
        assert!((dest[0] + 10.0).abs() < f64::EPSILON);
        assert!((dest[1] - 3.3).abs() <= lsb);
    }

    #[test]
    fn test_allocation_limit() {
        let device = SimulatedDevice::builder().max_buffer_samples(100).build();
        assert!(matches!(
            device.start_continuous_scan(&request(200)),
            Err(DeviceError::BufferAllocation { samples: 200 })
        ));
        assert!(!device.is_scanning());
    }

    #[test]
    fn test_rate_is_rounded_to_pacer_clock() {
        let device = SimulatedDevice::builder().build();
        let mut req = request(8);
        req.rate = 3000.0;
        let actual = device.start_continuous_scan(&req).unwrap();
        assert!((actual - 1_000_000.0 / 333.0).abs() < 1e-9);
    }

    #[test]
    fn test_advance_during_next_read() {
        let device = SimulatedDevice::builder().build();
        device.start_continuous_scan(&request(8)).unwrap();
        device.advance(4);
        device.advance_during_next_read(10);

        let mut dest = [0.0; 4];
        device.read_buffer(0, &mut dest).unwrap();
        assert_eq!(device.total_count(), 14);
        assert_eq!(dest[0], device.expected_sample(0, 2));
    }

    #[test]
    fn test_realtime_pacing_produces_samples() {
        let device = SimulatedDevice::builder().pacing(Pacing::RealTime).build();
        let mut req = request(10_000);
        req.rate = 10_000.0;
        device.start_continuous_scan(&req).unwrap();
        thread::sleep(Duration::from_millis(50));
        device.stop_scan().unwrap();

        let produced = device.total_count();
        assert!(produced > 0);
        assert_eq!(produced % 2, 0, "pacer writes whole scans");
        assert!(!device.is_scanning());
    }

    #[test]
    fn test_stopped_scan_stays_readable_until_release() {
        let device = SimulatedDevice::builder().build();
        device.start_continuous_scan(&request(8)).unwrap();
        device.advance(4);
        device.stop_scan().unwrap();

        let status = device.scan_status().unwrap();
        assert_eq!(status.state, ScanState::Idle);
        assert_eq!(status.total_count, 4);
        let mut dest = [0.0; 4];
        device.read_buffer(0, &mut dest).unwrap();
        assert_eq!(dest[3], device.expected_sample(1, 3));

        device.release().unwrap();
        assert!(device.is_released());
    }

    #[test]
    fn test_counters_and_pulse() {
        let device = SimulatedDevice::builder().build();
        device.count_edges(1, 42);
        assert_eq!(device.read_counter(1).unwrap(), 42);
        device.reset_counters().unwrap();
        assert_eq!(device.read_counter(1).unwrap(), 0);
        assert!(matches!(device.read_counter(5), Err(DeviceError::NoSuchCounter(_, 5))));

        let (frequency, duty) = device.start_pulse(40.0, 0.5).unwrap();
        assert!((frequency - 40.0).abs() < 1e-9);
        assert!((duty - 0.5).abs() < f64::EPSILON);
        assert!(device.pulse_output().is_some());
        device.stop_pulse().unwrap();
        assert!(device.pulse_output().is_none());
    }

    #[test]
    fn test_released_device_rejects_calls() {
        let device = SimulatedDevice::builder().build();
        device.release().unwrap();
        assert!(matches!(device.scan_status(), Err(DeviceError::Released)));
        assert!(matches!(
            device.start_continuous_scan(&request(8)),
            Err(DeviceError::Released)
        ));
    }

    #[test]
    fn test_driver_enumeration() {
        let mut empty = SimulatedDriver::new(Vec::new());
        assert!(matches!(empty.scan_devices(), Err(DeviceError::NoDevicesFound)));

        let mut driver = SimulatedDriver::new(vec![Arc::new(SimulatedDevice::builder().build())]);
        let devices = driver.scan_devices().unwrap();
        assert_eq!(devices[0].to_string(), "USB-1608G_SIM0001");
        assert!(driver.connect(0).is_ok());
        assert!(matches!(
            driver.connect(3),
            Err(DeviceError::InvalidDeviceIndex { index: 3, available: 1 })
        ));
    }
}
