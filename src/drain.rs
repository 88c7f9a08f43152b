//! The reader side of the driver's circular buffer.
//!
//! The hardware scan writes interleaved samples into a ring of `capacity`
//! samples and only reports how many it has written so far. [`DrainLoop`]
//! tracks how many it has consumed, copies whole chunks out of the ring and
//! hands them to the recording file and the display queues. Falling more than
//! one ring behind the writer means samples were overwritten unseen, which
//! ends the session.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::BufferLayout;
use crate::device::{DaqDevice, DeviceError, ScanState};
use crate::queue::ChannelFanout;
use crate::recording::{RecordingError, RecordingWriter};
use crate::ring;

/// Sleep between status polls while less than a chunk is pending.
pub const POLL_INTERVAL: Duration = Duration::from_micros(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunPhase {
    BeforeCopy,
    AfterCopy,
}

impl fmt::Display for OverrunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeCopy => write!(f, "before copy"),
            Self::AfterCopy => write!(f, "during copy"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("Buffer overrun detected {phase}: {pending} samples pending in a {capacity} sample buffer")]
    BufferOverrun {
        phase: OverrunPhase,
        pending: u64,
        capacity: usize,
    },

    #[error("Device error while draining: {0}")]
    Device(#[from] DeviceError),

    #[error("Recording error while draining: {0}")]
    Recording(#[from] RecordingError),
}

/// Position of the reader in the sample stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainState {
    total_consumed: u64,
    read_cursor: usize,
}

impl DrainState {
    pub fn total_consumed(&self) -> u64 {
        self.total_consumed
    }

    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    fn advance(&mut self, count: usize, capacity: usize) {
        self.read_cursor = ring::advance_cursor(self.read_cursor, count, capacity);
        self.total_consumed += count as u64;
    }
}

/// Compares the writer's total count against what has been consumed.
#[derive(Debug, Clone, Copy)]
pub struct OverrunDetector {
    capacity: usize,
}

impl OverrunDetector {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Returns the number of pending samples, or an overrun if more than a
    /// whole ring is pending.
    pub fn check(&self, phase: OverrunPhase, total_count: u64, consumed: u64) -> Result<u64, DrainError> {
        let pending = total_count.saturating_sub(consumed);
        if pending > self.capacity as u64 {
            return Err(DrainError::BufferOverrun {
                phase,
                pending,
                capacity: self.capacity,
            });
        }
        Ok(pending)
    }
}

/// Counters shared between the drain thread and the session.
#[derive(Debug, Default)]
pub struct DrainStats {
    chunks: AtomicU64,
    samples: AtomicU64,
}

impl DrainStats {
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    fn record_chunk(&self, samples: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples as u64, Ordering::Relaxed);
    }
}

/// Outcome of one [`DrainLoop::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    /// Less than a chunk is pending; poll again later.
    Waiting { pending: u64 },
    /// One chunk of this many samples was dispatched.
    Drained(usize),
    /// The scan is no longer running and less than a chunk remains.
    ScanStopped,
}

pub struct DrainLoop {
    device: Arc<dyn DaqDevice>,
    layout: BufferLayout,
    state: DrainState,
    detector: OverrunDetector,
    scratch: Vec<f64>,
    writer: Option<RecordingWriter>,
    fanout: Option<ChannelFanout>,
    stats: Arc<DrainStats>,
}

impl DrainLoop {
    pub fn new(device: Arc<dyn DaqDevice>, layout: BufferLayout) -> Self {
        Self {
            device,
            layout,
            state: DrainState::default(),
            detector: OverrunDetector::new(layout.capacity),
            scratch: vec![0.0; layout.chunk_size],
            writer: None,
            fanout: None,
            stats: Arc::new(DrainStats::default()),
        }
    }

    /// Append every drained chunk to `writer`.
    pub fn with_writer(mut self, writer: RecordingWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Push every drained sample to its channel queue.
    pub fn with_fanout(mut self, fanout: ChannelFanout) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub fn stats(&self) -> Arc<DrainStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> DrainState {
        self.state
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Poll the scan once and drain at most one chunk.
    pub fn step(&mut self) -> Result<DrainStep, DrainError> {
        let status = self.device.scan_status()?;
        let pending = self.detector.check(
            OverrunPhase::BeforeCopy,
            status.total_count,
            self.state.total_consumed,
        )?;

        let chunk_size = self.layout.chunk_size;
        if pending < chunk_size as u64 {
            if status.state == ScanState::Idle {
                return Ok(DrainStep::ScanStopped);
            }
            return Ok(DrainStep::Waiting { pending });
        }

        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("drain chunk"), 0));

        let device = &self.device;
        ring::copy_wrapped(
            self.state.read_cursor,
            self.layout.capacity,
            &mut self.scratch,
            |start, dest| device.read_buffer(start, dest),
        )?;

        // The writer may have lapped the cursor while we were copying
        let status = self.device.scan_status()?;
        self.detector.check(
            OverrunPhase::AfterCopy,
            status.total_count,
            self.state.total_consumed,
        )?;

        if let Some(writer) = self.writer.as_mut() {
            writer.append(&self.scratch)?;
        }
        if let Some(fanout) = self.fanout.as_mut() {
            fanout.push_interleaved(&self.scratch);
        }

        self.state.advance(chunk_size, self.layout.capacity);
        self.stats.record_chunk(chunk_size);
        Ok(DrainStep::Drained(chunk_size))
    }

    /// Drain until `stop` is set, the scan goes idle, or the loop fails.
    ///
    /// On failure the hardware scan is stopped. The recording file is closed
    /// in every case, keeping whatever was written before the failure.
    pub fn run(mut self, stop: &AtomicBool) -> Result<DrainState, DrainError> {
        let span = tracing::info_span!(
            "drain",
            capacity = self.layout.capacity,
            chunk_size = self.layout.chunk_size,
            recording = self.writer.is_some()
        );
        let _enter = span.enter();
        log::debug!(
            "Draining {} sample buffer in chunks of {}",
            self.layout.capacity,
            self.layout.chunk_size
        );

        let result = self.drain_until(stop);

        if let Err(err) = &result {
            log::error!("Acquisition stopped: {err}");
            if let Err(stop_err) = self.device.stop_scan() {
                log::error!("Failed to stop scan after drain failure: {stop_err}");
            }
        }

        let closed = self.close_writer();
        result?;
        closed?;

        log::debug!(
            "Drain finished after {} samples in {} chunks",
            self.state.total_consumed,
            self.stats.chunks()
        );
        Ok(self.state)
    }

    fn drain_until(&mut self, stop: &AtomicBool) -> Result<(), DrainError> {
        while !stop.load(Ordering::SeqCst) {
            match self.step()? {
                DrainStep::Waiting { .. } => thread::sleep(POLL_INTERVAL),
                DrainStep::Drained(_) => {}
                DrainStep::ScanStopped => {
                    log::debug!("Scan went idle, leaving drain loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn close_writer(&mut self) -> Result<(), DrainError> {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.close() {
                log::error!("Failed to close {}: {err}", writer.path().display());
                return Err(err.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::device::ScanRequest;
    use crate::queue::{channel_queues, MAX_SAMPLES_PER_REFRESH};
    use crate::recording::{Recording, RecordingHeader};
    use crate::simulated::SimulatedDevice;

    fn layout(capacity: usize, chunk_size: usize, num_channels: usize) -> BufferLayout {
        BufferLayout {
            num_channels,
            points_per_channel: capacity / num_channels,
            capacity,
            chunk_size,
        }
    }

    fn started_device(layout: &BufferLayout, rate: f64) -> Arc<SimulatedDevice> {
        let device = Arc::new(SimulatedDevice::builder().build());
        device
            .start_continuous_scan(&ScanRequest {
                low_channel: 0,
                high_channel: layout.num_channels as u32 - 1,
                mode: crate::config::ScanMode::SingleEnded,
                range: crate::config::VoltageRange::Bip10Volts,
                rate,
                capacity: layout.capacity,
            })
            .unwrap();
        device
    }

    fn header(num_channels: usize) -> RecordingHeader {
        let config = SessionConfig::builder()
            .channel_range(0, num_channels as u32 - 1)
            .build()
            .unwrap();
        RecordingHeader::for_session(&config, 1000.0)
    }

    #[test]
    fn test_overrun_detector() {
        let detector = OverrunDetector::new(100);
        assert_eq!(detector.check(OverrunPhase::BeforeCopy, 100, 0).unwrap(), 100);
        assert_eq!(detector.check(OverrunPhase::BeforeCopy, 130, 40).unwrap(), 90);
        assert!(matches!(
            detector.check(OverrunPhase::AfterCopy, 141, 40),
            Err(DrainError::BufferOverrun {
                phase: OverrunPhase::AfterCopy,
                pending: 101,
                capacity: 100
            })
        ));
    }

    #[test]
    fn test_waits_for_a_full_chunk() {
        let layout = layout(100, 30, 1);
        let device = started_device(&layout, 1000.0);
        let mut drain = DrainLoop::new(device.clone(), layout);

        device.advance(29);
        assert_eq!(drain.step().unwrap(), DrainStep::Waiting { pending: 29 });
        device.advance(1);
        assert_eq!(drain.step().unwrap(), DrainStep::Drained(30));
        assert_eq!(drain.state().total_consumed(), 30);
        assert_eq!(drain.state().read_cursor(), 30);
    }

    #[test]
    fn test_wrapped_chunks_preserve_order() {
        let layout = layout(100, 30, 1);
        let device = started_device(&layout, 1000.0);
        let (fanout, display) = channel_queues(crate::config::ChannelRange::new(0, 0).unwrap(), 1000);
        let mut drain = DrainLoop::new(device.clone(), layout).with_fanout(fanout);

        // Cursor walks 0, 30, 60, 90 -> 20, so the fourth chunk wraps
        for _ in 0..5 {
            device.advance(30);
            assert_eq!(drain.step().unwrap(), DrainStep::Drained(30));
        }
        assert_eq!(drain.state().read_cursor(), 50);

        let drained = &display.refresh(MAX_SAMPLES_PER_REFRESH).channels[0];
        let expected: Vec<f64> = (0..150).map(|scan| device.expected_sample(scan, 0)).collect();
        assert_eq!(drained, &expected);
    }

    #[test]
    fn test_overrun_before_copy_stops_scan() {
        let layout = layout(100, 5, 1);
        let device = started_device(&layout, 1000.0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrun.bin");
        let writer = RecordingWriter::create(&path, &header(1)).unwrap();
        let drain = DrainLoop::new(device.clone(), layout).with_writer(writer);

        device.advance(101);
        let stop = AtomicBool::new(false);
        let err = drain.run(&stop).unwrap_err();

        assert!(matches!(
            err,
            DrainError::BufferOverrun {
                phase: OverrunPhase::BeforeCopy,
                pending: 101,
                capacity: 100
            }
        ));
        assert!(!device.is_scanning());
        let recording = Recording::open(&path).unwrap();
        assert_eq!(recording.num_samples(), 0);
    }

    #[test]
    fn test_overrun_during_copy_discards_chunk() {
        let layout = layout(100, 20, 1);
        let device = started_device(&layout, 1000.0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.bin");
        let writer = RecordingWriter::create(&path, &header(1)).unwrap();
        let mut drain = DrainLoop::new(device.clone(), layout).with_writer(writer);

        device.advance(40);
        assert_eq!(drain.step().unwrap(), DrainStep::Drained(20));

        // 20 pending before the copy, 20 + 90 after it
        device.advance_during_next_read(90);
        let err = drain.step().unwrap_err();
        assert!(matches!(
            err,
            DrainError::BufferOverrun {
                phase: OverrunPhase::AfterCopy,
                pending: 110,
                ..
            }
        ));
        assert_eq!(drain.state().total_consumed(), 20);
        drop(drain);

        let recording = Recording::open(&path).unwrap();
        assert_eq!(recording.num_samples(), 20);
    }

    #[test]
    fn test_sixty_seconds_without_loss() {
        let rate = 1000.0;
        let config = SessionConfig::builder()
            .channel_range(0, 1)
            .sampling_rate(rate)
            .build()
            .unwrap();
        let layout = BufferLayout::new(&config, 1);
        assert_eq!(layout.capacity, 4000);
        assert_eq!(layout.chunk_size, 200);

        let device = started_device(&layout, rate);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sixty.bin");
        let writer = RecordingWriter::create(&path, &RecordingHeader::for_session(&config, rate)).unwrap();
        let mut drain = DrainLoop::new(device.clone(), layout).with_writer(writer);

        // Producer advances one chunk period (0.1 s at 2 x 1000 Hz) per tick
        let per_tick = layout.chunk_size as u64;
        let ticks = 60 * rate as u64 * 2 / per_tick;
        for _ in 0..ticks {
            device.advance(per_tick);
            assert_eq!(drain.step().unwrap(), DrainStep::Drained(layout.chunk_size));
        }
        device.stop_scan().unwrap();
        let state = drain.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(state.total_consumed(), 120_000);

        let recording = Recording::open(&path).unwrap();
        assert_eq!(recording.num_samples(), 60_000);
        for (scan, row) in recording.rows().enumerate() {
            assert_eq!(row[0], device.expected_sample(scan as u64, 0));
            assert_eq!(row[1], device.expected_sample(scan as u64, 1));
        }
    }

    #[test]
    fn test_stalled_display_does_not_affect_file() {
        let layout = layout(400, 20, 2);
        let device = started_device(&layout, 1000.0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stall.bin");
        let writer = RecordingWriter::create(&path, &header(2)).unwrap();
        let (fanout, display) = channel_queues(crate::config::ChannelRange::new(0, 1).unwrap(), 10);
        let mut drain = DrainLoop::new(device.clone(), layout)
            .with_writer(writer)
            .with_fanout(fanout);

        for _ in 0..10 {
            device.advance(20);
            assert_eq!(drain.step().unwrap(), DrainStep::Drained(20));
        }
        assert_eq!(display.drops(), vec![90, 90]);
        assert_eq!(display.queued(), vec![10, 10]);
        drop(drain);

        let recording = Recording::open(&path).unwrap();
        assert_eq!(recording.num_samples(), 100);
        assert_eq!(recording.row(99).unwrap()[1], device.expected_sample(99, 1));
    }

    #[test]
    fn test_stop_flag_ends_loop() {
        let layout = layout(100, 10, 1);
        let device = started_device(&layout, 1000.0);
        let drain = DrainLoop::new(device.clone(), layout);
        let stats = drain.stats();

        device.advance(50);
        let stop = AtomicBool::new(true);
        let state = drain.run(&stop).unwrap();
        assert_eq!(state.total_consumed(), 0);
        assert_eq!(stats.chunks(), 0);
        assert!(device.is_scanning());
    }

    #[test]
    fn test_idle_scan_drains_remaining_chunks() {
        let layout = layout(100, 10, 1);
        let device = started_device(&layout, 1000.0);
        let drain = DrainLoop::new(device.clone(), layout);
        let stats = drain.stats();

        device.advance(35);
        device.stop_scan().unwrap();
        let state = drain.run(&AtomicBool::new(false)).unwrap();

        // Whole chunks only; the 5 sample tail is left behind
        assert_eq!(state.total_consumed(), 30);
        assert_eq!(stats.chunks(), 3);
    }
}
