//! Per-channel display queues.
//!
//! The drain thread pushes every sample into the bounded queue of its channel
//! through [`ChannelFanout`]; the display refresh drains them through
//! [`DisplayQueues`]. A full queue drops the new sample and counts it; the
//! drain thread never waits on the display.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ChannelRange;

pub const QUEUE_CAPACITY: usize = 1000;
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_SAMPLES_PER_REFRESH: usize = 500;
pub const DEFAULT_HISTORY_SECONDS: f64 = 10.0;

/// Create the queue pair for one session.
pub fn channel_queues(range: ChannelRange, capacity: usize) -> (ChannelFanout, DisplayQueues) {
    let num_channels = range.num_channels();
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_channels).map(|_| bounded(capacity)).unzip();
    let drops: Arc<[AtomicU64]> = (0..num_channels).map(|_| AtomicU64::new(0)).collect();

    let fanout = ChannelFanout {
        senders,
        low: range.low(),
        cursor: 0,
        drops: Arc::clone(&drops),
        overflowing: vec![false; num_channels],
    };
    let display = DisplayQueues {
        receivers,
        channel_ids: range.channels().collect(),
        drops,
    };
    (fanout, display)
}

/// Producer side, owned by the drain thread.
pub struct ChannelFanout {
    senders: Vec<Sender<f64>>,
    low: u32,
    /// Position in the scan of the channel the next sample belongs to.
    cursor: usize,
    drops: Arc<[AtomicU64]>,
    overflowing: Vec<bool>,
}

impl ChannelFanout {
    /// Route interleaved samples to their channel queues. The channel cursor
    /// carries over between calls, so chunks need not hold whole scans.
    /// Returns how many samples were dropped on full queues.
    pub fn push_interleaved(&mut self, samples: &[f64]) -> usize {
        let num_channels = self.senders.len();
        let mut dropped = 0;

        for &sample in samples {
            let position = self.cursor;
            match self.senders[position].try_send(sample) {
                Ok(()) => self.overflowing[position] = false,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    self.drops[position].fetch_add(1, Ordering::Relaxed);
                    if !self.overflowing[position] {
                        self.overflowing[position] = true;
                        log::warn!(
                            "Display queue of channel {} is full, dropping samples",
                            self.low + position as u32
                        );
                    }
                }
                // Display side is gone; the file path is unaffected
                Err(TrySendError::Disconnected(_)) => {}
            }
            self.cursor = (self.cursor + 1) % num_channels;
        }
        dropped
    }

    /// Hardware channel the next sample will be routed to.
    pub fn active_channel(&self) -> u32 {
        self.low + self.cursor as u32
    }

    pub fn num_channels(&self) -> usize {
        self.senders.len()
    }
}

/// Samples taken from the queues in one refresh tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayBatch {
    /// One vector per scanned channel, in scan order.
    pub channels: Vec<Vec<f64>>,
    /// At least one queue still had samples after `max` were taken.
    pub saturated: bool,
}

impl DisplayBatch {
    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(Vec::is_empty)
    }
}

/// Consumer side, handed to the display layer.
#[derive(Clone)]
pub struct DisplayQueues {
    receivers: Vec<Receiver<f64>>,
    channel_ids: Vec<u32>,
    drops: Arc<[AtomicU64]>,
}

impl DisplayQueues {
    /// Take up to `max` samples from every queue without blocking.
    pub fn refresh(&self, max: usize) -> DisplayBatch {
        let channels: Vec<Vec<f64>> = self
            .receivers
            .iter()
            .map(|rx| rx.try_iter().take(max).collect())
            .collect();

        let saturated = max > 0 && channels.iter().any(|c: &Vec<f64>| c.len() == max);
        if saturated {
            log::warn!("Queue is not being emptied fast enough ({max} samples per refresh)");
        }
        DisplayBatch {
            channels,
            saturated,
        }
    }

    pub fn receiver(&self, position: usize) -> Option<&Receiver<f64>> {
        self.receivers.get(position)
    }

    pub fn channel_ids(&self) -> &[u32] {
        &self.channel_ids
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Samples waiting in each queue.
    pub fn queued(&self) -> Vec<usize> {
        self.receivers.iter().map(Receiver::len).collect()
    }

    pub fn drops(&self) -> Vec<u64> {
        self.drops.iter().map(|d| d.load(Ordering::Relaxed)).collect()
    }

    pub fn total_drops(&self) -> u64 {
        self.drops.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }
}

/// Rolling window of the most recent samples of each channel, for plotting.
#[derive(Debug, Clone)]
pub struct SignalHistory {
    per_channel: Vec<VecDeque<f64>>,
    length: usize,
    duration: f64,
}

impl SignalHistory {
    pub fn new(num_channels: usize, sampling_rate: f64, seconds: f64) -> Self {
        let length = ((sampling_rate * seconds) as usize).max(1);
        Self {
            per_channel: vec![VecDeque::from(vec![0.0; length]); num_channels],
            length,
            duration: seconds,
        }
    }

    pub fn update(&mut self, batch: &DisplayBatch) {
        for (history, new_samples) in self.per_channel.iter_mut().zip(&batch.channels) {
            for &sample in new_samples {
                if history.len() == self.length {
                    history.pop_front();
                }
                history.push_back(sample);
            }
        }
    }

    pub fn history(&self, position: usize) -> Vec<f64> {
        self.per_channel
            .get(position)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// History with its mean removed, shifted by `offset` volts.
    pub fn demeaned(&self, position: usize, offset: f64) -> Vec<f64> {
        let history = self.history(position);
        if history.is_empty() {
            return history;
        }
        let mean = history.iter().sum::<f64>() / history.len() as f64;
        history.into_iter().map(|v| v - mean + offset).collect()
    }

    /// Seconds relative to now for each history slot, from `-duration` to 0.
    pub fn time_axis(&self) -> Vec<f64> {
        if self.length == 1 {
            return vec![0.0];
        }
        let step = self.duration / (self.length - 1) as f64;
        (0..self.length)
            .map(|i| -self.duration + i as f64 * step)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.per_channel.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(low: u32, high: u32) -> ChannelRange {
        ChannelRange::new(low, high).unwrap()
    }

    #[test]
    fn test_fanout_routes_by_channel_across_chunks() {
        let (mut fanout, display) = channel_queues(range(2, 4), QUEUE_CAPACITY);
        // Chunk boundaries that split a scan
        fanout.push_interleaved(&[20.0, 30.0]);
        assert_eq!(fanout.active_channel(), 4);
        fanout.push_interleaved(&[40.0, 21.0, 31.0, 41.0, 22.0]);
        assert_eq!(fanout.active_channel(), 3);

        let batch = display.refresh(MAX_SAMPLES_PER_REFRESH);
        assert_eq!(batch.channels[0], vec![20.0, 21.0, 22.0]);
        assert_eq!(batch.channels[1], vec![30.0, 31.0]);
        assert_eq!(batch.channels[2], vec![40.0, 41.0]);
        assert!(!batch.saturated);
        assert_eq!(display.channel_ids(), [2, 3, 4]);
    }

    #[test]
    fn test_full_queue_drops_new_samples() {
        let (mut fanout, display) = channel_queues(range(0, 1), 3);
        let samples: Vec<f64> = (0..10).map(f64::from).collect();
        let dropped = fanout.push_interleaved(&samples);

        // Each queue accepts 3 of its 5 samples
        assert_eq!(dropped, 4);
        assert_eq!(display.drops(), vec![2, 2]);
        assert_eq!(display.total_drops(), 4);

        let batch = display.refresh(10);
        assert_eq!(batch.channels[0], vec![0.0, 2.0, 4.0]);
        assert_eq!(batch.channels[1], vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_refresh_takes_at_most_max() {
        let (mut fanout, display) = channel_queues(range(0, 0), QUEUE_CAPACITY);
        let samples: Vec<f64> = (0..700).map(f64::from).collect();
        fanout.push_interleaved(&samples);

        let first = display.refresh(MAX_SAMPLES_PER_REFRESH);
        assert_eq!(first.channels[0].len(), 500);
        assert!(first.saturated);
        assert_eq!(display.queued(), vec![200]);

        let second = display.refresh(MAX_SAMPLES_PER_REFRESH);
        assert_eq!(second.channels[0].len(), 200);
        assert_eq!(second.channels[0][0], 500.0);
        assert!(!second.saturated);

        assert!(display.refresh(MAX_SAMPLES_PER_REFRESH).is_empty());
    }

    #[test]
    fn test_push_after_display_dropped_is_silent() {
        let (mut fanout, display) = channel_queues(range(0, 1), 2);
        drop(display);
        assert_eq!(fanout.push_interleaved(&[1.0, 2.0, 3.0]), 0);
    }

    #[test]
    fn test_signal_history_rolls() {
        let mut history = SignalHistory::new(2, 2.0, 2.0);
        assert_eq!(history.len(), 4);
        assert_eq!(history.history(0), vec![0.0; 4]);

        history.update(&DisplayBatch {
            channels: vec![vec![1.0, 2.0, 3.0], vec![5.0]],
            saturated: false,
        });
        assert_eq!(history.history(0), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(history.history(1), vec![0.0, 0.0, 0.0, 5.0]);
        assert!(history.history(9).is_empty());

        let demeaned = history.demeaned(0, 0.0);
        assert!((demeaned.iter().sum::<f64>()).abs() < 1e-12);

        let axis = history.time_axis();
        assert_eq!(axis.len(), 4);
        assert!((axis[0] + 2.0).abs() < 1e-12);
        assert!(axis[3].abs() < 1e-12);
    }
}
