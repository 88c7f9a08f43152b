//! Binary recording files.
//!
//! ```text
//! [0, 16)        header length H, unsigned little-endian
//! [16, 16 + H)   UTF-8 JSON header
//! [16 + H, EOF)  f64 little-endian samples, one row per scan:
//!                s0_ch_low, s0_ch_low+1, ..., s0_ch_high, s1_ch_low, ...
//! ```
//!
//! Files are append-only while recording. A recording cut short still
//! reads back: a trailing partial row is dropped on read.

use chrono::Local;
use polars::prelude::{Column, CsvWriter, DataFrame, NamedFrom, PolarsError, SerWriter, Series};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{SessionConfig, VoltageRange};

pub const LENGTH_PREFIX_BYTES: usize = 16;
pub const SAMPLE_BYTES: usize = std::mem::size_of::<f64>();
pub const FILE_EXTENSION: &str = "bin";

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header is not valid JSON: {0}")]
    Header(#[from] serde_json::Error),

    #[error("File is {actual} bytes, too short for the {expected} byte header")]
    Truncated { expected: u128, actual: usize },

    #[error("Header declares zero channels")]
    NoChannels,

    #[error("Recording writer is already closed")]
    Closed,

    #[error("Failed to build data frame: {0}")]
    DataFrame(#[from] PolarsError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: u32,
    pub name: String,
}

/// Session metadata stored at the start of every recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub num_channels: usize,
    pub channel_list: Vec<ChannelEntry>,
    pub voltage_range: VoltageRange,
    pub device: String,
    pub sampling_rate: f64,
    pub datetime: String,
}

impl RecordingHeader {
    /// Header for a session scanning at `sampling_rate`, the rate the hardware actually runs at.
    pub fn for_session(config: &SessionConfig, sampling_rate: f64) -> Self {
        let channel_list = config
            .channel_range()
            .channels()
            .zip(config.channel_names())
            .map(|(id, name)| ChannelEntry {
                id,
                name: name.clone(),
            })
            .collect();

        Self {
            num_channels: config.num_channels(),
            channel_list,
            voltage_range: config.voltage_range(),
            device: config.device().to_string(),
            sampling_rate,
            datetime: Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channel_list.iter().map(|c| c.name.clone()).collect()
    }
}

/// `recording_<date>_<time>.bin` inside `dir`.
pub fn default_file_name(dir: impl AsRef<Path>) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.as_ref()
        .join(format!("recording_{stamp}.{FILE_EXTENSION}"))
}

/// Single-writer sink for one recording session.
///
/// Writes go straight to the file without a userspace buffer; the drain loop
/// already hands over whole chunks.
#[derive(Debug)]
pub struct RecordingWriter {
    file: Option<File>,
    path: PathBuf,
    samples_written: u64,
    scratch: Vec<u8>,
}

impl RecordingWriter {
    /// Create the file and write the length prefix and header.
    pub fn create(path: impl AsRef<Path>, header: &RecordingHeader) -> Result<Self, RecordingError> {
        let path = path.as_ref().to_path_buf();
        let json = serde_json::to_vec(header)?;

        let mut preamble = Vec::with_capacity(LENGTH_PREFIX_BYTES + json.len());
        preamble.extend_from_slice(&(json.len() as u128).to_le_bytes());
        preamble.extend_from_slice(&json);

        let mut file = File::create(&path)?;
        file.write_all(&preamble)?;
        log::info!("Recording to {} ({} channels)", path.display(), header.num_channels);

        Ok(Self {
            file: Some(file),
            path,
            samples_written: 0,
            scratch: Vec::new(),
        })
    }

    /// Append samples in the order given.
    pub fn append(&mut self, samples: &[f64]) -> Result<(), RecordingError> {
        let file = self.file.as_mut().ok_or(RecordingError::Closed)?;

        self.scratch.clear();
        self.scratch.reserve(samples.len() * SAMPLE_BYTES);
        for sample in samples {
            self.scratch.extend_from_slice(&sample.to_le_bytes());
        }
        file.write_all(&self.scratch)?;
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    /// Flush to disk and release the handle. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), RecordingError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_data()?;
            log::info!(
                "Closed {} after {} samples",
                self.path.display(),
                self.samples_written
            );
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }
}

impl Drop for RecordingWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close {}: {}", self.path.display(), e);
        }
    }
}

/// A recording loaded back into memory as whole rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub header: RecordingHeader,
    samples: Vec<f64>,
    dropped_samples: usize,
}

impl Recording {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordingError> {
        let (prefix, rest) = bytes
            .split_first_chunk::<LENGTH_PREFIX_BYTES>()
            .ok_or(RecordingError::Truncated {
                expected: LENGTH_PREFIX_BYTES as u128,
                actual: bytes.len(),
            })?;

        let header_len = u128::from_le_bytes(*prefix);
        let header_end = usize::try_from(header_len)
            .ok()
            .filter(|&len| len <= rest.len())
            .ok_or(RecordingError::Truncated {
                expected: header_len,
                actual: rest.len(),
            })?;

        let header: RecordingHeader = serde_json::from_slice(&rest[..header_end])?;
        let num_channels = header.num_channels;
        if num_channels == 0 {
            return Err(RecordingError::NoChannels);
        }

        let data = &rest[header_end..];
        let total = data.len() / SAMPLE_BYTES;
        let whole_rows = total / num_channels;
        let kept = whole_rows * num_channels;

        let samples = data
            .chunks_exact(SAMPLE_BYTES)
            .take(kept)
            .map(|b| f64::from_le_bytes(b.try_into().unwrap_or([0; SAMPLE_BYTES])))
            .collect();

        if kept != total {
            log::debug!("Dropping {} samples of a partial trailing row", total - kept);
        }

        Ok(Self {
            header,
            samples,
            dropped_samples: total - kept,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.header.num_channels
    }

    /// Number of complete rows.
    pub fn num_samples(&self) -> usize {
        self.samples.len() / self.num_channels()
    }

    /// Samples discarded because they formed an incomplete last row.
    pub fn dropped_samples(&self) -> usize {
        self.dropped_samples
    }

    /// Interleaved samples, `num_samples * num_channels` long.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.samples.chunks_exact(self.num_channels()).nth(index)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.samples.chunks_exact(self.num_channels())
    }

    /// `[num_samples][num_channels]`
    pub fn matrix(&self) -> Vec<Vec<f64>> {
        self.rows().map(<[f64]>::to_vec).collect()
    }

    pub fn channel(&self, position: usize) -> Vec<f64> {
        if position >= self.num_channels() {
            return Vec::new();
        }
        self.rows().map(|row| row[position]).collect()
    }

    /// One column per channel, named after the channel.
    pub fn to_dataframe(&self) -> Result<DataFrame, RecordingError> {
        let names = self.header.channel_names();
        let columns: Vec<Column> = (0..self.num_channels())
            .map(|position| {
                let name = names
                    .get(position)
                    .cloned()
                    .unwrap_or_else(|| format!("channel_{position}"));
                Series::new(name.into(), self.channel(position)).into()
            })
            .collect();
        Ok(DataFrame::new(columns)?)
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), RecordingError> {
        let mut df = self.to_dataframe()?;
        let mut file = File::create(path.as_ref())?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .finish(&mut df)?;
        Ok(())
    }
}
