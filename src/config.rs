use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::device::DaqDevice;

/// Smallest ring buffer the driver accepts, in points per channel.
pub const MIN_POINTS_PER_CHANNEL: usize = 10;
/// The ring buffer is drained in pieces of `capacity / CHUNK_DIVISOR` samples.
pub const CHUNK_DIVISOR: usize = 20;
pub const DEFAULT_BUFFER_SECONDS: f64 = 2.0;
/// Highest channel number a range may name.
pub const MAX_CHANNEL: u32 = 0xFFFF;

/// One color per channel slot, "bright" palette.
pub const COLOR_PALETTE: [&str; 16] = [
    "#023eff", "#ff7c00", "#1ac938", "#e8000b", "#8b2be2", "#9f4800", "#f14cc1", "#a3a3a3",
    "#ffc400", "#00d7ff", "#023eff", "#ff7c00", "#1ac938", "#e8000b", "#8b2be2", "#9f4800",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No channel is enabled for acquisition")]
    NoActiveChannels,

    #[error("Enabled channels {ids:?} are not contiguous; the scan covers a single low-high range")]
    NonContiguousChannels { ids: Vec<u32> },

    #[error("Invalid channel range {low}..={high}")]
    InvalidChannelRange { low: u32, high: u32 },

    #[error("Sampling rate must be positive, got {0}")]
    InvalidSamplingRate(f64),

    #[error("Buffer length must be positive, got {0} seconds")]
    InvalidBufferSeconds(f64),

    #[error("Voltage range {range} is not supported by this device (supported: {supported:?})")]
    UnsupportedRange {
        range: VoltageRange,
        supported: Vec<VoltageRange>,
    },

    #[error("Input mode {0:?} is not supported by this device")]
    UnsupportedScanMode(ScanMode),

    #[error("Channel {high} out of range: device has {available} channels in {mode:?} mode")]
    ChannelOutOfRange {
        high: u32,
        available: u32,
        mode: ScanMode,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings file error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Analog input range codes, named the way the vendor driver names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoltageRange {
    #[serde(rename = "BIP20VOLTS")]
    Bip20Volts,
    #[serde(rename = "BIP10VOLTS")]
    Bip10Volts,
    #[serde(rename = "BIP5VOLTS")]
    Bip5Volts,
    #[serde(rename = "BIP4VOLTS")]
    Bip4Volts,
    #[serde(rename = "BIP2PT5VOLTS")]
    Bip2Pt5Volts,
    #[serde(rename = "BIP2VOLTS")]
    Bip2Volts,
    #[serde(rename = "BIP1VOLTS")]
    Bip1Volts,
    #[serde(rename = "UNI10VOLTS")]
    Uni10Volts,
    #[serde(rename = "UNI5VOLTS")]
    Uni5Volts,
    #[serde(rename = "UNI2VOLTS")]
    Uni2Volts,
    #[serde(rename = "UNI1VOLTS")]
    Uni1Volts,
}

impl VoltageRange {
    pub const ALL: [Self; 11] = [
        Self::Bip20Volts,
        Self::Bip10Volts,
        Self::Bip5Volts,
        Self::Bip4Volts,
        Self::Bip2Pt5Volts,
        Self::Bip2Volts,
        Self::Bip1Volts,
        Self::Uni10Volts,
        Self::Uni5Volts,
        Self::Uni2Volts,
        Self::Uni1Volts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bip20Volts => "BIP20VOLTS",
            Self::Bip10Volts => "BIP10VOLTS",
            Self::Bip5Volts => "BIP5VOLTS",
            Self::Bip4Volts => "BIP4VOLTS",
            Self::Bip2Pt5Volts => "BIP2PT5VOLTS",
            Self::Bip2Volts => "BIP2VOLTS",
            Self::Bip1Volts => "BIP1VOLTS",
            Self::Uni10Volts => "UNI10VOLTS",
            Self::Uni5Volts => "UNI5VOLTS",
            Self::Uni2Volts => "UNI2VOLTS",
            Self::Uni1Volts => "UNI1VOLTS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == name)
    }

    /// Input span in volts as `(min, max)`.
    pub fn span(&self) -> (f64, f64) {
        match self {
            Self::Bip20Volts => (-20.0, 20.0),
            Self::Bip10Volts => (-10.0, 10.0),
            Self::Bip5Volts => (-5.0, 5.0),
            Self::Bip4Volts => (-4.0, 4.0),
            Self::Bip2Pt5Volts => (-2.5, 2.5),
            Self::Bip2Volts => (-2.0, 2.0),
            Self::Bip1Volts => (-1.0, 1.0),
            Self::Uni10Volts => (0.0, 10.0),
            Self::Uni5Volts => (0.0, 5.0),
            Self::Uni2Volts => (0.0, 2.0),
            Self::Uni1Volts => (0.0, 1.0),
        }
    }

    pub fn is_bipolar(&self) -> bool {
        self.span().0 < 0.0
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanMode {
    #[default]
    SingleEnded,
    Differential,
}

/// Contiguous inclusive range of hardware channels covered by one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    low: u32,
    high: u32,
}

impl ChannelRange {
    pub fn new(low: u32, high: u32) -> Result<Self, ConfigError> {
        if high < low || high > MAX_CHANNEL {
            return Err(ConfigError::InvalidChannelRange { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> u32 {
        self.low
    }

    pub fn high(&self) -> u32 {
        self.high
    }

    pub fn num_channels(&self) -> usize {
        (self.high - self.low + 1) as usize
    }

    pub fn channels(&self) -> impl Iterator<Item = u32> {
        self.low..=self.high
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub id: u32,
    pub name: String,
    pub active: bool,
    /// Plot window the channel is shown in; `-1` hides it.
    #[serde(default)]
    pub win: i32,
    #[serde(default)]
    pub color: String,
}

impl ChannelSettings {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: format!("Channel_{id}"),
            active: true,
            win: -1,
            color: COLOR_PALETTE[id as usize % COLOR_PALETTE.len()].to_string(),
        }
    }
}

/// User-facing acquisition settings, persisted as JSON between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub channel_list: Vec<ChannelSettings>,
    pub device: Option<String>,
    pub voltage_range: VoltageRange,
    pub sampling_rate: f64,
    /// `None` lets the connected board pick its preferred input mode.
    pub scan_mode: Option<ScanMode>,
    pub scan_counters: bool,
    pub buffer_seconds: f64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            channel_list: (0..16).map(ChannelSettings::new).collect(),
            device: Some("USB-1608G".to_string()),
            voltage_range: VoltageRange::Bip5Volts,
            sampling_rate: 1000.0,
            scan_mode: None,
            scan_counters: false,
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
        }
    }
}

impl AcquisitionSettings {
    /// Load settings from a JSON file. Keys missing from the file keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let settings = serde_json::from_str(&text)?;
        log::debug!("Loaded settings from {}", path.as_ref().display());
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), text)?;
        log::debug!("Saved settings to {}", path.as_ref().display());
        Ok(())
    }
}

/// Immutable description of one acquisition run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    channel_range: ChannelRange,
    channel_names: Vec<String>,
    voltage_range: VoltageRange,
    sampling_rate: f64,
    scan_mode: Option<ScanMode>,
    buffer_seconds: f64,
    device: String,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Derive a session from the enabled channels of `settings`.
    pub fn from_settings(settings: &AcquisitionSettings) -> Result<Self, ConfigError> {
        let mut active: Vec<&ChannelSettings> =
            settings.channel_list.iter().filter(|c| c.active).collect();
        active.sort_by_key(|c| c.id);

        let (first, last) = match (active.first(), active.last()) {
            (Some(first), Some(last)) => (first.id, last.id),
            _ => return Err(ConfigError::NoActiveChannels),
        };

        let contiguous = active.windows(2).all(|w| w[1].id == w[0].id + 1);
        if !contiguous {
            return Err(ConfigError::NonContiguousChannels {
                ids: active.iter().map(|c| c.id).collect(),
            });
        }

        SessionConfigBuilder::new()
            .channel_range(first, last)
            .channel_names(active.iter().map(|c| c.name.clone()).collect())
            .voltage_range(settings.voltage_range)
            .sampling_rate(settings.sampling_rate)
            .optional_scan_mode(settings.scan_mode)
            .buffer_seconds(settings.buffer_seconds)
            .device(settings.device.clone().unwrap_or_default())
            .build()
    }

    pub fn channel_range(&self) -> ChannelRange {
        self.channel_range
    }

    pub fn num_channels(&self) -> usize {
        self.channel_range.num_channels()
    }

    /// Names of the scanned channels, in scan order.
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn voltage_range(&self) -> VoltageRange {
        self.voltage_range
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Input mode, or `None` until resolved against a connected board.
    pub fn scan_mode(&self) -> Option<ScanMode> {
        self.scan_mode
    }

    pub fn buffer_seconds(&self) -> f64 {
        self.buffer_seconds
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Same session with the device name filled in from the connected hardware.
    pub fn with_device(mut self, device: &str) -> Self {
        device.clone_into(&mut self.device);
        self
    }

    /// Same session with `mode` filled in unless one was chosen explicitly.
    pub fn or_scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode.get_or_insert(mode);
        self
    }

    /// Check the session against what the connected hardware can do.
    pub fn validate_for(&self, device: &dyn DaqDevice) -> Result<(), ConfigError> {
        let supported = device.supported_ranges();
        if !supported.contains(&self.voltage_range) {
            return Err(ConfigError::UnsupportedRange {
                range: self.voltage_range,
                supported,
            });
        }

        let descriptor = device.descriptor();
        let mode = self
            .scan_mode
            .unwrap_or_else(|| descriptor.preferred_scan_mode());
        let available = descriptor.channels_in_mode(mode);
        if available == 0 {
            return Err(ConfigError::UnsupportedScanMode(mode));
        }
        if self.channel_range.high() >= available {
            return Err(ConfigError::ChannelOutOfRange {
                high: self.channel_range.high(),
                available,
                mode,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    low: u32,
    high: u32,
    channel_names: Option<Vec<String>>,
    voltage_range: VoltageRange,
    sampling_rate: f64,
    scan_mode: Option<ScanMode>,
    buffer_seconds: f64,
    device: String,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self {
            low: 0,
            high: 0,
            channel_names: None,
            voltage_range: VoltageRange::Bip10Volts,
            sampling_rate: 1000.0,
            scan_mode: None,
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
            device: String::new(),
        }
    }

    pub fn channel_range(mut self, low: u32, high: u32) -> Self {
        self.low = low;
        self.high = high;
        self
    }

    pub fn channel_names(mut self, names: Vec<String>) -> Self {
        self.channel_names = Some(names);
        self
    }

    pub fn voltage_range(mut self, range: VoltageRange) -> Self {
        self.voltage_range = range;
        self
    }

    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = Some(mode);
        self
    }

    fn optional_scan_mode(mut self, mode: Option<ScanMode>) -> Self {
        self.scan_mode = mode;
        self
    }

    pub fn buffer_seconds(mut self, seconds: f64) -> Self {
        self.buffer_seconds = seconds;
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let channel_range = ChannelRange::new(self.low, self.high)?;
        if !(self.sampling_rate.is_finite() && self.sampling_rate > 0.0) {
            return Err(ConfigError::InvalidSamplingRate(self.sampling_rate));
        }
        if !(self.buffer_seconds.is_finite() && self.buffer_seconds > 0.0) {
            return Err(ConfigError::InvalidBufferSeconds(self.buffer_seconds));
        }

        // Names that do not line up with the range fall back to the default labels
        let channel_names = match self.channel_names {
            Some(names) if names.len() == channel_range.num_channels() => names,
            _ => channel_range
                .channels()
                .map(|id| format!("Channel_{id}"))
                .collect(),
        };

        Ok(SessionConfig {
            channel_range,
            channel_names,
            voltage_range: self.voltage_range,
            sampling_rate: self.sampling_rate,
            scan_mode: self.scan_mode,
            buffer_seconds: self.buffer_seconds,
            device: self.device,
        })
    }
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Geometry of the driver ring buffer and the drain chunk for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub num_channels: usize,
    pub points_per_channel: usize,
    pub capacity: usize,
    pub chunk_size: usize,
}

impl BufferLayout {
    /// Size the ring to hold `buffer_seconds` of data. Some boards require the
    /// total count to be a whole number of USB packets, so points per channel
    /// are rounded up to a multiple of `packet_size`.
    pub fn new(config: &SessionConfig, packet_size: usize) -> Self {
        let wanted = (config.sampling_rate() * config.buffer_seconds()).ceil() as usize;
        let mut points_per_channel = wanted.max(MIN_POINTS_PER_CHANNEL);

        if packet_size > 1 {
            let remainder = points_per_channel % packet_size;
            if remainder != 0 {
                points_per_channel += packet_size - remainder;
            }
        }

        let num_channels = config.num_channels();
        let capacity = points_per_channel * num_channels;
        Self {
            num_channels,
            points_per_channel,
            capacity,
            chunk_size: (capacity / CHUNK_DIVISOR).max(1),
        }
    }
}
