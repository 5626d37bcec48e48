//! Short-window averaging of calibrated channels.
//!
//! A [`ChannelMonitor`] is driven by the polling ticks of the client. On every
//! update it reads the raw count of each monitored channel, converts it with
//! the channel's [`CalibrationEntry`](crate::calibration::CalibrationEntry) and
//! pushes the result into a [`SampleWindow`] of the last
//! [`WINDOW_CAPACITY`] values. Windows start out as zeros, so the first
//! averages ramp up over ten ticks. While polling is inactive every window
//! reads as zeros again so no stale data is reported.

use crate::calibration::CalibrationTable;
use crate::client::{Adam5K, Tick};
use crate::protocol::ChannelAddress;
use crate::snapshot::DeviceSnapshot;
use crate::Result;
use log::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

pub const WINDOW_CAPACITY: usize = 10;

/// Averaged engineering values by channel name.
pub type Averages = BTreeMap<String, f64>;

/// The most recent values of one channel, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    samples: VecDeque<f64>,
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleWindow {
    /// A full window of zeros.
    pub fn new() -> Self {
        let mut window = Self {
            samples: VecDeque::with_capacity(WINDOW_CAPACITY),
        };
        window.reset();
        window
    }

    /// Appends a value, evicting the oldest one when full.
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Arithmetic mean of the window, zero when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    /// Fills the window with zeros.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.samples.resize(WINDOW_CAPACITY, 0.0);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }
}

/// Something raw channel counts can be read from.
pub trait ChannelSource {
    fn read_raw(&self, address: ChannelAddress) -> Result<u16>;
}

impl ChannelSource for DeviceSnapshot {
    fn read_raw(&self, address: ChannelAddress) -> Result<u16> {
        Ok(self.value(address).raw_count())
    }
}

/// Cached value while polling, a read from the rack otherwise.
impl ChannelSource for Adam5K {
    fn read_raw(&self, address: ChannelAddress) -> Result<u16> {
        Ok(self.read_channel(address)?.raw_count())
    }
}

/// Averages a fixed set of named channels.
#[derive(Debug, Clone)]
pub struct ChannelMonitor {
    table: Arc<CalibrationTable>,
    channels: Vec<String>,
    windows: HashMap<String, SampleWindow>,
}

impl ChannelMonitor {
    /// Monitors `channels`, each of which must be in `table`.
    pub fn new<I, S>(table: Arc<CalibrationTable>, channels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = channels
            .into_iter()
            .map(Into::into)
            .map(|name: String| table.get(&name).map(|_| name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            table,
            channels,
            windows: HashMap::new(),
        })
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }

    /// Samples every monitored channel and returns the new averages.
    ///
    /// With `polling == false` the windows are reset instead. A channel whose
    /// read fails keeps its previous window.
    pub fn update<S: ChannelSource + ?Sized>(&mut self, source: &S, polling: bool) -> Averages {
        for name in &self.channels {
            let window = self.windows.entry(name.clone()).or_insert_with(SampleWindow::new);
            if !polling {
                window.reset();
                continue;
            }
            let Ok(entry) = self.table.get(name) else {
                continue;
            };
            match source.read_raw(entry.address()) {
                Ok(raw) => window.push(entry.to_engineering(raw)),
                Err(err) => warn!("Cannot sample '{name}': {err}"),
            }
        }
        self.averages()
    }

    /// Samples from the snapshot carried by a polling tick.
    pub fn on_tick(&mut self, tick: &Tick) -> Averages {
        self.update(&tick.snapshot, true)
    }

    /// Current mean of every monitored channel.
    pub fn averages(&self) -> Averages {
        self.channels
            .iter()
            .map(|name| {
                let mean = self.windows.get(name).map(SampleWindow::mean).unwrap_or(0.0);
                (name.clone(), mean)
            })
            .collect()
    }

    pub fn window(&self, name: &str) -> Option<&SampleWindow> {
        self.windows.get(name)
    }
}
