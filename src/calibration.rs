//! Named channels and their linear scaling to engineering units.
//!
//! Each [`CalibrationEntry`] maps a signal name to a channel of the rack and
//! converts raw counts with
//!
//! ```text
//! value = range * (raw - offset) / max_raw
//! ```
//!
//! rounded to two decimals. The [`CalibrationTable`] is built once and never
//! modified afterwards; share it with an `Arc`.

use crate::protocol::{ChannelAddress, ChannelValue, SlotGroup};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full scale of the 12 bit analog converters.
pub const ANALOG_MAX_RAW: u16 = 0x0FFF;
/// Full scale used for digital outputs, the coil-on sentinel.
pub const DIGITAL_MAX_RAW: u16 = 0xFF00;

/// Serialized form of an entry as found in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEntry {
    name: String,
    group: SlotGroup,
    slot: u8,
    channel: u8,
    #[serde(default)]
    range: f64,
    #[serde(default)]
    offset: u16,
    #[serde(default = "default_max_raw")]
    max_raw: u16,
}

fn default_max_raw() -> u16 {
    ANALOG_MAX_RAW
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEntry", into = "RawEntry")]
pub struct CalibrationEntry {
    name: String,
    address: ChannelAddress,
    range: f64,
    offset: u16,
    max_raw: u16,
}

impl CalibrationEntry {
    pub fn new(
        name: impl Into<String>,
        address: ChannelAddress,
        range: f64,
        offset: u16,
        max_raw: u16,
    ) -> Result<Self> {
        let name = name.into();
        if max_raw == 0 {
            return Err(Error::InvalidCalibration {
                name,
                reason: "max_raw must not be zero",
            });
        }
        if !range.is_finite() {
            return Err(Error::InvalidCalibration {
                name,
                reason: "range must be a finite number",
            });
        }
        Ok(Self {
            name,
            address,
            range,
            offset,
            max_raw,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> ChannelAddress {
        self.address
    }

    pub fn range(&self) -> f64 {
        self.range
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn max_raw(&self) -> u16 {
        self.max_raw
    }

    /// Converts a raw count to engineering units.
    pub fn to_engineering(&self, raw: u16) -> f64 {
        let value = self.range * (f64::from(raw) - f64::from(self.offset)) / f64::from(self.max_raw);
        (value * 100.0).round() / 100.0
    }

    /// Checks that `raw` is a valid count to write to this channel.
    pub fn check_raw(&self, raw: u16) -> Result<()> {
        if raw <= self.max_raw {
            Ok(())
        } else {
            Err(Error::RawOutOfRange {
                name: self.name.clone(),
                value: raw,
                max: self.max_raw,
            })
        }
    }

    /// The channel value to write for a raw count, after range checking.
    pub fn write_value(&self, raw: u16) -> Result<ChannelValue> {
        self.check_raw(raw)?;
        Ok(match self.address.group() {
            SlotGroup::Analog => ChannelValue::Analog(raw),
            SlotGroup::Digital => ChannelValue::Digital(raw != 0),
        })
    }
}

impl TryFrom<RawEntry> for CalibrationEntry {
    type Error = Error;

    fn try_from(raw: RawEntry) -> Result<Self> {
        let address = ChannelAddress::new(raw.group, raw.slot, raw.channel)?;
        Self::new(raw.name, address, raw.range, raw.offset, raw.max_raw)
    }
}

impl From<CalibrationEntry> for RawEntry {
    fn from(entry: CalibrationEntry) -> Self {
        Self {
            group: entry.address.group(),
            slot: entry.address.slot(),
            channel: entry.address.channel(),
            name: entry.name,
            range: entry.range,
            offset: entry.offset,
            max_raw: entry.max_raw,
        }
    }
}

/// Immutable lookup of calibration entries by name.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    entries: BTreeMap<String, CalibrationEntry>,
}

impl CalibrationTable {
    /// Builds a table, rejecting duplicate names.
    pub fn from_entries(entries: impl IntoIterator<Item = CalibrationEntry>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entry in entries {
            if map.contains_key(entry.name()) {
                return Err(Error::InvalidCalibration {
                    name: entry.name,
                    reason: "duplicate channel name",
                });
            }
            map.insert(entry.name.clone(), entry);
        }
        Ok(Self { entries: map })
    }

    pub fn get(&self, name: &str) -> Result<&CalibrationEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::UnknownChannel(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CalibrationEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in name order, as stored in configuration files.
    pub fn to_entries(&self) -> Vec<CalibrationEntry> {
        self.entries.values().cloned().collect()
    }
}

/// Sensors averaged by the monitor on the test rig.
pub const RIG_SENSORS: [&str; 7] = ["rpm", "torque", "psi_in", "psi_out", "flw0", "flw1", "flw2"];

impl Default for CalibrationTable {
    /// Wiring of the pump test rig. Names ending in `_` are outputs.
    fn default() -> Self {
        use SlotGroup::{Analog, Digital};
        #[rustfmt::skip]
        let rig: [(&str, SlotGroup, u8, u8, f64, u16); 15] = [
            ("flw0",      Analog,  2, 0, 1000.0, ANALOG_MAX_RAW),
            ("flw1",      Analog,  2, 0, 1000.0, ANALOG_MAX_RAW),
            ("flw2",      Analog,  2, 0,   80.0, ANALOG_MAX_RAW),
            ("rpm",       Analog,  2, 1, 3000.0, ANALOG_MAX_RAW),
            ("torque",    Analog,  2, 2,    0.2, ANALOG_MAX_RAW),
            ("psi_in",    Analog,  2, 3,    0.0, ANALOG_MAX_RAW),
            ("psi_out",   Analog,  2, 3,    3.5, ANALOG_MAX_RAW),
            ("engine_",   Digital, 0, 0,    0.0, DIGITAL_MAX_RAW),
            ("flw0_",     Digital, 0, 1,    0.0, DIGITAL_MAX_RAW),
            ("flw1_",     Digital, 0, 2,    0.0, DIGITAL_MAX_RAW),
            ("flw2_",     Digital, 0, 3,    0.0, DIGITAL_MAX_RAW),
            ("valve_",    Analog,  2, 0,    0.0, ANALOG_MAX_RAW),
            ("speed_",    Analog,  2, 1,    0.0, ANALOG_MAX_RAW),
            ("torque_",   Analog,  2, 2,    0.0, ANALOG_MAX_RAW),
            ("pressure_", Analog,  2, 3,    0.0, ANALOG_MAX_RAW),
        ];
        let entries = rig.into_iter().map(|(name, group, slot, channel, range, max_raw)| {
            CalibrationEntry {
                name: name.to_string(),
                address: ChannelAddress::new_unchecked(group, slot, channel),
                range,
                offset: 0,
                max_raw,
            }
        });
        Self {
            entries: entries.map(|entry| (entry.name.clone(), entry)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry(range: f64, offset: u16, max_raw: u16) -> CalibrationEntry {
        let address = ChannelAddress::new(SlotGroup::Analog, 2, 0).unwrap();
        CalibrationEntry::new("flw0", address, range, offset, max_raw).unwrap()
    }

    #[test]
    fn linear_scaling() {
        let flow = entry(1000.0, 0, 4095);
        assert_eq!(flow.to_engineering(4095), 1000.0);
        assert_eq!(flow.to_engineering(0), 0.0);
        assert_eq!(flow.to_engineering(2048), 500.12);
    }

    #[test]
    fn offset_shifts_zero() {
        let pressure = entry(10.0, 819, 3276);
        assert_eq!(pressure.to_engineering(819), 0.0);
        assert_eq!(pressure.to_engineering(4095), 10.0);
        assert!(pressure.to_engineering(0) < 0.0);
    }

    #[test]
    fn invalid_entries_are_rejected() {
        let address = ChannelAddress::new(SlotGroup::Analog, 0, 0).unwrap();
        assert_matches!(
            CalibrationEntry::new("x", address, 1.0, 0, 0),
            Err(Error::InvalidCalibration { .. })
        );
        assert_matches!(
            CalibrationEntry::new("x", address, f64::NAN, 0, 1),
            Err(Error::InvalidCalibration { .. })
        );
    }

    #[test]
    fn write_values_are_range_checked() {
        let valve = entry(0.0, 0, ANALOG_MAX_RAW);
        assert_eq!(valve.write_value(4095).unwrap(), ChannelValue::Analog(4095));
        assert_matches!(
            valve.write_value(4096),
            Err(Error::RawOutOfRange { value: 4096, max: 4095, .. })
        );

        let table = CalibrationTable::default();
        let engine = table.get("engine_").unwrap();
        assert_eq!(engine.write_value(1).unwrap(), ChannelValue::Digital(true));
        assert_eq!(engine.write_value(0).unwrap(), ChannelValue::Digital(false));
    }

    #[test]
    fn rig_table() {
        let table = CalibrationTable::default();
        assert_eq!(table.len(), 15);
        for name in RIG_SENSORS {
            assert!(table.contains(name), "{name} missing");
        }
        for entry in table.iter() {
            let address = entry.address();
            assert!(ChannelAddress::new(address.group(), address.slot(), address.channel()).is_ok());
        }
        let rpm = table.get("rpm").unwrap();
        assert_eq!(rpm.address(), ChannelAddress::new(SlotGroup::Analog, 2, 1).unwrap());
        assert_eq!(rpm.to_engineering(4095), 3000.0);
        assert_matches!(table.get("nope"), Err(Error::UnknownChannel(..)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let flow = entry(1.0, 0, 1);
        assert_matches!(
            CalibrationTable::from_entries([flow.clone(), flow]),
            Err(Error::InvalidCalibration { reason: "duplicate channel name", .. })
        );
    }

    #[test]
    fn entries_from_yaml() {
        let yaml = "
- { name: rpm, group: analog, slot: 2, channel: 1, range: 3000 }
- { name: engine_, group: digital, slot: 0, channel: 0, max_raw: 65280 }
";
        let entries: Vec<CalibrationEntry> = serde_yaml::from_str(yaml).unwrap();
        let table = CalibrationTable::from_entries(entries).unwrap();
        assert_eq!(table.get("rpm").unwrap().max_raw(), ANALOG_MAX_RAW);
        assert_eq!(table.get("engine_").unwrap().max_raw(), DIGITAL_MAX_RAW);

        let bad = "- { name: x, group: analog, slot: 0, channel: 9 }";
        assert!(serde_yaml::from_str::<Vec<CalibrationEntry>>(bad).is_err());
    }
}
