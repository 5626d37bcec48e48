//! Last known values of every channel of the rack.

use crate::protocol::{self as proto, ChannelAddress, ChannelValue, RegisterWord, SlotGroup};

pub const ANALOG_CHANNELS: usize = SlotGroup::Analog.channel_count() as usize;
pub const DIGITAL_SLOTS: usize = proto::SLOTS_PER_GROUP as usize;

/// Raw values of both slot groups as of the latest full read.
///
/// Analog counts are stored slot-major, channel-minor. Each digital slot is
/// stored as one word where bit `i` is channel `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSnapshot {
    analog: [u16; ANALOG_CHANNELS],
    digital: [u16; DIGITAL_SLOTS],
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        Self {
            analog: [0; ANALOG_CHANNELS],
            digital: [0; DIGITAL_SLOTS],
        }
    }
}

impl DeviceSnapshot {
    pub fn analog(&self) -> &[u16; ANALOG_CHANNELS] {
        &self.analog
    }

    pub fn digital(&self) -> &[u16; DIGITAL_SLOTS] {
        &self.digital
    }

    /// Replaces all values of `group` with the words of a read response.
    ///
    /// Entries missing from a short response read as zero.
    pub fn apply(&mut self, group: SlotGroup, words: &[RegisterWord]) {
        match group {
            SlotGroup::Analog => {
                let mut fresh = [0; ANALOG_CHANNELS];
                fresh
                    .iter_mut()
                    .zip(words)
                    .for_each(|(slot, word)| *slot = word.value());
                self.analog = fresh;
            }
            SlotGroup::Digital => {
                let mut fresh = [0; DIGITAL_SLOTS];
                fresh
                    .iter_mut()
                    .zip(words)
                    .for_each(|(slot, word)| *slot = word.value());
                self.digital = fresh;
            }
        }
    }

    pub fn value(&self, address: ChannelAddress) -> ChannelValue {
        match address.group() {
            SlotGroup::Analog => ChannelValue::Analog(self.analog[usize::from(address.register())]),
            SlotGroup::Digital => ChannelValue::Digital(proto::coil(
                self.digital[usize::from(address.slot())],
                address.channel(),
            )),
        }
    }
}
