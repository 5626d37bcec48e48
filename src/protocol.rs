//! Frame encoding and response decoding for the ADAM-5000/TCP rack protocol.
//!
//! The rack speaks a Modbus-TCP derived protocol. Every request starts with a
//! six byte header (`transaction id = 0`, `protocol id = 0`, remaining length)
//! followed by the rack address and a function code. Only the subset of
//! functions used by the rack client is implemented here:
//!
//! | Function | Code   | Used for                          |
//! |----------|--------|-----------------------------------|
//! | `0x01`   | read   | digital channels (coils)          |
//! | `0x04`   | read   | analog channels (input registers) |
//! | `0x05`   | write  | single digital channel            |
//! | `0x06`   | write  | single analog channel             |
//! | `0x0F`   | write  | whole slot, digital and analog    |
//!
//! All functions in this module are pure; nothing here touches the network.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const READ_COILS: u8 = 0x01;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Bulk slot write. Modbus defines `0x0F` for coils only, the rack also
/// accepts it for analog slots with the layout produced by [`encode_slot_bulk`].
pub const WRITE_MULTIPLE: u8 = 0x0F;

pub const SLOTS_PER_GROUP: u8 = 8;

/// Length of the header preceding the rack address: txid, protocol id, length.
pub const HEADER_LEN: usize = 6;
pub const SINGLE_FRAME_LEN: usize = 12;
/// Bytes stripped from a response: header echo, rack, function, byte count.
pub const RESPONSE_HEADER_LEN: usize = 9;
/// A response is received with a single read of at most this many bytes.
pub const MAX_RESPONSE_LEN: usize = 137;

pub const MAX_BULK_COILS: usize = 128;
pub const MAX_BULK_BYTES: usize = 128;
/// Element count the rack expects in an analog bulk frame.
pub const ANALOG_BULK_ELEMENT_COUNT: u16 = 8;

pub const READ_SINGLE_QUANTITY: u16 = 0x0001;
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Kind of module plugged into a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotGroup {
    Analog,
    Digital,
}

impl SlotGroup {
    pub const ALL: [SlotGroup; 2] = [SlotGroup::Analog, SlotGroup::Digital];

    pub const fn channels_per_slot(self) -> u8 {
        match self {
            SlotGroup::Analog => 8,
            SlotGroup::Digital => 16,
        }
    }

    /// Number of channels of the whole group over all slots.
    pub const fn channel_count(self) -> u16 {
        SLOTS_PER_GROUP as u16 * self.channels_per_slot() as u16
    }

    pub const fn read_function(self) -> u8 {
        match self {
            SlotGroup::Analog => READ_INPUT_REGISTERS,
            SlotGroup::Digital => READ_COILS,
        }
    }

    pub const fn write_function(self) -> u8 {
        match self {
            SlotGroup::Analog => WRITE_SINGLE_REGISTER,
            SlotGroup::Digital => WRITE_SINGLE_COIL,
        }
    }
}

impl fmt::Display for SlotGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotGroup::Analog => write!(f, "analog"),
            SlotGroup::Digital => write!(f, "digital"),
        }
    }
}

impl std::str::FromStr for SlotGroup {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "analog" | "a" => Ok(SlotGroup::Analog),
            "digital" | "d" => Ok(SlotGroup::Digital),
            other => Err(format!("Unknown slot group '{other}', expected analog or digital")),
        }
    }
}

/// The unit identifier of the rack, sent in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RackAddress(u8);

impl RackAddress {
    pub const FACTORY_DEFAULT: RackAddress = RackAddress(0x01);

    pub const fn new(address: u8) -> Self {
        Self(address)
    }
}

impl Default for RackAddress {
    fn default() -> Self {
        Self::FACTORY_DEFAULT
    }
}

impl std::ops::Deref for RackAddress {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u8> for RackAddress {
    fn from(address: u8) -> Self {
        Self(address)
    }
}

impl fmt::Display for RackAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Validates a slot index for the given group.
pub fn check_slot(group: SlotGroup, slot: u8) -> Result<()> {
    if slot < SLOTS_PER_GROUP {
        Ok(())
    } else {
        Err(Error::InvalidAddress {
            group,
            slot,
            channel: 0,
        })
    }
}

/// A single channel of the rack. Only valid addresses can be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelAddress {
    group: SlotGroup,
    slot: u8,
    channel: u8,
}

impl ChannelAddress {
    pub fn new(group: SlotGroup, slot: u8, channel: u8) -> Result<Self> {
        if slot < SLOTS_PER_GROUP && channel < group.channels_per_slot() {
            Ok(Self {
                group,
                slot,
                channel,
            })
        } else {
            Err(Error::InvalidAddress {
                group,
                slot,
                channel,
            })
        }
    }

    /// For addresses known to be valid at compile time.
    pub(crate) const fn new_unchecked(group: SlotGroup, slot: u8, channel: u8) -> Self {
        debug_assert!(slot < SLOTS_PER_GROUP && channel < group.channels_per_slot());
        Self {
            group,
            slot,
            channel,
        }
    }

    pub const fn group(&self) -> SlotGroup {
        self.group
    }

    pub const fn slot(&self) -> u8 {
        self.slot
    }

    pub const fn channel(&self) -> u8 {
        self.channel
    }

    /// Register (analog) or coil (digital) number of this channel.
    pub const fn register(&self) -> u16 {
        self.slot as u16 * self.group.channels_per_slot() as u16 + self.channel as u16
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.group, self.slot, self.channel)
    }
}

/// Value of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelValue {
    /// Raw converter count of an analog channel.
    Analog(u16),
    /// State of a digital channel.
    Digital(bool),
}

impl ChannelValue {
    pub const fn group(&self) -> SlotGroup {
        match self {
            ChannelValue::Analog(_) => SlotGroup::Analog,
            ChannelValue::Digital(_) => SlotGroup::Digital,
        }
    }

    /// The value as an integer count, digital channels count as 0 or 1.
    pub const fn raw_count(&self) -> u16 {
        match *self {
            ChannelValue::Analog(raw) => raw,
            ChannelValue::Digital(state) => state as u16,
        }
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Analog(raw) => write!(f, "{raw}"),
            ChannelValue::Digital(true) => write!(f, "on"),
            ChannelValue::Digital(false) => write!(f, "off"),
        }
    }
}

/// Single channel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write(ChannelValue),
}

/// Payload of a whole-slot write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPattern {
    /// Channel states of a digital slot, first element is channel 0.
    Coils(Vec<bool>),
    /// Bytes sent unmodified to an analog slot.
    Raw(Vec<u8>),
}

impl SlotPattern {
    pub const fn group(&self) -> SlotGroup {
        match self {
            SlotPattern::Coils(_) => SlotGroup::Digital,
            SlotPattern::Raw(_) => SlotGroup::Analog,
        }
    }
}

/// One 16 bit word of a read response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWord {
    /// Raw count of one analog channel.
    AnalogRaw(u16),
    /// Channel bits of one digital slot, bit 0 is channel 0.
    DigitalWord(u16),
}

impl RegisterWord {
    pub const fn value(&self) -> u16 {
        match *self {
            RegisterWord::AnalogRaw(value) | RegisterWord::DigitalWord(value) => value,
        }
    }
}

fn single_frame(rack: RackAddress, function: u8, address: u16, payload: u16) -> [u8; SINGLE_FRAME_LEN] {
    let [address_hi, address_lo] = address.to_be_bytes();
    let [payload_hi, payload_lo] = payload.to_be_bytes();
    [
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x06,
        *rack,
        function,
        address_hi,
        address_lo,
        payload_hi,
        payload_lo,
    ]
}

/// Builds the 12 byte frame reading or writing a single channel.
///
/// Reads request a quantity of one. Analog writes carry the raw count big
/// endian, digital writes carry `0xFF00` (on) or `0x0000` (off).
pub fn encode_single_channel(
    rack: RackAddress,
    op: Operation,
    address: ChannelAddress,
) -> Result<Vec<u8>> {
    let group = address.group();
    let (function, payload) = match op {
        Operation::Read => (group.read_function(), READ_SINGLE_QUANTITY),
        Operation::Write(value) if value.group() != group => {
            return Err(Error::ValueMismatch {
                address: group,
                value: value.group(),
            });
        }
        Operation::Write(ChannelValue::Analog(raw)) => (group.write_function(), raw),
        Operation::Write(ChannelValue::Digital(state)) => {
            (group.write_function(), if state { COIL_ON } else { COIL_OFF })
        }
    };
    Ok(single_frame(rack, function, address.register(), payload).to_vec())
}

/// Packs channel states into 16 bit words emitted low byte first.
///
/// Bit 0 of the first word is the first element.
pub fn pack_coils(coils: &[bool]) -> Vec<u8> {
    coils
        .chunks(16)
        .flat_map(|chunk| {
            let word = chunk
                .iter()
                .enumerate()
                .fold(0u16, |word, (bit, &state)| if state { word | (1 << bit) } else { word });
            word.to_le_bytes()
        })
        .collect()
}

/// Builds a `0x0F` frame writing a whole slot starting at its first channel.
///
/// Digital layout: `address(2) element_count(2) byte_count(1) words...` with
/// `element_count = 2 * coils`.
///
/// Analog layout: `address(2) 0x0008 bytes...`. There is no byte count field
/// and the pattern bytes are not reinterpreted. This is the layout the rack
/// has been observed to accept; it is not standard Modbus.
pub fn encode_slot_bulk(rack: RackAddress, slot: u8, pattern: &SlotPattern) -> Result<Vec<u8>> {
    let group = pattern.group();
    check_slot(group, slot)?;
    let start = u16::from(slot) * u16::from(group.channels_per_slot());

    let mut body = vec![*rack, WRITE_MULTIPLE];
    body.extend_from_slice(&start.to_be_bytes());
    match pattern {
        SlotPattern::Coils(coils) => {
            if coils.len() > MAX_BULK_COILS {
                return Err(Error::PatternTooLong {
                    len: coils.len(),
                    max: MAX_BULK_COILS,
                });
            }
            let words = pack_coils(coils);
            body.extend_from_slice(&((coils.len() * 2) as u16).to_be_bytes());
            body.push(words.len() as u8);
            body.extend_from_slice(&words);
        }
        SlotPattern::Raw(bytes) => {
            if bytes.len() > MAX_BULK_BYTES {
                return Err(Error::PatternTooLong {
                    len: bytes.len(),
                    max: MAX_BULK_BYTES,
                });
            }
            body.extend_from_slice(&ANALOG_BULK_ELEMENT_COUNT.to_be_bytes());
            body.extend_from_slice(bytes);
        }
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Frame reading every channel of a group, starting at channel 0.
pub fn default_read_all_command(rack: RackAddress, group: SlotGroup) -> [u8; SINGLE_FRAME_LEN] {
    single_frame(rack, group.read_function(), 0x0000, group.channel_count())
}

/// Extracts the data bytes of a read response.
///
/// The byte count announced at offset 8 is clamped to what was actually
/// received, so a truncated response yields a shorter payload instead of an
/// error. Responses without a complete header have no payload.
pub fn response_payload(response: &[u8]) -> &[u8] {
    if response.len() < RESPONSE_HEADER_LEN {
        return &[];
    }
    let count = usize::from(response[RESPONSE_HEADER_LEN - 1]);
    let end = (RESPONSE_HEADER_LEN + count).min(response.len());
    &response[RESPONSE_HEADER_LEN..end]
}

/// Groups payload bytes into words, padding a trailing odd byte with zero.
///
/// Analog words arrive big endian. Digital words are kept in transmission
/// order, which makes bit `i` of the word channel `i` of the slot.
pub fn parse_payload(group: SlotGroup, payload: &[u8]) -> Vec<RegisterWord> {
    payload
        .chunks(2)
        .map(|pair| {
            let bytes = [pair[0], pair.get(1).copied().unwrap_or(0)];
            match group {
                SlotGroup::Analog => RegisterWord::AnalogRaw(u16::from_be_bytes(bytes)),
                SlotGroup::Digital => RegisterWord::DigitalWord(u16::from_le_bytes(bytes)),
            }
        })
        .collect()
}

/// State of channel `channel` within a digital slot word.
pub const fn coil(word: u16, channel: u8) -> bool {
    channel < 16 && word & (1 << channel) != 0
}

/// Unpacks the first `count` channel states of a digital slot word.
pub fn decode_coil_word(word: u16, count: usize) -> Vec<bool> {
    (0..count.min(16)).map(|bit| coil(word, bit as u8)).collect()
}

/// Decodes the payload of a single channel read.
pub fn decode_single_read(address: ChannelAddress, payload: &[u8]) -> ChannelValue {
    let word = parse_payload(address.group(), payload)
        .first()
        .map(RegisterWord::value)
        .unwrap_or(0);
    match address.group() {
        SlotGroup::Analog => ChannelValue::Analog(word),
        SlotGroup::Digital => ChannelValue::Digital(coil(word, 0)),
    }
}
