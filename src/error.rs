//! Error types shared by the encoder, the transport and the device client.

use crate::protocol::SlotGroup;

/// The operation was not valid for the client's current state.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("polling is already running")]
    AlreadyPolling,
    #[error("polling is not running")]
    NotPolling,
    #[error("operation not allowed from the polling thread")]
    CalledFromPollingThread,
    #[error("the polling thread terminated unexpectedly")]
    PollingThreadLost,
}

/// Represents all possible errors of the rack client.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Slot or channel index outside of the group's bounds.
    #[error("Invalid {group} address: slot {slot}, channel {channel}")]
    InvalidAddress {
        group: SlotGroup,
        slot: u8,
        channel: u8,
    },

    /// A value of one slot group was used with an address of the other.
    #[error("Cannot write a {value} value to a {address} channel")]
    ValueMismatch { address: SlotGroup, value: SlotGroup },

    #[error("Slot pattern of {len} elements exceeds the maximum of {max}")]
    PatternTooLong { len: usize, max: usize },

    /// Opening the TCP connection failed (refused, unreachable or timed out).
    #[error("Cannot connect to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Send or receive failure during an established session.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Short write: {sent} of {expected} bytes sent")]
    ShortWrite { sent: usize, expected: usize },

    #[error("Connection closed by the device")]
    ConnectionClosed,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Raw value {value} out of range for '{name}' (0..={max})")]
    RawOutOfRange { name: String, value: u16, max: u16 },

    #[error("Invalid calibration for '{name}': {reason}")]
    InvalidCalibration { name: String, reason: &'static str },

    #[error("Cannot read configuration file {path}: {source}")]
    ConfigFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),
}

/// The result type of the rack client.
pub type Result<T> = std::result::Result<T, Error>;
