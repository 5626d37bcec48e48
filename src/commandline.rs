use adam5k_lib::protocol as proto;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

fn parse_group(s: &str) -> Result<proto::SlotGroup, String> {
    s.parse()
}

fn parse_index(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid index format: {e}"))
}

fn parse_rack(s: &str) -> Result<proto::RackAddress, String> {
    clap_num::maybe_hex::<u8>(s)
        .map(proto::RackAddress::from)
        .map_err(|e| format!("Invalid rack address format: {e}"))
}

fn parse_raw(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex::<u16>(s).map_err(|e| format!("Invalid raw value format: {e}"))
}

/// Parses the value of a single channel for the given group.
pub fn parse_channel_value(group: proto::SlotGroup, s: &str) -> Result<proto::ChannelValue, String> {
    match group {
        proto::SlotGroup::Analog => parse_raw(s).map(proto::ChannelValue::Analog),
        proto::SlotGroup::Digital => match s.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Ok(proto::ChannelValue::Digital(true)),
            "off" | "false" | "0" => Ok(proto::ChannelValue::Digital(false)),
            other => Err(format!("Invalid digital value '{other}', expected on or off")),
        },
    }
}

/// Parses a bit string like `1010_0000`, first character is channel 0.
pub fn parse_bits(s: &str) -> Result<Vec<bool>, String> {
    s.chars()
        .filter(|c| *c != '_')
        .map(|c| match c {
            '1' => Ok(true),
            '0' => Ok(false),
            other => Err(format!("Invalid bit '{other}', expected 0 or 1")),
        })
        .collect()
}

/// Parses hex bytes like `0FFF 0800` or `0x0fff0800`.
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    if digits.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits in '{s}'"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex byte '{}': {e}", &digits[i..i + 2]))
        })
        .collect()
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read a single channel from the rack.
    Read {
        /// Slot group: "analog" or "digital".
        #[arg(value_parser = parse_group)]
        group: proto::SlotGroup,
        /// Slot index (0 to 7).
        #[arg(value_parser = parse_index)]
        slot: u8,
        /// Channel index (0 to 7 for analog, 0 to 15 for digital).
        #[arg(value_parser = parse_index)]
        channel: u8,
    },

    /// Write a single channel.
    /// Analog channels take a raw count (decimal or hex, e.g. "1222" or "0x4C6"),
    /// digital channels take "on" or "off".
    #[clap(verbatim_doc_comment)]
    Write {
        #[arg(value_parser = parse_group)]
        group: proto::SlotGroup,
        #[arg(value_parser = parse_index)]
        slot: u8,
        #[arg(value_parser = parse_index)]
        channel: u8,
        value: String,
    },

    /// Write every channel of a slot with one command.
    /// Digital slots take a bit string, first bit is channel 0 (e.g. "1010_0000_0000_0000").
    /// Analog slots take hex bytes which are sent unmodified (e.g. "0FFF 0800").
    /// **Warning:** All outputs of the slot are overwritten.
    #[clap(verbatim_doc_comment)]
    WriteSlot {
        #[arg(value_parser = parse_group)]
        group: proto::SlotGroup,
        #[arg(value_parser = parse_index)]
        slot: u8,
        pattern: String,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Write a raw count to a named channel of the calibration table.
    /// The value is checked against the channel's maximum raw count.
    #[clap(verbatim_doc_comment)]
    Set {
        name: String,
        #[arg(value_parser = parse_raw)]
        value: u16,
    },

    /// Read all channels of both slot groups and print them.
    Snapshot,

    /// List the channels of the calibration table.
    Channels,

    /// Poll the rack continuously and print averaged engineering values
    /// of the monitored channels after every tick. Stop with Ctrl-C.
    #[clap(verbatim_doc_comment)]
    Monitor {
        /// Polling interval (e.g., "500ms", "2s"). Defaults to the configured interval.
        #[arg(short, long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
}

const fn about_text() -> &'static str {
    "ADAM-5000/TCP rack CLI - Read, write and monitor rack channels over TCP."
}

#[derive(Parser, Debug)]
#[command(name="adamctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Configuration file. Defaults to "adam5k.yml" in the current directory,
    /// then the user configuration directory.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Host name or IP address of the rack, overrides the configuration.
    #[arg(global = true, long)]
    pub host: Option<String>,

    /// TCP port of the rack, overrides the configuration.
    #[arg(global = true, long)]
    pub port: Option<u16>,

    /// Rack address sent in every frame, overrides the configuration.
    /// Can be specified in decimal or hexadecimal (e.g., "1" or "0x01").
    #[arg(global = true, long, value_parser = parse_rack, verbatim_doc_comment)]
    pub rack: Option<proto::RackAddress>,

    /// I/O timeout for every request (e.g., "1s", "500ms").
    #[arg(global = true, long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_values() {
        assert_eq!(
            parse_channel_value(proto::SlotGroup::Analog, "0x4C6"),
            Ok(proto::ChannelValue::Analog(1222))
        );
        assert_eq!(
            parse_channel_value(proto::SlotGroup::Digital, "On"),
            Ok(proto::ChannelValue::Digital(true))
        );
        assert!(parse_channel_value(proto::SlotGroup::Digital, "maybe").is_err());
    }

    #[test]
    fn bit_strings() {
        assert_eq!(parse_bits("10_01"), Ok(vec![true, false, false, true]));
        assert!(parse_bits("102").is_err());
    }

    #[test]
    fn hex_bytes() {
        assert_eq!(parse_hex_bytes("0FFF 0800"), Ok(vec![0x0F, 0xFF, 0x08, 0x00]));
        assert_eq!(parse_hex_bytes("0xab"), Ok(vec![0xAB]));
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn cli_parses() {
        let args = CliArgs::try_parse_from([
            "adamctl", "--host", "127.0.0.1", "--rack", "0x02", "write", "digital", "0", "3", "on",
        ])
        .unwrap();
        assert_eq!(args.rack, Some(proto::RackAddress::new(2)));
        assert_eq!(
            args.command,
            CliCommands::Write {
                group: proto::SlotGroup::Digital,
                slot: 0,
                channel: 3,
                value: "on".to_string(),
            }
        );
    }
}
