//! A library for ADAM-5000/TCP I/O racks.
//!
//! The rack is reached over a persistent TCP connection speaking a
//! Modbus-TCP derived binary protocol. This crate provides:
//!
//! 1.  **Frame encoding**: pure functions building byte-exact request frames
//!     and decoding responses. See [`protocol`].
//! 2.  **A stateful, thread-safe client**: connection handling, a background
//!     polling thread with a FIFO write queue and a cached snapshot of every
//!     channel. See [`client::Adam5K`].
//! 3.  **Calibration and averaging**: named channels scaled to engineering
//!     units and averaged over the last ten polling ticks. See [`calibration`]
//!     and [`monitor`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use adam5k_lib::{
//!     calibration::CalibrationTable,
//!     client::Adam5K,
//!     monitor::ChannelMonitor,
//!     protocol::RackAddress,
//! };
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let table = Arc::new(CalibrationTable::default());
//!     let monitor = Arc::new(Mutex::new(ChannelMonitor::new(table, ["rpm", "torque"])?));
//!
//!     let client = Adam5K::new();
//!     client.connect("10.10.10.11", 502, RackAddress::default())?;
//!     let sink = Arc::clone(&monitor);
//!     client.set_tick_callback(move |tick| {
//!         let averages = sink.lock().unwrap().on_tick(tick);
//!         println!("{averages:?}");
//!     });
//!     client.start_polling(Duration::from_secs(1))?;
//!
//!     std::thread::sleep(Duration::from_secs(10));
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod client;
pub mod config;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod snapshot;
pub mod transport;

pub use error::{Error, Result, StateError};
