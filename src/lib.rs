#![cfg_attr(docsrs, feature(doc_cfg))]
//! # zetarabms_lib
//!
//! This crate speaks the wire protocol of Zetara battery management systems:
//! Modbus-style telemetry frames (reassembled across continuation frames for
//! packs with more than 16 cells) and the `0x10` control frames that read
//! and change the module ID and the CAN/RS485 protocol selection.
//!
//! The link to the pack allows one outstanding request at a time. A
//! [`BmsManager`] owns such a link, serializes requests through a
//! [`queue::RequestQueue`] and keeps the last reading and the pack settings.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//! The protocol core and the manager are always available; enable the
//! transport you want to use.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `zetarabms` command-line tool.
//!
//! ### Transport Features
//! - `tokio-serial-async`: Enables the serial transport using `tokio` and `tokio-serial`.
//! - `ble`: Enables the Bluetooth Low Energy transport using `bluest`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `zetarabms` binary executable.

/// Contains error types for the library.
mod error;
/// Hex and Modbus CRC-16 helpers.
pub mod frame;
/// Function codes, frame classification and payload access.
pub mod protocol;
/// Telemetry decoding.
pub mod reading;
/// Multi-frame telemetry reassembly.
pub mod reassembly;
/// Module ID and protocol selection frames.
pub mod control;
pub mod config;
pub mod transport;
pub mod queue;
pub mod manager;

pub use config::ManagerConfig;
pub use control::{ModuleIdControlData, ProtocolBus, ProtocolSelection};
pub use error::{Error, Result};
pub use manager::{BmsManager, ConnectionState, ControlCache};
pub use reading::{BmsReading, BmsStatus};
pub use transport::{Link, LinkEvent, Transport};

/// Serial transport for RS485 adapters.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;

/// Bluetooth Low Energy transport.
#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;
