//! # Modbus Station - Modbus TCP/RTU Slave Engine
//!
//! A Modbus slave (server) in pure Rust: requests arrive over Modbus/TCP or
//! Modbus/RTU, are decoded and dispatched against an in-memory process
//! image and two file-oriented stores, and answered with bit-exact response
//! frames. Built for simulators, test benches and device front-ends that
//! need to *be* the device rather than talk to one.
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//! | 0x14 | Read File Record |
//! | 0x15 | Write File Record |
//! | 0xCB | Read File Area (vendor) |
//! | 0xCC | Write File Area (vendor) |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_station::{ModbusServer, ModbusStation};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut station = ModbusStation::new();
//!     station.initialize_data();
//!     station.start_tcp(502).await?;
//!
//!     // ... serve until told otherwise ...
//!     station.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! TCP framer ─┐                  ┌─ Function handler ── Process image
//!             ├── PDU router ────┤
//! RTU framer ─┘                  ├─ File-record store
//!                                └─ Flat file-address store
//! ```
//!
//! Each transport reassembles frames into PDUs, the router fans a PDU to
//! one handler, and the handler answers with a response PDU (or an
//! exception PDU) which the transport wraps back into its framing. Change
//! notifications flow one way, from the stores out to registered sinks.

pub mod config;
pub mod data_store;
pub mod error;
pub mod file_store;
pub mod function_handler;
pub mod logging;
pub mod protocol;
pub mod router;
pub mod server;
pub mod transport;
pub mod value;

pub use config::{ConfigFormat, SeedPoint};
pub use data_store::{ChangeEvent, ChangeSink, DataRegion, DataStoreStats, ModbusDataStore};
pub use error::{ModbusError, ModbusResult};
pub use file_store::{FileAddressStore, ModbusFileStore};
pub use function_handler::ModbusFunctionHandler;
pub use logging::{CallbackLogger, LogCallback, LogLevel};
pub use protocol::{ModbusException, ModbusFunction};
pub use router::{PduRouter, ServerMetrics};
pub use server::{ModbusServer, ModbusStation, StationStats, TransportMode};
pub use value::{ModbusValue, ModbusValueType};

/// Maximum bits readable in one FC 0x01/0x02 request.
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum bits writable in one FC 0x0F request.
pub const MAX_WRITE_BITS: u16 = 1968;

/// Maximum registers readable in one FC 0x03/0x04 request.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum registers writable in one FC 0x10 request.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Record capacity of auto-created files.
pub const MAX_FILE_RECORDS: u16 = 10000;

/// Highest addressable record number in a file.
pub const MAX_RECORD_NUMBER: u16 = 9999;

/// Maximum records per file-record sub-request (one-byte byte count).
pub const MAX_RECORD_LENGTH: u16 = 126;

/// Maximum Modbus/TCP frame size (MBAP header + PDU).
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus/RTU frame size.
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Modbus/TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
