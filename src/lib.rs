//! # DAQ Supervisor Library
//!
//! Supervises a set of streaming measurement instruments. Each instrument is served by
//! its own worker task, which ingests a best-effort UDP sample stream while staying
//! responsive to control commands. A central [`Supervisor`] registers workers,
//! broadcasts commands to them, and runs timeout-bounded health checks.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: The closed command/response vocabulary exchanged with workers,
//!   with typed payloads and a `{state, data}` JSON form.
//! - **`packet`**: Codec for the fixed 1028-byte streaming packet and the buffered
//!   [`Sample`] type.
//! - **`transport`**: The `Transport` capability a worker reads packets from, with UDP
//!   and mock implementations and the factories that open them.
//! - **`worker`**: The per-device event loop interleaving commands and packets.
//! - **`equipment`**: The Supervisor-side handle of one worker (lifecycle, channel,
//!   ping, graceful/forced stop).
//! - **`supervisor`**: Registry plus the fan-out and ping aggregation operations.
//! - **`config`**: Figment-based configuration (TOML + environment).
//! - **`telemetry`**: `tracing-subscriber` initialisation.
//! - **`error`**: The `EquipmentError` enum and codec/protocol errors.

pub mod config;
pub mod equipment;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use equipment::{Equipment, EquipmentSettings, Lifecycle};
pub use error::{EquipmentError, EquipmentResult};
pub use packet::{Packet, Sample};
pub use protocol::{Command, ConfigureParams, Response, StartParams};
pub use supervisor::Supervisor;
