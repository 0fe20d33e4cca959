//! KWP2000 (ISO 14230) K-Line datalogger core.
//!
//! Implements the full live-polling code path against a SIMK4x engine ECU:
//! fast-init handshake, PDU framing with half-duplex echo reconciliation,
//! a serialized command executor, seed-key security access, signature-based
//! ECU identification and a periodic poll / keep-alive scheduler that decodes
//! sensor telemetry into structured records.

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod identify;
pub mod init;
pub mod link;
pub mod pdu;
pub mod security;
pub mod session;
pub mod sink;
pub mod transport;

pub use config::Config;
pub use error::{ProtocolError, TransportError};
pub use session::Session;
pub use sink::TelemetrySink;
pub use transport::{SerialTransport, Transport};
