//! Error taxonomy for the K-Line session.

use thiserror::Error;

/// Errors surfaced by the transport capability.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying port is closed or has disappeared.
    #[error("serial port closed")]
    Closed,

    /// The platform cannot drive the requested control signals.
    #[error("control signals not supported")]
    Unsupported,

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No sufficient bytes arrived before the deadline.
    #[error("timed out waiting for ECU data")]
    Timeout,

    /// The transport closed underneath the session. Fatal.
    #[error("transport closed")]
    TransportClosed,

    #[error("transport error: {0}")]
    Transport(TransportError),

    /// The ECU rejected a request. Terminal for that command only;
    /// code 0x78 ("response pending") never surfaces here.
    #[error("negative response to service 0x{service:02X}: code 0x{code:02X}")]
    NegativeResponse { service: u8, code: u8 },

    /// No profile in the identification catalog matched. Fatal.
    #[error("ECU identification failed: no known signature matched")]
    IdentificationFailed,

    /// Seed-key exchange failed. Logged, session continues unauthenticated.
    #[error("security access failed: {0}")]
    SecurityAccessFailed(Box<ProtocolError>),
}

impl From<TransportError> for ProtocolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => ProtocolError::TransportClosed,
            other => ProtocolError::Transport(other),
        }
    }
}
