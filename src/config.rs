//! Session configuration.
//!
//! Every timing constant of the protocol engine lives here so that field
//! quirks (init pulse widths, sync-byte acceptance, echo windows) can be
//! adjusted without touching protocol code.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial baud rate for the K-Line adapter.
    pub baud_rate: u32,

    /// Tester (transmitter) address byte.
    pub tx_id: u8,

    /// ECU (receiver) address byte.
    pub rx_id: u8,

    /// Steady-state read timeout before session start, in milliseconds.
    pub read_timeout_ms: u64,

    /// Read timeout once the diagnostic session is running.
    pub session_read_timeout_ms: u64,

    /// Window for collecting the half-duplex echo after a write.
    pub echo_timeout_ms: u64,

    /// Settle delay before every frame write.
    pub write_guard_ms: u64,

    /// Nominal width of the fast-init break low/high pulse.
    pub fast_init_pulse_ms: u64,

    /// Timing offsets tried in order until the ECU answers; subtracted from
    /// the nominal pulse width. Observed working values, no deeper rationale.
    pub fast_init_offsets_ms: Vec<i64>,

    /// Leading response bytes accepted as evidence of a successful wake-up.
    pub fast_init_sync_bytes: Vec<u8>,

    /// Bytes to collect when probing for a fast-init response.
    pub fast_init_response_len: usize,

    /// Deadline for the fast-init response probe and the drain read after it.
    pub fast_init_read_timeout_ms: u64,

    /// Width of the DTR/RTS line-reset pulse steps before fast init.
    pub line_reset_step_ms: u64,

    /// Poll loop interval.
    pub poll_interval_ms: u64,

    /// Keep-alive interval and idle threshold.
    pub keep_alive_ms: u64,

    /// Hex-dump every TX/RX run and echo anomaly at debug level.
    pub debug_rx: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud_rate: 120_000,
            tx_id: 0x11,
            rx_id: 0xF1,
            read_timeout_ms: 2_000,
            session_read_timeout_ms: 12_000,
            echo_timeout_ms: 200,
            write_guard_ms: 100,
            fast_init_pulse_ms: 25,
            fast_init_offsets_ms: vec![0, -2, 2],
            fast_init_sync_bytes: vec![0x00, 0x81, 0xC1],
            fast_init_response_len: 40,
            fast_init_read_timeout_ms: 400,
            line_reset_step_ms: 100,
            poll_interval_ms: 100,
            keep_alive_ms: 1_500,
            debug_rx: true,
        }
    }
}

impl Config {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn session_read_timeout(&self) -> Duration {
        Duration::from_millis(self.session_read_timeout_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn fast_init_read_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_init_read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.tx_id, 0x11);
        assert_eq!(cfg.rx_id, 0xF1);
        assert_eq!(cfg.fast_init_offsets_ms, vec![0, -2, 2]);
        assert_eq!(cfg.fast_init_sync_bytes, vec![0x00, 0x81, 0xC1]);
    }

    #[test]
    fn partial_json_overlays_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"poll_interval_ms": 250}"#).unwrap();
        assert_eq!(cfg.poll_interval_ms, 250);
        assert_eq!(cfg.baud_rate, 120_000);
    }
}
