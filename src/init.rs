//! Fast-init wake-up choreography.
//!
//! The ECU is woken by a timed low/high pulse on the break line followed
//! immediately by a StartCommunication frame. Some adapters cannot drive the
//! break line at all; after the first refusal the pulse is skipped for the
//! rest of the session and the frame is written bare. The pulse width is
//! retried at small timing offsets because marginal adapters miss the
//! nominal window.

use crate::config::Config;
use crate::error::ProtocolError;
use crate::link::KLine;
use crate::pdu::{self, services};
use crate::transport::{delay_ms, ControlSignals};
use tracing::{debug, info, warn};

pub struct InitSequencer<'a> {
    kline: &'a mut KLine,
    config: &'a Config,
    break_supported: bool,
}

impl<'a> InitSequencer<'a> {
    pub fn new(kline: &'a mut KLine, config: &'a Config) -> Self {
        Self {
            kline,
            config,
            break_supported: true,
        }
    }

    /// Run the full wake-up: DTR/RTS line reset, then fast-init attempts at
    /// each configured timing offset until one draws a response starting
    /// with an accepted sync byte. A silent ECU is logged but not fatal
    /// here; the session start that follows will surface it.
    pub fn run(&mut self) -> Result<(), ProtocolError> {
        self.pulse_reset_lines();

        let frame = pdu::build_frame(
            self.config.tx_id,
            self.config.rx_id,
            &[services::START_COMMUNICATION],
        );

        let mut synced = false;
        for &offset in &self.config.fast_init_offsets_ms {
            match self.attempt(&frame, offset)? {
                Some(response)
                    if response
                        .first()
                        .is_some_and(|b| self.config.fast_init_sync_bytes.contains(b)) =>
                {
                    debug!("fast init sync at offset {}ms", offset);
                    synced = true;
                    break;
                }
                Some(response) => {
                    debug!(
                        "fast init at offset {}ms: unexpected leading byte 0x{:02X?}",
                        offset,
                        response.first()
                    );
                }
                None => {
                    debug!("fast init at offset {}ms: no response", offset);
                }
            }
        }

        if synced {
            info!("fast init handshake complete");
        } else {
            warn!("no fast-init sync response, continuing anyway");
        }

        // Drain whatever remains of the init response.
        let _ = self
            .kline
            .read_pdu(Some(self.config.fast_init_read_timeout()));

        Ok(())
    }

    /// Best-effort DTR/RTS pulse as a line-reset convenience.
    fn pulse_reset_lines(&mut self) {
        let step = self.config.line_reset_step_ms;
        let result = (|| -> Result<(), ProtocolError> {
            self.kline.set_signals(ControlSignals {
                dtr: Some(true),
                ..Default::default()
            })?;
            delay_ms(step);
            self.kline.set_signals(ControlSignals {
                dtr: Some(false),
                ..Default::default()
            })?;
            delay_ms(step);
            self.kline.set_signals(ControlSignals {
                dtr: Some(false),
                rts: Some(false),
                ..Default::default()
            })?;
            delay_ms(step);
            Ok(())
        })();

        if result.is_err() {
            debug!("DTR/RTS control not supported");
        }
    }

    /// One fast-init attempt at the given timing offset: break pulse, init
    /// frame, short response window. `None` means the window stayed silent.
    fn attempt(&mut self, frame: &[u8], offset_ms: i64) -> Result<Option<Vec<u8>>, ProtocolError> {
        let pulse_ms = (self.config.fast_init_pulse_ms as i64 - offset_ms).max(0) as u64;

        if self.break_supported {
            let pulsed = (|| -> Result<(), ProtocolError> {
                self.kline.set_signals(ControlSignals {
                    break_signal: Some(true),
                    ..Default::default()
                })?;
                delay_ms(pulse_ms);
                self.kline.set_signals(ControlSignals {
                    break_signal: Some(false),
                    ..Default::default()
                })?;
                delay_ms(pulse_ms);
                Ok(())
            })();

            if pulsed.is_err() {
                self.break_supported = false;
                warn!("fast init break not supported, falling back to write-only");
            }
        }

        self.kline.write_direct(frame)?;

        match self.kline.read_exact(
            self.config.fast_init_response_len,
            Some(self.config.fast_init_read_timeout()),
        ) {
            Ok(response) => Ok(Some(response)),
            Err(ProtocolError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testutil::Scripted;

    fn fast_config() -> Config {
        Config {
            fast_init_pulse_ms: 1,
            fast_init_read_timeout_ms: 10,
            line_reset_step_ms: 1,
            read_timeout_ms: 10,
            echo_timeout_ms: 5,
            write_guard_ms: 0,
            ..Config::default()
        }
    }

    #[test]
    fn first_attempt_with_sync_byte_succeeds() {
        // 40-byte wake-up run starting with an accepted sync byte.
        let mut blob = vec![0x81u8];
        blob.extend(std::iter::repeat(0x55).take(39));

        let config = fast_config();
        let mut kline = KLine::new(Box::new(Scripted::new(vec![blob])), &config);
        InitSequencer::new(&mut kline, &config).run().unwrap();
    }

    #[test]
    fn silent_bus_retries_every_offset_then_continues() {
        let config = fast_config();
        let mut kline = KLine::new(Box::new(Scripted::new(vec![])), &config);

        // All three offsets time out; the sequencer still completes so the
        // session start can report the real failure.
        InitSequencer::new(&mut kline, &config).run().unwrap();
    }

    #[test]
    fn rejected_sync_byte_falls_through_to_next_offset() {
        let first: Vec<u8> = vec![0x7Fu8; 40];
        let mut second = vec![0xC1u8];
        second.extend(std::iter::repeat(0x55).take(39));

        let config = fast_config();
        let mut kline = KLine::new(Box::new(Scripted::new(vec![first, second])), &config);
        InitSequencer::new(&mut kline, &config).run().unwrap();
    }
}
