//! Byte transport capability.
//!
//! The protocol engine only ever talks to the [`Transport`] trait; the
//! default implementation drives a serial port (K-Line adapter). Reads are
//! deadline-bounded, and control-signal support is allowed to be absent.

use crate::error::TransportError;
use serialport::SerialPort;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Requested control-signal changes. `None` leaves a line untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlSignals {
    pub break_signal: Option<bool>,
    pub dtr: Option<bool>,
    pub rts: Option<bool>,
}

/// Half-duplex byte channel with timeout-bounded reads.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns 0 if nothing arrived before the deadline.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write all bytes.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Toggle break / DTR / RTS lines. `Err(Unsupported)` means the platform
    /// cannot drive the requested signals; callers must degrade gracefully.
    fn set_signals(&mut self, signals: ControlSignals) -> Result<(), TransportError>;

    /// Close the channel. Idempotent.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Information about an available serial port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// List available serial ports.
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(map_serial_err)?;

    Ok(ports
        .into_iter()
        .map(|info| {
            let description = match info.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    usb.product.unwrap_or_else(|| "USB serial".to_string())
                }
                _ => "serial port".to_string(),
            };
            PortInfo {
                name: info.port_name,
                description,
            }
        })
        .collect())
}

/// Serial port transport (K-Line adapter behind a USB UART).
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Open a serial port at the given baud rate, configured 8N1 without
    /// flow control.
    pub fn open(name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        info!("Opening {} at {} baud", name, baud_rate);

        let port = serialport::new(name, baud_rate)
            .timeout(Duration::from_millis(100))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(map_serial_err)?;

        Ok(Self { port: Some(port) })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        port.set_timeout(timeout).map_err(map_serial_err)?;

        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(TransportError::Closed),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn set_signals(&mut self, signals: ControlSignals) -> Result<(), TransportError> {
        let port = self.port_mut()?;

        if let Some(on) = signals.break_signal {
            let result = if on { port.set_break() } else { port.clear_break() };
            result.map_err(|e| {
                debug!("break signal rejected: {}", e);
                TransportError::Unsupported
            })?;
        }
        if let Some(on) = signals.dtr {
            port.write_data_terminal_ready(on)
                .map_err(|_| TransportError::Unsupported)?;
        }
        if let Some(on) = signals.rts {
            port.write_request_to_send(on)
                .map_err(|_| TransportError::Unsupported)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!("Serial port closed");
        }
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn map_serial_err(e: serialport::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::Closed,
        _ => TransportError::Io(std::io::Error::other(e.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::VecDeque;

    /// Transport double fed from a script of read chunks.
    pub struct Scripted {
        pub reads: VecDeque<Vec<u8>>,
        pub written: Vec<Vec<u8>>,
    }

    impl Scripted {
        pub fn new(reads: Vec<Vec<u8>>) -> Self {
            Self {
                reads: reads.into(),
                written: Vec::new(),
            }
        }
    }

    impl Transport for Scripted {
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            match self.reads.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        chunk.drain(..n);
                        self.reads.push_front(chunk);
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written.push(data.to_vec());
            Ok(())
        }

        fn set_signals(&mut self, _signals: ControlSignals) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }
}

/// Millisecond delay with sub-millisecond tail precision.
///
/// Sleeps for the bulk of the interval and spin-waits the final stretch so
/// break/DTR pulse edges land where the init choreography expects them.
pub fn delay_ms(ms: u64) {
    let start = Instant::now();
    let target = Duration::from_millis(ms);

    if ms > 2 {
        std::thread::sleep(Duration::from_millis(ms.saturating_sub(1)));
    }

    while start.elapsed() < target {
        std::hint::spin_loop();
    }
}
