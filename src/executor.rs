//! Serialized command execution.
//!
//! All service requests funnel through one FIFO channel into a single
//! executor loop owning the framer, so the half-duplex bus never sees two
//! requests in flight. Keep-alive and poll traffic share the same channel as
//! session setup.

use crate::error::ProtocolError;
use crate::link::KLine;
use crate::pdu::{self, services};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Positive response to a service request.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub status: u8,
    pub data: Vec<u8>,
}

enum Request {
    Execute {
        service: u8,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<CommandResponse, ProtocolError>>,
    },
    SetReadTimeout(Duration),
}

/// Clonable handle enqueueing requests onto the executor loop.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<Request>,
    last_activity: Arc<Mutex<Instant>>,
}

impl CommandHandle {
    /// Run one service request to completion. Calls are totally ordered by
    /// the channel; each resolves to a positive response or a terminal error
    /// for that command alone.
    pub async fn execute(&self, service: u8, data: &[u8]) -> Result<CommandResponse, ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Execute {
                service,
                data: data.to_vec(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProtocolError::TransportClosed)?;
        reply_rx.await.map_err(|_| ProtocolError::TransportClosed)?
    }

    /// Change the framer's default read deadline (ordered with the queue).
    pub async fn set_read_timeout(&self, timeout: Duration) -> Result<(), ProtocolError> {
        self.tx
            .send(Request::SetReadTimeout(timeout))
            .await
            .map_err(|_| ProtocolError::TransportClosed)
    }

    /// Time since the last successful command on the bus.
    pub fn idle_time(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// ReadMemoryByAddress: 24-bit big-endian address plus byte count.
    pub async fn read_memory(&self, offset: u32, size: u8) -> Result<Vec<u8>, ProtocolError> {
        let request = [
            (offset >> 16) as u8,
            (offset >> 8) as u8,
            offset as u8,
            size,
        ];
        let response = self
            .execute(services::READ_MEMORY_BY_ADDRESS, &request)
            .await?;
        Ok(response.data)
    }

    /// Read a memory region and render it as ASCII (lossy).
    pub async fn read_ascii(&self, offset: u32, size: u8) -> Result<String, ProtocolError> {
        let data = self.read_memory(offset, size).await?;
        Ok(data
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect())
    }
}

/// Spawn the executor loop on its own thread, taking ownership of the framer.
/// The loop exits (and closes the transport) once every handle is dropped.
pub fn spawn(kline: KLine, tx_id: u8, rx_id: u8) -> (CommandHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let shared = Arc::clone(&last_activity);

    let thread = std::thread::spawn(move || run(kline, rx, shared, tx_id, rx_id));

    (CommandHandle { tx, last_activity }, thread)
}

fn run(
    mut kline: KLine,
    mut rx: mpsc::Receiver<Request>,
    last_activity: Arc<Mutex<Instant>>,
    tx_id: u8,
    rx_id: u8,
) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Execute {
                service,
                data,
                reply,
            } => {
                let result = execute_on(&mut kline, tx_id, rx_id, service, &data);
                if result.is_ok() {
                    if let Ok(mut stamp) = last_activity.lock() {
                        *stamp = Instant::now();
                    }
                }
                // Caller may have gone away; dropping the result is fine.
                let _ = reply.send(result);
            }
            Request::SetReadTimeout(timeout) => kline.set_read_timeout(timeout),
        }
    }

    if let Err(e) = kline.close() {
        warn!("closing transport failed: {}", e);
    }
}

/// One request/response transaction on the bus, including the
/// "response pending" retry-read loop.
fn execute_on(
    kline: &mut KLine,
    tx_id: u8,
    rx_id: u8,
    service: u8,
    data: &[u8],
) -> Result<CommandResponse, ProtocolError> {
    let mut pdu_data = Vec::with_capacity(data.len() + 1);
    pdu_data.push(service);
    pdu_data.extend_from_slice(data);

    debug!("PDU TX {:02x?}", pdu_data);
    let frame = pdu::build_frame(tx_id, rx_id, &pdu_data);
    kline.send_frame(&frame)?;

    let mut response = kline.read_pdu(None)?;
    loop {
        let status = *response.first().ok_or(ProtocolError::Timeout)?;

        if status == services::NEGATIVE_RESPONSE
            && response.get(2) == Some(&services::RESPONSE_PENDING)
        {
            // ECU needs more time: read the next PDU on the same
            // transaction, without resending.
            response = kline.read_pdu(None)?;
            continue;
        }

        if status == services::NEGATIVE_RESPONSE {
            let rejected = response.get(1).copied().unwrap_or(0);
            let code = response.get(2).copied().unwrap_or(0);
            warn!(
                "negative response: service 0x{:02X}, code 0x{:02X} ({})",
                rejected,
                code,
                pdu::error_description(code)
            );
            return Err(ProtocolError::NegativeResponse {
                service: rejected,
                code,
            });
        }

        return Ok(CommandResponse {
            status,
            data: response[1..].to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::testutil::Scripted;

    fn kline_with(reads: Vec<Vec<u8>>) -> KLine {
        let config = Config {
            read_timeout_ms: 50,
            echo_timeout_ms: 5,
            write_guard_ms: 0,
            ..Config::default()
        };
        KLine::new(Box::new(Scripted::new(reads)), &config)
    }

    fn response_frame(data: &[u8]) -> Vec<u8> {
        pdu::build_frame(0xF1, 0x11, data)
    }

    #[test]
    fn positive_response_splits_status_and_payload() {
        let mut kline = kline_with(vec![response_frame(&[0x61, 0x01, 42])]);

        let resp = execute_on(&mut kline, 0x11, 0xF1, 0x21, &[0x01]).unwrap();
        assert_eq!(resp.status, 0x61);
        assert_eq!(resp.data, vec![0x01, 42]);
    }

    #[test]
    fn pending_code_triggers_one_extra_read_without_resend() {
        let mut kline = kline_with(vec![
            response_frame(&[0x7F, 0x21, 0x78]),
            response_frame(&[0x61, 0x01, 7]),
        ]);

        let resp = execute_on(&mut kline, 0x11, 0xF1, 0x21, &[0x01]).unwrap();
        assert_eq!(resp.status, 0x61);
        assert_eq!(resp.data, vec![0x01, 7]);
    }

    #[test]
    fn other_negative_codes_are_terminal() {
        let mut kline = kline_with(vec![response_frame(&[0x7F, 0x27, 0x33])]);

        let err = execute_on(&mut kline, 0x11, 0xF1, 0x27, &[0x02]).unwrap_err();
        match err {
            ProtocolError::NegativeResponse { service, code } => {
                assert_eq!(service, 0x27);
                assert_eq!(code, 0x33);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handle_round_trip_updates_activity() {
        let kline = kline_with(vec![response_frame(&[0x7E, 0x01])]);
        let (handle, thread) = spawn(kline, 0x11, 0xF1);

        std::thread::sleep(Duration::from_millis(20));
        assert!(handle.idle_time() >= Duration::from_millis(15));

        let resp = handle.execute(0x3E, &[0x01]).await.unwrap();
        assert_eq!(resp.status, 0x7E);
        assert!(handle.idle_time() < Duration::from_millis(15));

        drop(handle);
        thread.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cloned_handles_keep_the_queue_alive() {
        let kline = kline_with(vec![]);
        let (handle, thread) = spawn(kline, 0x11, 0xF1);

        let inner = handle.clone();
        drop(handle);
        // Queue stays open while any handle survives; the silent transport
        // times this command out but the loop keeps running.
        assert!(matches!(
            inner.execute(0x3E, &[0x01]).await,
            Err(ProtocolError::Timeout)
        ));

        drop(inner);
        thread.join().unwrap();
    }
}
