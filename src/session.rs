//! Diagnostic session lifecycle.
//!
//! `connect` runs the whole establishment choreography: fast init, session
//! start, timing negotiation, security access, ECU identification, the
//! one-time HELLO record, then the keep-alive and poll tasks. `disconnect`
//! tears everything down in the reverse order: timers first, then the
//! command channel, letting the executor drain and close the transport.

use crate::catalog::{self, DATA_SOURCES};
use crate::config::Config;
use crate::error::ProtocolError;
use crate::executor::{self, CommandHandle};
use crate::identify::{self, EcuProfile};
use crate::init::InitSequencer;
use crate::link::KLine;
use crate::pdu::services;
use crate::security;
use crate::sink::{self, TelemetrySink};
use crate::transport::Transport;
use std::sync::Arc;
use std::thread;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Extended diagnostic session used during setup.
const SESSION_EXTENDED: u8 = 0x85;
/// Session type under which live polling runs.
const SESSION_STANDBY: u8 = 0x81;

/// One active connection to an ECU. Owns every piece of mutable session
/// state: the command channel, the executor thread and both timer tasks.
/// Reconnection means building a fresh instance.
pub struct Session {
    handle: CommandHandle,
    keep_alive: JoinHandle<()>,
    poller: JoinHandle<()>,
    executor: thread::JoinHandle<()>,
    profile: &'static EcuProfile,
}

impl Session {
    /// Establish a session over the given transport and start polling.
    pub async fn connect(
        transport: Box<dyn Transport>,
        config: Config,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, ProtocolError> {
        info!("Selected protocol: K-Line. Initializing..");

        let kline = KLine::new(transport, &config);
        let init_config = config.clone();
        let kline = tokio::task::spawn_blocking(move || -> Result<KLine, ProtocolError> {
            let mut kline = kline;
            InitSequencer::new(&mut kline, &init_config).run()?;
            Ok(kline)
        })
        .await
        .map_err(|_| ProtocolError::TransportClosed)??;

        let (handle, executor) = executor::spawn(kline, config.tx_id, config.rx_id);

        // Keep-alive guards the link from the moment it is awake, including
        // through the slower setup steps.
        let keep_alive = spawn_keep_alive(handle.clone(), &config);

        let profile = match establish(&handle, &config, sink.as_ref()).await {
            Ok(profile) => profile,
            Err(e) => {
                keep_alive.abort();
                drop(handle);
                let _ = tokio::task::spawn_blocking(move || executor.join()).await;
                return Err(e);
            }
        };

        let poller = spawn_poller(handle.clone(), Arc::clone(&sink), &config);

        Ok(Self {
            handle,
            keep_alive,
            poller,
            executor,
            profile,
        })
    }

    /// Profile of the identified ECU variant.
    pub fn profile(&self) -> &'static EcuProfile {
        self.profile
    }

    /// Stop both timers, close the command channel and wait for the
    /// executor to release the transport. In-flight commands fail naturally
    /// rather than being aborted mid-transaction.
    pub async fn disconnect(self) {
        info!("Disconnecting");

        self.poller.abort();
        self.keep_alive.abort();
        drop(self.handle);

        let executor = self.executor;
        let _ = tokio::task::spawn_blocking(move || executor.join()).await;

        info!("Session closed");
    }
}

/// Setup choreography between wake-up and polling. Returns the identified
/// profile; only session start and identification failures are fatal.
async fn establish(
    handle: &CommandHandle,
    config: &Config,
    sink: &dyn TelemetrySink,
) -> Result<&'static EcuProfile, ProtocolError> {
    info!("Trying to start diagnostic session");
    handle
        .execute(services::START_DIAGNOSTIC_SESSION, &[SESSION_EXTENDED])
        .await?;
    handle
        .set_read_timeout(config.session_read_timeout())
        .await?;

    info!("Set timing parameters to maximum");
    if let Err(e) = negotiate_timing(handle).await {
        warn!("timing params failed: {}", e);
    }

    info!("Security Access");
    if let Err(e) = security::unlock(handle).await {
        warn!("{}", e);
    }

    info!("Trying to identify ECU automatically..");
    let profile = identify::identify(handle).await?;
    info!("Found! {}", profile.name);

    info!("Trying to find calibration..");
    match read_calibration(handle, profile).await {
        Ok((calibration, description)) => {
            info!(
                "Found! Description: {}, calibration: {}",
                description, calibration
            );
        }
        Err(e) => warn!("calibration read failed: {}", e),
    }

    info!("Building parameter header");
    sink.emit(&sink::build_hello(DATA_SOURCES));

    info!("Logging..");
    handle
        .execute(services::START_DIAGNOSTIC_SESSION, &[SESSION_STANDBY])
        .await?;

    Ok(profile)
}

/// Read the current timing parameters and write the first five back with
/// the "set to given values" sub-function, pushing them to their limits.
async fn negotiate_timing(handle: &CommandHandle) -> Result<(), ProtocolError> {
    let timing = handle
        .execute(services::ACCESS_TIMING_PARAMETERS, &[0x00])
        .await?;

    let params = timing.data.get(1..).unwrap_or(&[]);
    if params.len() >= 5 {
        let mut request = vec![0x03];
        request.extend_from_slice(&params[..5]);
        handle
            .execute(services::ACCESS_TIMING_PARAMETERS, &request)
            .await?;
    }
    Ok(())
}

/// Calibration id and description strings, located relative to the
/// profile's memory offset.
async fn read_calibration(
    handle: &CommandHandle,
    profile: &EcuProfile,
) -> Result<(String, String), ProtocolError> {
    let calibration_offset = (0x090000i64 + profile.memory_offset) as u32;
    let description_offset = (0x090040i64 + profile.memory_offset) as u32;

    let calibration = handle.read_ascii(calibration_offset, 8).await?;
    let description = handle.read_ascii(description_offset, 8).await?;
    Ok((calibration, description))
}

/// Keep-alive: periodically check bus idle time and inject a TesterPresent
/// when the link has been quiet for a full threshold. Per-command failures
/// are ignored and retried next tick; a closed transport stops the task.
fn spawn_keep_alive(handle: CommandHandle, config: &Config) -> JoinHandle<()> {
    let threshold = config.keep_alive();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(threshold).await;
            if handle.idle_time() >= threshold {
                if let Err(ProtocolError::TransportClosed) =
                    handle.execute(services::TESTER_PRESENT, &[0x01]).await
                {
                    break;
                }
            }
        }
    })
}

/// Poll loop: every tick reads each data source, decodes the full catalog
/// and emits one DATA record. A failed tick is logged and skipped; a closed
/// transport stops the task.
fn spawn_poller(
    handle: CommandHandle,
    sink: Arc<dyn TelemetrySink>,
    config: &Config,
) -> JoinHandle<()> {
    let period = config.poll_interval();
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            match poll_once(&handle, sink.as_ref()).await {
                Ok(()) => {}
                Err(ProtocolError::TransportClosed) => {
                    warn!("transport closed, polling stopped");
                    break;
                }
                Err(e) => warn!("poll error: {}", e),
            }
        }
    })
}

async fn poll_once(
    handle: &CommandHandle,
    sink: &dyn TelemetrySink,
) -> Result<(), ProtocolError> {
    let mut values = Vec::with_capacity(catalog::field_count());

    for source in DATA_SOURCES {
        let response = handle
            .execute(services::READ_DATA_BY_LOCAL_ID, &[source.id])
            .await?;
        for parameter in source.parameters {
            values.push(catalog::decode(&response.data, parameter));
        }
    }

    let timestamp = chrono::Utc::now().timestamp_millis();
    sink.emit(&sink::build_data(timestamp, &values));
    Ok(())
}
