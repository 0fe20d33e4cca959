//! KWP2000 K-Line datalogger.
//!
//! Connects to a SIMK4x engine ECU over a serial K-Line adapter and streams
//! decoded telemetry records to stdout until interrupted.

use anyhow::{Context, Result};
use kwp_logger::sink::StdoutSink;
use kwp_logger::{transport, Config, SerialTransport, Session};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn usage() -> ! {
    eprintln!("Usage: kwp-logger [--config <file.json>] <port>");
    eprintln!("       kwp-logger            (list available ports)");
    std::process::exit(2);
}

fn parse_args() -> Result<(Option<String>, Option<String>)> {
    let mut port = None;
    let mut config_path = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = Some(path),
                None => usage(),
            },
            "-h" | "--help" => usage(),
            _ if port.is_none() => port = Some(arg),
            _ => usage(),
        }
    }

    Ok((port, config_path))
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config file {}", path))
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into())),
        )
        .with_target(false)
        .compact()
        .init();

    let (port, config_path) = parse_args()?;
    let config = load_config(config_path.as_deref())?;

    let Some(port) = port else {
        let ports = transport::list_ports().context("listing serial ports")?;
        if ports.is_empty() {
            println!("No serial ports found. Connect a K-Line adapter and retry.");
            return Ok(());
        }
        println!("Available ports:");
        for info in ports {
            println!("  {} - {}", info.name, info.description);
        }
        return Ok(());
    };

    let transport =
        SerialTransport::open(&port, config.baud_rate).context("opening serial port")?;

    let session = Session::connect(Box::new(transport), config, Arc::new(StdoutSink))
        .await
        .context("connecting to ECU")?;

    info!("KWP log started on {} ({})", port, session.profile().name);
    info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    session.disconnect().await;
    Ok(())
}
