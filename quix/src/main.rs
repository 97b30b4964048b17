//! Demo client: `quix <host> <port> [resource|version]`.
//!
//! The third argument is a resource path, or a hex version number (e.g.
//! `0xdeadbeef`) to exercise version negotiation. Exits 0 on graceful
//! close, -1 on usage errors. `QUIX_LOG` routes verbose logging.

use std::io::Write;
use std::process::exit;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};

use quix::client::{Client, ClientOptions};
use quix::http09;
use quix_quic::ConnectionEvent;

#[derive(Parser, Debug)]
#[command(name = "quix", about = "QUIC demo client")]
struct Args {
    /// Server host name or address.
    host: String,

    /// Server UDP port.
    port: u16,

    /// Resource to fetch, or a hex wire version (0x...) to offer.
    target: Option<String>,
}

fn main() {
    quix::init_logging();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            exit(-1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            exit(1);
        }
    };
    match runtime.block_on(run(args)) {
        Ok(()) => exit(0),
        Err(err) => {
            eprintln!("error: {err:#}");
            exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut options = ClientOptions::default();
    let mut resource = String::from("/index.html");
    match args.target.as_deref() {
        Some(target) if target.starts_with("0x") => {
            let version = u32::from_str_radix(target.trim_start_matches("0x"), 16)
                .map_err(|_| anyhow::anyhow!("bad version {target}"))?;
            options.version = Some(version);
            info!(version, "offering explicit version");
        }
        Some(target) => resource = target.to_string(),
        None => {}
    }
    options.initial_request = Some(http09::format_request(&resource));

    info!(host = %args.host, port = args.port, %resource, "connecting");
    let mut connection = Client::connect(&args.host, args.port, options).await?;

    let mut body = Vec::new();
    while let Some(event) = connection.events.recv().await {
        match event {
            ConnectionEvent::Connected => debug!("handshake complete"),
            ConnectionEvent::StreamData { data, .. } => body.extend_from_slice(&data),
            ConnectionEvent::StreamEnd { stream_id } => {
                debug!(stream = %stream_id, "response complete");
                std::io::stdout().write_all(&body)?;
                connection.handle.close();
            }
            ConnectionEvent::StreamReset { stream_id, error_code } => {
                warn!(stream = %stream_id, error_code, "stream reset by server");
                connection.handle.close();
            }
            ConnectionEvent::Draining | ConnectionEvent::Closed { .. } => break,
            ConnectionEvent::NewStream { .. } => {}
        }
    }
    Ok(())
}
