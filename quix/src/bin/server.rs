//! Demo server: answers HTTP/0.9-style requests over QUIC streams.

use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use quix::endpoint::ConnectionHandle;
use quix::http09;
use quix::server::{IncomingConnection, Server, ServerConfig};
use quix_quic::stream::StreamId;
use quix_quic::ConnectionEvent;

#[derive(Parser, Debug)]
#[command(name = "quix-server", about = "QUIC demo server")]
struct Args {
    /// Address to bind.
    host: String,

    /// UDP port to bind.
    port: u16,

    /// Key-material file for the TLS engine.
    #[arg(long)]
    key: PathBuf,

    /// Certificate file.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Validate client addresses with a Retry round trip.
    #[arg(long)]
    retry: bool,
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
    if let Err(err) = runtime.block_on(run(args)) {
        eprintln!("error: {err:#}");
        exit(1);
    }
    exit(0);
}

async fn run(args: Args) -> Result<()> {
    let config = ServerConfig { key: args.key, cert: args.cert, use_retry: args.retry };
    let mut server = Server::listen(&args.host, args.port, config).await?;

    while let Some(connection) = server.incoming.recv().await {
        tokio::spawn(serve_connection(connection));
    }
    Ok(())
}

async fn serve_connection(connection: IncomingConnection) {
    let IncomingConnection { handle, mut events } = connection;
    let mut requests: std::collections::HashMap<StreamId, Vec<u8>> = Default::default();

    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected => debug!("client connected"),
            ConnectionEvent::NewStream { stream_id } => {
                debug!(stream = %stream_id, "new stream");
                requests.insert(stream_id, Vec::new());
            }
            ConnectionEvent::StreamData { stream_id, data } => {
                requests.entry(stream_id).or_default().extend_from_slice(&data);
            }
            ConnectionEvent::StreamEnd { stream_id } => {
                let request = requests.remove(&stream_id).unwrap_or_default();
                respond(&handle, stream_id, &request);
            }
            ConnectionEvent::StreamReset { stream_id, error_code } => {
                debug!(stream = %stream_id, error_code, "stream reset");
                requests.remove(&stream_id);
            }
            ConnectionEvent::Draining => {}
            ConnectionEvent::Closed { error_code, .. } => {
                info!(error_code, "connection closed");
                return;
            }
        }
    }
}

fn respond(handle: &ConnectionHandle, stream_id: StreamId, request: &[u8]) {
    match http09::parse_request(request) {
        Some(resource) => {
            info!(stream = %stream_id, %resource, "request");
            let body = http09::demo_response(&resource);
            if let Err(err) = handle.stream_send(stream_id, body, true) {
                warn!(?err, "response send failed");
            }
        }
        None => {
            warn!(stream = %stream_id, "malformed request, resetting stream");
            handle.reset_stream(stream_id, 0x01);
        }
    }
}
