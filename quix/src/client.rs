//! Client connect surface.

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info};

use quix_quic::tls::{StaticTlsEngine, TlsEngine};
use quix_quic::{Connection, ConnectionConfig, ConnectionEvent, TransportParameters};

use crate::endpoint::{spawn_driver, ConnectionHandle, DriverIo};

/// Options for [`Client::connect`].
pub struct ClientOptions {
    /// Initial wire version; defaults to draft-12.
    pub version: Option<u32>,
    /// Session ticket from a previous connection; enables 0-RTT.
    pub session: Option<Bytes>,
    /// Peer transport parameters remembered with the session; required
    /// for 0-RTT sends to be admitted before the handshake.
    pub transport_parameters: Option<TransportParameters>,
    /// Request bytes sent on stream 4 as soon as possible (0-RTT when a
    /// session is present).
    pub initial_request: Option<Bytes>,
    /// Key material for the static TLS engine.
    pub secret: Vec<u8>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            version: None,
            session: None,
            transport_parameters: None,
            initial_request: None,
            secret: crate::DEV_SECRET.to_vec(),
        }
    }
}

/// A connected client endpoint.
pub struct ClientConnection {
    pub handle: ConnectionHandle,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

pub struct Client;

impl Client {
    /// Connect to `host:port` and spawn the connection executor.
    pub async fn connect(host: &str, port: u16, options: ClientOptions) -> Result<ClientConnection> {
        let addr = lookup_host((host, port))
            .await
            .with_context(|| format!("resolving {host}:{port}"))?
            .next()
            .with_context(|| format!("no address for {host}:{port}"))?;

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.context("binding UDP socket")?;
        socket.connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
        debug!(%addr, "socket ready");

        let mut config = ConnectionConfig::default();
        if let Some(version) = options.version {
            config.version = version;
        }

        let mut tls = StaticTlsEngine::client(options.secret, config.local_params.encode());
        if let Some(session) = options.session {
            tls.set_session(session);
        }

        let mut conn = Connection::new_client(config, Box::new(tls))
            .map_err(|err| anyhow::anyhow!("connection setup: {err}"))?;
        if let Some(params) = &options.transport_parameters {
            conn.apply_session_params(params);
        }
        if let Some(request) = options.initial_request {
            let id = conn
                .open_stream(false)
                .map_err(|err| anyhow::anyhow!("opening request stream: {err}"))?;
            conn.stream_send(id, request, true)
                .map_err(|err| anyhow::anyhow!("queueing initial request: {err}"))?;
            info!(stream = %id, "initial request queued");
        }

        let (handle, events) = spawn_driver(conn, DriverIo::Connected(socket));
        Ok(ClientConnection { handle, events })
    }
}
