//! Listening endpoint: one UDP socket shared by all connections, each
//! datagram dispatched to its connection's executor by destination
//! connection ID.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use quix_quic::packet::{Header, PacketType};
use quix_quic::tls::StaticTlsEngine;
use quix_quic::{version, Connection, ConnectionConfig, ConnectionEvent};

use crate::endpoint::{spawn_driver, ConnectionHandle, DriverIo};

/// Length of the connection IDs this listener issues; short-header
/// routing depends on it being uniform.
const SERVER_CID_LEN: usize = 8;

pub struct ServerConfig {
    /// Key-material file handed to the TLS engine.
    pub key: PathBuf,
    /// Certificate file; presented by engines that use one.
    pub cert: Option<PathBuf>,
    /// Validate client addresses with a Retry round trip.
    pub use_retry: bool,
}

/// A connection accepted by the listener.
pub struct IncomingConnection {
    pub handle: ConnectionHandle,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

pub struct Server {
    pub incoming: mpsc::UnboundedReceiver<IncomingConnection>,
}

impl Server {
    /// Bind `host:port` and start accepting connections.
    pub async fn listen(host: &str, port: u16, config: ServerConfig) -> Result<Server> {
        let secret = std::fs::read(&config.key)
            .with_context(|| format!("reading key file {}", config.key.display()))?;
        if let Some(cert) = &config.cert {
            // The static engine derives everything from the key; the
            // certificate is only checked for existence here.
            std::fs::metadata(cert)
                .with_context(|| format!("reading certificate {}", cert.display()))?;
        }

        let socket = Arc::new(
            UdpSocket::bind((host, port))
                .await
                .with_context(|| format!("binding {host}:{port}"))?,
        );
        info!(%host, port, "listening");

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(socket, secret, config.use_retry, incoming_tx));
        Ok(Server { incoming: incoming_rx })
    }
}

async fn accept_loop(
    socket: Arc<UdpSocket>,
    secret: Vec<u8>,
    use_retry: bool,
    incoming_tx: mpsc::UnboundedSender<IncomingConnection>,
) {
    // Destination-CID bytes -> that connection's inbound queue. Each
    // value is owned by exactly one executor.
    let mut routes: HashMap<Vec<u8>, mpsc::UnboundedSender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; 2048];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!(?err, "listener socket error");
                continue;
            }
        };
        let datagram = &buf[..len];

        let (header, _) = match Header::parse(datagram, SERVER_CID_LEN) {
            Ok(parsed) => parsed,
            Err(_) => {
                trace!(%peer, len, "unparseable datagram dropped");
                continue;
            }
        };

        // Existing connection?
        if let Some(route) = routes.get(header.dcid.as_bytes()) {
            if route.send(Bytes::copy_from_slice(datagram)).is_ok() {
                continue;
            }
            routes.remove(header.dcid.as_bytes());
        }

        // Only a client Initial may create state.
        if header.ty != PacketType::Initial {
            trace!(%peer, ty = ?header.ty, "datagram for unknown connection dropped");
            continue;
        }
        if !version::is_supported(header.version) {
            let scid = header.scid.clone().unwrap_or_else(quix_quic::ConnectionId::empty);
            match version::negotiation_packet(scid, header.dcid.clone()) {
                Ok(packet) => {
                    debug!(%peer, version = header.version, "sending version negotiation");
                    if let Err(err) = socket.send_to(&packet, peer).await {
                        warn!(?err, "failed to send version negotiation");
                    }
                }
                Err(err) => warn!(?err, "failed to build version negotiation"),
            }
            continue;
        }

        let mut config = ConnectionConfig::default();
        config.cid_len = SERVER_CID_LEN;
        config.use_retry = use_retry;
        config.local_params.stateless_reset_token = Some(rand::random());
        let tls = StaticTlsEngine::server(secret.clone(), config.local_params.encode());
        let conn = match Connection::new_server(config, Box::new(tls)) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(?err, "failed to create connection");
                continue;
            }
        };
        debug!(%peer, dcid = %header.dcid, scid = %conn.local_cid(), "new connection");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        // Route both the client-chosen ID (more Initials, and the
        // post-Retry echo of our ID) and the ID we issue (everything
        // after the handshake).
        routes.insert(header.dcid.as_bytes().to_vec(), inbound_tx.clone());
        routes.insert(conn.local_cid().as_bytes().to_vec(), inbound_tx.clone());

        let io = DriverIo::Shared { socket: Arc::clone(&socket), peer, inbound: inbound_rx };
        let (handle, events) = spawn_driver(conn, io);
        let _ = inbound_tx.send(Bytes::copy_from_slice(datagram));
        if incoming_tx
            .send(IncomingConnection { handle, events })
            .is_err()
        {
            debug!("listener dropped, accept loop exiting");
            return;
        }
    }
}
