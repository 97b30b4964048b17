//! Per-connection executor.
//!
//! Each connection runs on its own task: a loop that flushes outgoing
//! datagrams, forwards events, and then waits on exactly one of (a) an
//! inbound datagram, (b) the connection's next deadline, or (c) an
//! application command. All state transitions for a connection happen on
//! this one task, in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use quix_quic::stream::StreamId;
use quix_quic::{Connection, ConnectionEvent, ConnectionState};

/// Commands from application handles to the executor.
pub enum Command {
    /// Open a stream and send `data` on it (FIN when `fin`).
    Request {
        data: Bytes,
        fin: bool,
        reply: oneshot::Sender<Result<StreamId, quix_quic::Error>>,
    },
    /// Write to an existing stream.
    StreamSend { id: StreamId, data: Bytes, fin: bool },
    /// Reset a stream.
    ResetStream { id: StreamId, error_code: u16 },
    /// Fetch the session ticket, once the peer issued one.
    SessionTicket { reply: oneshot::Sender<Option<Bytes>> },
    /// Close the connection gracefully.
    Close,
}

/// Handle held by the application side.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    /// Open a new bidirectional stream carrying `data`, finished.
    pub async fn request(&self, data: Bytes) -> Result<StreamId> {
        let (reply, answer) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { data, fin: true, reply })
            .map_err(|_| anyhow::anyhow!("connection is gone"))?;
        Ok(answer.await??)
    }

    pub fn stream_send(&self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        self.cmd_tx
            .send(Command::StreamSend { id, data, fin })
            .map_err(|_| anyhow::anyhow!("connection is gone"))
    }

    pub fn reset_stream(&self, id: StreamId, error_code: u16) {
        let _ = self.cmd_tx.send(Command::ResetStream { id, error_code });
    }

    /// Session ticket for later resumption, if the peer issued one yet.
    pub async fn session_ticket(&self) -> Option<Bytes> {
        let (reply, answer) = oneshot::channel();
        self.cmd_tx.send(Command::SessionTicket { reply }).ok()?;
        answer.await.ok().flatten()
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

/// The I/O face of one connection: an owned connected socket (client) or
/// a share of the listener socket plus a routed inbound queue (server).
pub enum DriverIo {
    Connected(UdpSocket),
    Shared {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    },
}

impl DriverIo {
    async fn send(&self, datagram: &[u8]) -> std::io::Result<()> {
        match self {
            DriverIo::Connected(socket) => {
                socket.send(datagram).await?;
            }
            DriverIo::Shared { socket, peer, .. } => {
                socket.send_to(datagram, peer).await?;
            }
        }
        Ok(())
    }

    /// Wait for the next datagram; `None` means the transport went away.
    async fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self {
            DriverIo::Connected(socket) => socket.recv(buf).await.ok(),
            DriverIo::Shared { inbound, .. } => {
                let datagram = inbound.recv().await?;
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Some(len)
            }
        }
    }
}

/// Spawn the executor for one connection.
pub fn spawn_driver(
    conn: Connection,
    io: DriverIo,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(drive(conn, io, cmd_rx, event_tx));
    (ConnectionHandle { cmd_tx }, event_rx)
}

async fn drive(
    mut conn: Connection,
    mut io: DriverIo,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        // Flush everything the connection wants on the wire.
        while let Some(datagram) = conn.poll_transmit(Instant::now()) {
            if let Err(err) = io.send(&datagram).await {
                warn!(?err, "socket send failed");
                break;
            }
            trace!(bytes = datagram.len(), "datagram sent");
        }
        // Surface events; a dropped receiver closes the connection.
        while let Some(event) = conn.poll_event() {
            if event_tx.send(event).is_err() {
                conn.close(Instant::now());
                break;
            }
        }
        if conn.state() == ConnectionState::Closed {
            debug!("connection closed, executor exiting");
            return;
        }

        let deadline = conn.next_timeout();
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => apply_command(&mut conn, cmd),
                None => conn.close(Instant::now()),
            },

            received = io.recv(&mut buf) => match received {
                Some(len) => conn.handle_datagram(&buf[..len], Instant::now()),
                None => conn.close(Instant::now()),
            },

            _ = sleep_until_deadline(deadline) => conn.on_timeout(Instant::now()),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn apply_command(conn: &mut Connection, cmd: Command) {
    match cmd {
        Command::Request { data, fin, reply } => {
            let result = conn
                .open_stream(false)
                .and_then(|id| conn.stream_send(id, data, fin).map(|_| id));
            let _ = reply.send(result);
        }
        Command::StreamSend { id, data, fin } => {
            if let Err(err) = conn.stream_send(id, data, fin) {
                warn!(?err, stream = %id, "stream write failed");
            }
        }
        Command::ResetStream { id, error_code } => {
            if let Err(err) = conn.reset_stream(id, error_code) {
                warn!(?err, stream = %id, "stream reset failed");
            }
        }
        Command::SessionTicket { reply } => {
            let _ = reply.send(conn.session_ticket());
        }
        Command::Close => conn.close(Instant::now()),
    }
}
