//! TLS engine seam.
//!
//! The transport does not implement TLS; it exchanges opaque handshake
//! bytes on stream 0 and asks the engine for per-epoch traffic secrets and
//! session tickets. [`StaticTlsEngine`] is the bundled engine: a
//! deterministic HKDF construction over pre-shared key material, enough to
//! drive the demo harness and the test suite. It performs no certificate
//! verification; that policy belongs to real engines.

use bytes::{Buf, Bytes};
use rand::RngCore;
use ring::hkdf;

use crate::crypto::Epoch;
use crate::error::{Error, QuicError, Result};
use crate::Side;

/// Contract between the connection and its TLS engine.
pub trait TlsEngine: Send {
    /// Produce the first handshake flight (client only; empty for servers).
    fn start(&mut self) -> Result<Vec<u8>>;

    /// Consume peer handshake bytes from stream 0.
    ///
    /// Returns reply bytes to be sent on stream 0, possibly empty. Input
    /// may be fragmented arbitrarily; the engine buffers internally.
    fn read_handshake(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    /// Whether the handshake has completed on this side.
    fn is_complete(&self) -> bool;

    /// Write secret of `side` for `epoch`, once derivable.
    ///
    /// Initial-epoch secrets are not the engine's business (they derive
    /// from the connection ID) and always return `None`.
    fn epoch_secret(&self, epoch: Epoch, side: Side) -> Option<Vec<u8>>;

    /// Peer's transport-parameter blob, once its hello was processed.
    fn peer_transport_parameters(&self) -> Option<Bytes>;

    /// Session ticket issued by the peer, for later resumption.
    fn session_ticket(&self) -> Option<Bytes>;

    /// Import a session ticket; enables 0-RTT secrets before the first
    /// flight.
    fn set_session(&mut self, ticket: Bytes);

    /// 0-RTT secrets are available ahead of the handshake.
    fn has_early_secrets(&self) -> bool;
}

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_FINISHED: u8 = 3;
const MSG_TICKET: u8 = 4;

const RANDOM_LEN: usize = 32;
const TICKET_LEN: usize = 16;
const FINISHED_LEN: usize = 16;
const SECRET_LEN: usize = 32;

/// TLS alert `handshake_failure`.
const ALERT_HANDSHAKE_FAILURE: u8 = 40;
/// TLS alert `decode_error`.
const ALERT_DECODE_ERROR: u8 = 50;

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn derive(secret: &[u8], label: &str, context: &[u8], len: usize) -> Vec<u8> {
    let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
    let mut out = vec![0u8; len];
    let label_bytes = label.as_bytes();
    // Expansion cannot fail for the output lengths used here.
    if prk
        .expand(&[label_bytes, context], OkmLen(len))
        .and_then(|okm| okm.fill(&mut out))
        .is_err()
    {
        out.clear();
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Idle,
    HelloSent,
    Complete,
}

/// Deterministic pre-shared-key engine.
///
/// Both endpoints are constructed over the same key material (the demo
/// server's key file). Handshake secrets bind the client random so they
/// are installable as soon as the ClientHello is on the wire; 1-RTT
/// secrets additionally bind the server random.
pub struct StaticTlsEngine {
    side: Side,
    psk: Vec<u8>,
    local_params: Bytes,
    peer_params: Option<Bytes>,
    client_random: [u8; RANDOM_LEN],
    server_random: Option<[u8; RANDOM_LEN]>,
    state: HandshakeState,
    inbound: Vec<u8>,
    ticket_in: Option<Bytes>,
    ticket_out: Option<Bytes>,
}

impl StaticTlsEngine {
    pub fn client(psk: impl Into<Vec<u8>>, transport_parameters: Bytes) -> Self {
        let mut client_random = [0u8; RANDOM_LEN];
        rand::thread_rng().fill_bytes(&mut client_random);
        Self {
            side: Side::Client,
            psk: psk.into(),
            local_params: transport_parameters,
            peer_params: None,
            client_random,
            server_random: None,
            state: HandshakeState::Idle,
            inbound: Vec::new(),
            ticket_in: None,
            ticket_out: None,
        }
    }

    pub fn server(psk: impl Into<Vec<u8>>, transport_parameters: Bytes) -> Self {
        Self {
            side: Side::Server,
            psk: psk.into(),
            local_params: transport_parameters,
            peer_params: None,
            client_random: [0u8; RANDOM_LEN],
            server_random: None,
            state: HandshakeState::Idle,
            inbound: Vec::new(),
            ticket_in: None,
            ticket_out: None,
        }
    }

    fn handshake_secret(&self, side: Side) -> Vec<u8> {
        let label = match side {
            Side::Client => "quix hs client",
            Side::Server => "quix hs server",
        };
        derive(&self.psk, label, &self.client_random, SECRET_LEN)
    }

    fn one_rtt_secret(&self, side: Side) -> Option<Vec<u8>> {
        let server_random = self.server_random?;
        let mut context = Vec::with_capacity(RANDOM_LEN * 2);
        context.extend_from_slice(&self.client_random);
        context.extend_from_slice(&server_random);
        let label = match side {
            Side::Client => "quix ap client",
            Side::Server => "quix ap server",
        };
        Some(derive(&self.psk, label, &context, SECRET_LEN))
    }

    fn zero_rtt_secret(&self) -> Option<Vec<u8>> {
        let ticket = self.ticket_in.as_ref()?;
        let resumption = derive(&self.psk, "quix resume", ticket, SECRET_LEN);
        Some(derive(&resumption, "quix 0rtt", &self.client_random, SECRET_LEN))
    }

    fn finished_tag(&self, side: Side) -> Vec<u8> {
        let mut context = Vec::with_capacity(RANDOM_LEN * 2);
        context.extend_from_slice(&self.client_random);
        context.extend_from_slice(&self.server_random.unwrap_or([0; RANDOM_LEN]));
        let label = match side {
            Side::Client => "quix fin client",
            Side::Server => "quix fin server",
        };
        derive(&self.psk, label, &context, FINISHED_LEN)
    }

    fn push_msg(out: &mut Vec<u8>, ty: u8, body: &[u8]) {
        out.push(ty);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
    }

    /// Split one complete TLV off the inbound buffer.
    fn next_msg(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.inbound.len() < 3 {
            return None;
        }
        let ty = self.inbound[0];
        let len = u16::from_be_bytes([self.inbound[1], self.inbound[2]]) as usize;
        if self.inbound.len() < 3 + len {
            return None;
        }
        let body = self.inbound[3..3 + len].to_vec();
        self.inbound.drain(..3 + len);
        Some((ty, body))
    }

    fn on_client_hello(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        if self.side != Side::Server || body.len() < RANDOM_LEN + 2 {
            return Err(Error::Quic(QuicError::Crypto(ALERT_DECODE_ERROR)));
        }
        let mut buf = &body[..];
        let mut client_random = [0u8; RANDOM_LEN];
        buf.copy_to_slice(&mut client_random);
        self.client_random = client_random;

        let params_len = buf.get_u16() as usize;
        if buf.remaining() < params_len + 1 {
            return Err(Error::Quic(QuicError::Crypto(ALERT_DECODE_ERROR)));
        }
        self.peer_params = Some(Bytes::copy_from_slice(&buf[..params_len]));
        buf.advance(params_len);

        let has_ticket = buf.get_u8() != 0;
        if has_ticket {
            if buf.remaining() < TICKET_LEN {
                return Err(Error::Quic(QuicError::Crypto(ALERT_DECODE_ERROR)));
            }
            self.ticket_in = Some(Bytes::copy_from_slice(&buf[..TICKET_LEN]));
        }

        let mut server_random = [0u8; RANDOM_LEN];
        rand::thread_rng().fill_bytes(&mut server_random);
        self.server_random = Some(server_random);

        let mut hello = Vec::with_capacity(RANDOM_LEN + 2 + self.local_params.len());
        hello.extend_from_slice(&server_random);
        hello.extend_from_slice(&(self.local_params.len() as u16).to_be_bytes());
        hello.extend_from_slice(&self.local_params);

        let mut ticket = [0u8; TICKET_LEN];
        rand::thread_rng().fill_bytes(&mut ticket);

        let mut out = Vec::new();
        Self::push_msg(&mut out, MSG_SERVER_HELLO, &hello);
        Self::push_msg(&mut out, MSG_FINISHED, &self.finished_tag(Side::Server));
        Self::push_msg(&mut out, MSG_TICKET, &ticket);
        self.state = HandshakeState::Complete;
        Ok(out)
    }

    fn on_server_hello(&mut self, body: &[u8]) -> Result<()> {
        if self.side != Side::Client || body.len() < RANDOM_LEN + 2 {
            return Err(Error::Quic(QuicError::Crypto(ALERT_DECODE_ERROR)));
        }
        let mut buf = &body[..];
        let mut server_random = [0u8; RANDOM_LEN];
        buf.copy_to_slice(&mut server_random);
        self.server_random = Some(server_random);

        let params_len = buf.get_u16() as usize;
        if buf.remaining() < params_len {
            return Err(Error::Quic(QuicError::Crypto(ALERT_DECODE_ERROR)));
        }
        self.peer_params = Some(Bytes::copy_from_slice(&buf[..params_len]));
        Ok(())
    }

    fn on_finished(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let expected = self.finished_tag(self.side.peer());
        if body != expected {
            return Err(Error::Quic(QuicError::Crypto(ALERT_HANDSHAKE_FAILURE)));
        }
        match self.side {
            Side::Client => {
                // Answer with our own finished and complete.
                let mut out = Vec::new();
                Self::push_msg(&mut out, MSG_FINISHED, &self.finished_tag(Side::Client));
                self.state = HandshakeState::Complete;
                Ok(out)
            }
            Side::Server => Ok(Vec::new()),
        }
    }
}

impl TlsEngine for StaticTlsEngine {
    fn start(&mut self) -> Result<Vec<u8>> {
        if self.side != Side::Client || self.state != HandshakeState::Idle {
            return Ok(Vec::new());
        }
        let mut hello =
            Vec::with_capacity(RANDOM_LEN + 2 + self.local_params.len() + 1 + TICKET_LEN);
        hello.extend_from_slice(&self.client_random);
        hello.extend_from_slice(&(self.local_params.len() as u16).to_be_bytes());
        hello.extend_from_slice(&self.local_params);
        match &self.ticket_in {
            Some(ticket) => {
                hello.push(1);
                hello.extend_from_slice(&ticket[..TICKET_LEN.min(ticket.len())]);
            }
            None => hello.push(0),
        }

        let mut out = Vec::new();
        Self::push_msg(&mut out, MSG_CLIENT_HELLO, &hello);
        self.state = HandshakeState::HelloSent;
        Ok(out)
    }

    fn read_handshake(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.inbound.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some((ty, body)) = self.next_msg() {
            match ty {
                MSG_CLIENT_HELLO => out.extend(self.on_client_hello(&body)?),
                MSG_SERVER_HELLO => self.on_server_hello(&body)?,
                MSG_FINISHED => out.extend(self.on_finished(&body)?),
                MSG_TICKET => {
                    if self.side == Side::Client {
                        self.ticket_out = Some(Bytes::from(body));
                    }
                }
                _ => return Err(Error::Quic(QuicError::Crypto(ALERT_DECODE_ERROR))),
            }
        }
        Ok(out)
    }

    fn is_complete(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    fn epoch_secret(&self, epoch: Epoch, side: Side) -> Option<Vec<u8>> {
        match epoch {
            Epoch::Initial => None,
            Epoch::Handshake => {
                // Requires the client random: immediately for the client,
                // after the ClientHello for the server.
                if self.side == Side::Server && self.peer_params.is_none() {
                    return None;
                }
                Some(self.handshake_secret(side))
            }
            Epoch::ZeroRtt => self.zero_rtt_secret(),
            Epoch::OneRtt => self.one_rtt_secret(side),
        }
    }

    fn peer_transport_parameters(&self) -> Option<Bytes> {
        self.peer_params.clone()
    }

    fn session_ticket(&self) -> Option<Bytes> {
        self.ticket_out.clone()
    }

    fn set_session(&mut self, ticket: Bytes) {
        if ticket.len() >= TICKET_LEN {
            self.ticket_in = Some(ticket);
        }
    }

    fn has_early_secrets(&self) -> bool {
        self.ticket_in.is_some()
    }
}
