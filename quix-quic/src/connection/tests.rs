//! Connection-level scenario tests: two state machines wired back to
//! back through an in-memory "network".

#![cfg(test)]

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::*;
use crate::packet::{Header, PacketType};
use crate::stream::StreamId;
use crate::tls::{StaticTlsEngine, TlsEngine};
use crate::transport::TransportParameters;
use crate::version::{self, VERSION_DRAFT_12};
use crate::ConnectionId;

const PSK: &[u8] = b"connection scenario psk";

fn client_with(config: ConnectionConfig) -> Connection {
    let tls = StaticTlsEngine::client(PSK.to_vec(), config.local_params.encode());
    Connection::new_client(config, Box::new(tls)).unwrap()
}

fn server_with(config: ConnectionConfig) -> Connection {
    let tls = StaticTlsEngine::server(PSK.to_vec(), config.local_params.encode());
    Connection::new_server(config, Box::new(tls)).unwrap()
}

fn new_pair() -> (Connection, Connection) {
    (client_with(ConnectionConfig::default()), server_with(ConnectionConfig::default()))
}

fn transmit_all(conn: &mut Connection, now: Instant) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(datagram) = conn.poll_transmit(now) {
        out.push(datagram);
        assert!(out.len() < 64, "transmit loop runaway");
    }
    out
}

/// Exchange datagrams both ways until neither side has more to say.
fn exchange(client: &mut Connection, server: &mut Connection, now: Instant) {
    for _ in 0..16 {
        let mut progressed = false;
        for datagram in transmit_all(client, now) {
            server.handle_datagram(&datagram, now);
            progressed = true;
        }
        for datagram in transmit_all(server, now) {
            client.handle_datagram(&datagram, now);
            progressed = true;
        }
        if !progressed {
            return;
        }
    }
}

fn drain_events(conn: &mut Connection) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Some(event) = conn.poll_event() {
        events.push(event);
    }
    events
}

fn establish(now: Instant) -> (Connection, Connection) {
    let (mut client, mut server) = new_pair();
    exchange(&mut client, &mut server, now);
    assert!(client.is_established(), "client state {:?}", client.state());
    assert!(server.is_established(), "server state {:?}", server.state());
    drain_events(&mut client);
    drain_events(&mut server);
    (client, server)
}

// ======================================================================
// Handshake
// ======================================================================

#[test]
fn test_handshake_establishes_both_sides() {
    let now = Instant::now();
    let (mut client, mut server) = new_pair();
    exchange(&mut client, &mut server, now);

    assert!(client.is_established());
    assert!(server.is_established());
    assert!(drain_events(&mut client).contains(&ConnectionEvent::Connected));
    assert!(drain_events(&mut server).contains(&ConnectionEvent::Connected));
}

#[test]
fn test_client_initial_is_padded() {
    let now = Instant::now();
    let (mut client, _server) = new_pair();
    let first = client.poll_transmit(now).expect("first flight");
    assert!(first.len() >= crate::MIN_INITIAL_SIZE, "initial only {} bytes", first.len());
}

#[test]
fn test_client_locks_server_cid() {
    let now = Instant::now();
    let (client, server) = establish(now);
    assert_eq!(client.remote_cid(), server.local_cid());
    assert_eq!(server.remote_cid(), client.local_cid());
}

// ======================================================================
// Request / response streams
// ======================================================================

fn collect_stream_data(events: &[ConnectionEvent], id: StreamId) -> (Vec<u8>, bool) {
    let mut data = Vec::new();
    let mut fin = false;
    for event in events {
        match event {
            ConnectionEvent::StreamData { stream_id, data: chunk } if *stream_id == id => {
                data.extend_from_slice(chunk);
            }
            ConnectionEvent::StreamEnd { stream_id } if *stream_id == id => fin = true,
            _ => {}
        }
    }
    (data, fin)
}

#[test]
fn test_request_response_roundtrip() {
    let now = Instant::now();
    let (mut client, mut server) = establish(now);

    let id = client.open_stream(false).unwrap();
    assert_eq!(id, StreamId(4));
    client.stream_send(id, Bytes::from_static(b"GET /index.html\r\n"), true).unwrap();
    exchange(&mut client, &mut server, now);

    let events = drain_events(&mut server);
    assert!(events.contains(&ConnectionEvent::NewStream { stream_id: id }));
    let (request, fin) = collect_stream_data(&events, id);
    assert_eq!(request, b"GET /index.html\r\n");
    assert!(fin);

    server.stream_send(id, Bytes::from_static(b"<html>hello</html>"), true).unwrap();
    exchange(&mut client, &mut server, now);

    let events = drain_events(&mut client);
    let (response, fin) = collect_stream_data(&events, id);
    assert_eq!(response, b"<html>hello</html>");
    assert!(fin);
}

#[test]
fn test_large_transfer_spans_many_packets() {
    let now = Instant::now();
    let (mut client, mut server) = establish(now);

    let id = client.open_stream(false).unwrap();
    let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
    client.stream_send(id, Bytes::from(payload.clone()), true).unwrap();
    exchange(&mut client, &mut server, now);

    let events = drain_events(&mut server);
    let (received, fin) = collect_stream_data(&events, id);
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
    assert!(fin);
}

// ======================================================================
// Version negotiation (scenario: bogus version, then renegotiation)
// ======================================================================

#[test]
fn test_version_negotiation_flow() {
    let now = Instant::now();
    let mut config = ConnectionConfig::default();
    config.version = 0xdead_beef;
    let mut client = client_with(config);

    let first = client.poll_transmit(now).expect("first flight");
    let (header, _) = Header::parse(&first, 0).unwrap();
    assert_eq!(header.version, 0xdead_beef);

    // Server-side endpoint answers with Version Negotiation.
    let vn = version::negotiation_packet(
        header.scid.clone().unwrap(),
        header.dcid.clone(),
    )
    .unwrap();
    client.handle_datagram(&vn, now);
    assert_eq!(client.version(), VERSION_DRAFT_12);

    // The client re-sends its first flight under the chosen version.
    let resent = client.poll_transmit(now).expect("re-sent flight");
    let (header, _) = Header::parse(&resent, 0).unwrap();
    assert_eq!(header.ty, PacketType::Initial);
    assert_eq!(header.version, VERSION_DRAFT_12);
    assert!(resent.len() >= crate::MIN_INITIAL_SIZE);

    // A second Version Negotiation must be ignored for the lifetime of
    // the connection.
    let vn2 = version::negotiation_packet(
        header.scid.clone().unwrap(),
        header.dcid.clone(),
    )
    .unwrap();
    client.handle_datagram(&vn2, now);
    assert_eq!(client.version(), VERSION_DRAFT_12);
    assert!(client.state() < ConnectionState::Draining);

    // And the renegotiated connection still completes against a server.
    let mut server = server_with(ConnectionConfig::default());
    server.handle_datagram(&resent, now);
    exchange(&mut client, &mut server, now);
    assert!(client.is_established());
    assert!(server.is_established());
}

#[test]
fn test_version_negotiation_listing_our_version_is_ignored() {
    let now = Instant::now();
    let mut client = client_with(ConnectionConfig::default());
    let first = client.poll_transmit(now).expect("first flight");
    let (header, _) = Header::parse(&first, 0).unwrap();

    // The list contains the version we already chose: MUST be ignored.
    let vn = version::negotiation_packet(
        header.scid.clone().unwrap(),
        header.dcid.clone(),
    )
    .unwrap();
    client.handle_datagram(&vn, now);
    assert_eq!(client.version(), VERSION_DRAFT_12);
    assert_eq!(client.state(), ConnectionState::WaitingHandshake);
}

#[test]
fn test_version_negotiation_with_wrong_cids_ignored() {
    let now = Instant::now();
    let mut config = ConnectionConfig::default();
    config.version = 0xdead_beef;
    let mut client = client_with(config);
    let _ = client.poll_transmit(now).expect("first flight");

    let vn = version::negotiation_packet(
        ConnectionId::from_slice(&[9; 8]).unwrap(),
        ConnectionId::from_slice(&[7; 8]).unwrap(),
    )
    .unwrap();
    client.handle_datagram(&vn, now);
    assert_eq!(client.version(), 0xdead_beef);
}

// ======================================================================
// Retry (scenario: dst-CID rewrite, second Retry ignored)
// ======================================================================

#[test]
fn test_retry_flow() {
    let now = Instant::now();
    let mut client = client_with(ConnectionConfig::default());
    let mut config = ConnectionConfig::default();
    config.use_retry = true;
    let mut server = server_with(config);

    let original_dcid = client.remote_cid().clone();
    for datagram in transmit_all(&mut client, now) {
        server.handle_datagram(&datagram, now);
    }
    let retry = transmit_all(&mut server, now);
    assert_eq!(retry.len(), 1);
    let (header, _) = Header::parse(&retry[0], 0).unwrap();
    assert_eq!(header.ty, PacketType::Retry);

    client.handle_datagram(&retry[0], now);
    // dst-CID rewritten to the Retry's source ID, exactly once.
    assert_eq!(client.remote_cid(), server.local_cid());
    assert_ne!(client.remote_cid(), &original_dcid);

    // A second Retry carrying a different source ID is ignored.
    let mut second = Header::long(
        PacketType::Retry,
        VERSION_DRAFT_12,
        client.local_cid().clone(),
        ConnectionId::from_slice(&[0x42; 8]).unwrap(),
        0,
    );
    second.payload_len = Some(21);
    let mut raw = Vec::new();
    second.encode(&mut raw).unwrap();
    raw.extend_from_slice(&[0u8; 17]);
    client.handle_datagram(&raw, now);
    assert_eq!(client.remote_cid(), server.local_cid());

    // The handshake completes against the validated path.
    exchange(&mut client, &mut server, now);
    assert!(client.is_established());
    assert!(server.is_established());
}

// ======================================================================
// Connection-ID discipline
// ======================================================================

#[test]
fn test_mismatched_source_cid_dropped_connection_lives() {
    let now = Instant::now();
    let (mut client, mut server) = establish(now);

    // A Handshake packet whose source ID differs from the learned one is
    // dropped before decryption; the connection stays up.
    let mut forged = Header::long(
        PacketType::Handshake,
        VERSION_DRAFT_12,
        client.local_cid().clone(),
        ConnectionId::from_slice(&[0xEE; 8]).unwrap(),
        99,
    );
    forged.payload_len = Some(4 + 24);
    let mut raw = Vec::new();
    forged.encode(&mut raw).unwrap();
    raw.extend_from_slice(&[0xAB; 24]);
    client.handle_datagram(&raw, now);

    assert!(client.is_established());
    assert!(drain_events(&mut client).is_empty());

    // Still functional end to end.
    let id = client.open_stream(false).unwrap();
    client.stream_send(id, Bytes::from_static(b"ping"), true).unwrap();
    exchange(&mut client, &mut server, now);
    let (data, _) = collect_stream_data(&drain_events(&mut server), id);
    assert_eq!(data, b"ping");
}

// ======================================================================
// 0-RTT resumption
// ======================================================================

#[test]
fn test_zero_rtt_initial_request() {
    let now = Instant::now();
    let (mut first_client, _server) = establish(now);
    let ticket = first_client.session_ticket().expect("ticket issued");

    let config = ConnectionConfig::default();
    let cached_params = config.local_params.clone();
    let mut tls = StaticTlsEngine::client(PSK.to_vec(), config.local_params.encode());
    tls.set_session(ticket);
    let mut client = Connection::new_client(config, Box::new(tls)).unwrap();
    client.apply_session_params(&cached_params);

    // The resumed request goes out on stream 4 before the handshake
    // completes.
    let id = client.open_stream(false).unwrap();
    assert_eq!(id, StreamId(4));
    client.stream_send(id, Bytes::from_static(b"GET /early\r\n"), true).unwrap();

    let mut server = server_with(ConnectionConfig::default());
    let flight = transmit_all(&mut client, now);
    assert!(flight.len() >= 2, "expected initial + 0-RTT datagrams");
    for datagram in &flight {
        server.handle_datagram(datagram, now);
    }

    let events = drain_events(&mut server);
    assert!(events.contains(&ConnectionEvent::NewStream { stream_id: id }));
    let (request, fin) = collect_stream_data(&events, id);
    assert_eq!(request, b"GET /early\r\n");
    assert!(fin);

    exchange(&mut client, &mut server, now);
    assert!(client.is_established());
}

// ======================================================================
// Loss recovery
// ======================================================================

#[test]
fn test_lost_packet_retransmitted() {
    let t0 = Instant::now();
    let (mut client, mut server) = establish(t0);

    let id = client.open_stream(false).unwrap();
    client.stream_send(id, Bytes::from_static(b"lost then found"), true).unwrap();

    // The first transmission vanishes on the network.
    let lost = client.poll_transmit(t0).expect("datagram with stream data");
    assert!(!lost.is_empty());
    assert!(client.poll_transmit(t0).is_none());

    let mut now = t0;
    let mut delivered = Vec::new();
    let mut finished = false;
    for _ in 0..32 {
        if let Some(deadline) = client.next_timeout() {
            now = now.max(deadline);
            client.on_timeout(now);
        }
        exchange(&mut client, &mut server, now);
        for event in drain_events(&mut server) {
            match event {
                ConnectionEvent::StreamData { data, .. } => delivered.extend_from_slice(&data),
                ConnectionEvent::StreamEnd { .. } => finished = true,
                _ => {}
            }
        }
        if finished {
            break;
        }
    }
    assert_eq!(delivered, b"lost then found");
    assert!(finished);
}

// ======================================================================
// Close and draining
// ======================================================================

#[test]
fn test_close_drains_both_sides() {
    let now = Instant::now();
    let (mut client, mut server) = establish(now);

    client.close(now);
    assert_eq!(client.state(), ConnectionState::Draining);
    let events = drain_events(&mut client);
    assert!(events.contains(&ConnectionEvent::Draining));

    for datagram in transmit_all(&mut client, now) {
        server.handle_datagram(&datagram, now);
    }
    assert_eq!(server.state(), ConnectionState::Draining);
    let events = drain_events(&mut server);
    assert!(events.iter().any(|e| matches!(e, ConnectionEvent::Closed { .. })));

    // After 3 x PTO both reach Closed.
    let deadline = client.next_timeout().expect("drain deadline");
    client.on_timeout(deadline);
    assert_eq!(client.state(), ConnectionState::Closed);
    let deadline = server.next_timeout().expect("drain deadline");
    server.on_timeout(deadline);
    assert_eq!(server.state(), ConnectionState::Closed);

    // Nothing more to send in either direction.
    assert!(client.poll_transmit(deadline).is_none());
    assert!(server.poll_transmit(deadline).is_none());
}

#[test]
fn test_idle_timeout_closes() {
    let now = Instant::now();
    let (mut client, _server) = establish(now);
    client.on_timeout(now + Duration::from_secs(31));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(drain_events(&mut client)
        .iter()
        .any(|e| matches!(e, ConnectionEvent::Closed { .. })));
}

#[test]
fn test_draining_ignores_incoming() {
    let now = Instant::now();
    let (mut client, mut server) = establish(now);
    client.close(now);
    for datagram in transmit_all(&mut client, now) {
        server.handle_datagram(&datagram, now);
    }
    drain_events(&mut client);

    // Traffic arriving during the drain period produces nothing.
    let mut late = server.poll_transmit(now);
    while late.is_some() {
        late = server.poll_transmit(now);
    }
    let id_result = client.open_stream(false);
    assert!(id_result.is_ok(), "stream table survives close");
    assert!(client.poll_transmit(now).is_none());
    assert!(drain_events(&mut client).is_empty());
}
