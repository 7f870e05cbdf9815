//! Server behaviour through the public API, with in-memory transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arachne_ws::frame::{self, Opcode};
use arachne_ws::{
    ConnectionId, ConnectionState, Dispatch, FrameError, MemoryTransport, Options, Server,
    UpgradeRequest,
};
use parking_lot::Mutex;

fn server() -> Server {
    Server::new(Options {
        do_warmup: false,
        ..Options::default()
    })
}

fn request(key: &str) -> UpgradeRequest {
    UpgradeRequest::new("GET", "/")
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Key", key)
}

fn client_text(text: &str) -> Vec<u8> {
    frame::encode_masked(Opcode::Text, text.as_bytes(), [0xde, 0xad, 0xbe, 0xef])
}

fn connect(server: &mut Server) -> (ConnectionId, MemoryTransport) {
    let peer = MemoryTransport::new();
    let conn = server
        .handle_upgrade(&request("x3JJHMbDL1EzLkh9GBhXDw=="), Box::new(peer.clone()), &[])
        .unwrap();
    peer.take_written();
    (conn.id().clone(), peer)
}

#[test]
fn test_round_trip_through_a_masking_client() {
    let mut server = server();
    server.on_connection(|conn| conn.on_message(|conn, text| conn.send(text).unwrap()));
    let (id, peer) = connect(&mut server);

    for len in [0usize, 1, 125, 126, 65535, 65536, 200_000] {
        let text: String = "abcdefghij".chars().cycle().take(len).collect();
        assert_eq!(server.handle_data(&id, &client_text(&text)), Dispatch::Message);

        let echoed = peer.take_written();
        let header = frame::header_len_for(len);
        assert_eq!(echoed.len(), header + len);
        assert_eq!(echoed[0], 0x81);
        let decoded = frame::decode(&echoed).unwrap();
        assert_eq!(decoded.into_text().unwrap(), text);
    }
}

#[test]
fn test_accept_key_for_second_rfc_vector() {
    let mut server = server();
    let peer = MemoryTransport::new();
    server
        .handle_upgrade(&request("x3JJHMbDL1EzLkh9GBhXDw=="), Box::new(peer.clone()), &[])
        .unwrap();
    let response = String::from_utf8(peer.written()).unwrap();
    assert!(response.contains("Sec-WebSocket-Accept: HSmrc0sMlYUkAGmm5OPpG2HaGWk=\r\n"));
    assert!(response.ends_with("\r\n\r\n"));
}

#[test]
fn test_broadcast_exclusion_with_three_peers() {
    let mut server = server();
    let (a, peer_a) = connect(&mut server);
    let (_, peer_b) = connect(&mut server);
    let (_, peer_c) = connect(&mut server);

    let conn_a = server.connections().get(&a).unwrap();
    assert_eq!(conn_a.broadcast("m", false), 0);
    assert_eq!(
        [peer_a.write_count(), peer_b.write_count(), peer_c.write_count()],
        [0, 1, 1]
    );

    assert_eq!(conn_a.broadcast("m", true), 0);
    assert_eq!(
        [peer_a.write_count(), peer_b.write_count(), peer_c.write_count()],
        [1, 2, 2]
    );
}

#[test]
fn test_broadcast_from_a_closed_peer_skips_it() {
    let mut server = server();
    let (a, peer_a) = connect(&mut server);
    let (_, peer_b) = connect(&mut server);
    let conn_a = server.connections().get(&a).unwrap();

    assert!(server.handle_close(&a));
    assert_eq!(conn_a.state(), ConnectionState::Closed);
    assert_eq!(conn_a.broadcast("after", true), 0);
    assert_eq!(peer_a.write_count(), 0);
    assert_eq!(peer_b.written(), frame::encode_text("after"));
}

#[test]
fn test_teardown_is_idempotent() {
    let mut server = server();
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    server.on_connection(move |conn| {
        let counter = counter.clone();
        conn.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    });
    let (id, _) = connect(&mut server);

    let close = frame::encode_masked(Opcode::Close, b"", [1, 1, 1, 1]);
    assert_eq!(server.handle_data(&id, &close), Dispatch::Closed);
    assert!(!server.handle_close(&id));
    assert_eq!(server.handle_data(&id, &close), Dispatch::Unknown);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(server.connections().len(), 0);
}

#[test]
fn test_truncated_frames_never_panic() {
    let full = client_text(&"q".repeat(300));
    for cut in 0..full.len() {
        let mut server = server();
        let (id, _) = connect(&mut server);
        match server.handle_data(&id, &full[..cut]) {
            Dispatch::Dropped(FrameError::Truncated { .. })
            | Dispatch::Dropped(FrameError::PayloadOutOfBounds { .. }) => {}
            other => panic!("cut at {cut}: unexpected {other:?}"),
        }
    }
}

#[test]
fn test_msb_length_is_a_protocol_error() {
    let mut server = server();
    let (id, _) = connect(&mut server);
    let mut bytes = vec![0x81, 0xFF];
    bytes.extend_from_slice(&[0x80, 0, 0, 0, 0, 0, 0, 1]);
    bytes.extend_from_slice(&[1, 2, 3, 4]);
    assert_eq!(
        server.handle_data(&id, &bytes),
        Dispatch::Dropped(FrameError::LengthMsbSet)
    );
}

#[test]
fn test_messages_arrive_in_order() {
    let mut server = server();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    server.on_connection(move |conn| {
        let sink = sink.clone();
        conn.on_message(move |_, text| sink.lock().push(text.to_string()));
    });
    let (id, _) = connect(&mut server);

    for i in 0..20 {
        server.handle_data(&id, &client_text(&i.to_string()));
    }
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_unknown_connection_is_reported() {
    let server = server();
    assert_eq!(
        server.handle_data(&ConnectionId::from("nobody"), &client_text("hi")),
        Dispatch::Unknown
    );
    assert!(!server.handle_close(&ConnectionId::from("nobody")));
}
