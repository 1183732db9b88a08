use super::*;
use crate::info_hash::InfoHash;
use crate::picker::{Block, BlockRequest, PiecePicker};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("LE0001"));
}

#[test]
fn test_handshake_layout() {
    let info_hash = InfoHash([1u8; 20]);
    let peer_id = PeerId([2u8; 20]);

    let encoded = Handshake::new(info_hash, peer_id).encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], PROTOCOL);
    assert_eq!(&encoded[20..28], &[0u8; 8]);
    assert_eq!(&encoded[28..48], &[1u8; 20]);
    assert_eq!(&encoded[48..68], &[2u8; 20]);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, info_hash);
    assert_eq!(decoded.peer_id, peer_id);
}

#[test]
fn test_handshake_rejects_deviations() {
    let good = Handshake::new(InfoHash([0u8; 20]), PeerId([0u8; 20])).encode();

    let mut bad_len = BytesMut::from(&good[..]);
    bad_len[0] = 18;
    assert!(matches!(
        Handshake::decode(&bad_len),
        Err(PeerError::HandshakeFailed)
    ));

    let mut bad_pstr = BytesMut::from(&good[..]);
    bad_pstr[1] = b'b';
    assert!(matches!(
        Handshake::decode(&bad_pstr),
        Err(PeerError::HandshakeFailed)
    ));

    assert!(matches!(
        Handshake::decode(&good[..67]),
        Err(PeerError::HandshakeFailed)
    ));
}

#[test]
fn test_message_round_trip() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { index: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA0, 0x01])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 0,
            data: Bytes::from_static(b"block data"),
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Port(6881),
        Message::Unknown {
            id: 20,
            payload: Bytes::from_static(b"\x00ext"),
        },
    ];

    for message in messages {
        let decoded = Message::decode(message.encode()).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn test_request_exact_bytes() {
    let encoded = Message::Request {
        index: 1,
        begin: 2,
        length: 3,
    }
    .encode();
    assert_eq!(
        encoded.as_ref(),
        &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
    );
}

#[test]
fn test_zero_length_piece_round_trip() {
    let message = Message::Piece {
        index: 7,
        begin: 0,
        data: Bytes::new(),
    };
    let encoded = message.encode();
    assert_eq!(encoded.len(), 4 + 9);
    assert_eq!(Message::decode(encoded).unwrap(), message);
}

#[test]
fn test_decode_rejects_bad_payload_lengths() {
    // Have with a 2-byte payload.
    let frame = Bytes::from_static(&[0, 0, 0, 3, 4, 0, 0]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::Malformed(_))
    ));

    // Choke with a payload.
    let frame = Bytes::from_static(&[0, 0, 0, 2, 0, 9]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::Malformed(_))
    ));

    // Piece shorter than its header.
    let frame = Bytes::from_static(&[0, 0, 0, 5, 7, 0, 0, 0, 1]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::Malformed(_))
    ));

    // Prefix claims more bytes than the frame holds.
    let frame = Bytes::from_static(&[0, 0, 0, 9, 4, 0, 0, 0, 1]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::Malformed(_))
    ));
}

#[test]
fn test_bitfield_msb_first() {
    let bf = Bitfield::from_bytes(Bytes::from_static(&[0x80, 0x01]));
    assert!(bf.has(0));
    assert!(!bf.has(1));
    assert!(bf.has(15));
    assert!(!bf.has(16));
    assert_eq!(bf.count_ones(), 2);
}

#[test]
fn test_bitfield_grows_on_set() {
    let mut bf = Bitfield::new();
    assert!(!bf.has(100));
    bf.set(100);
    assert!(bf.has(100));
    assert!(!bf.has(99));
    assert_eq!(bf.as_bytes().len(), 13);
}

#[test]
fn test_request_queue_fifo_dedup() {
    let r1 = BlockRequest::new(0, 0, 16384);
    let r2 = BlockRequest::new(0, 16384, 16384);

    let mut queue = RequestQueue::new();
    assert!(queue.push_back(r1));
    assert!(queue.push_back(r2));
    assert!(!queue.push_back(r1));
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.pop_front(), Some(r1));
    assert!(!queue.contains(&r1));
    assert_eq!(queue.pop_front(), Some(r2));
    assert_eq!(queue.pop_front(), None);
}

#[test]
fn test_request_queue_remove() {
    let r1 = BlockRequest::new(0, 0, 100);
    let r2 = BlockRequest::new(1, 0, 100);

    let mut queue = RequestQueue::new();
    queue.push_back(r1);
    queue.push_back(r2);

    assert!(queue.remove(&r1));
    assert!(!queue.remove(&r1));
    assert_eq!(queue.drain().collect::<Vec<_>>(), vec![r2]);
    assert!(queue.is_empty());
}

// ---------------------------------------------------------------------
// Connection scenarios against a scripted remote peer.
// ---------------------------------------------------------------------

#[derive(Default)]
struct RecordingPicker {
    unpicked: Mutex<Vec<BlockRequest>>,
}

impl PiecePicker for RecordingPicker {
    fn pick(&self, _availability: &Bitfield) -> Option<BlockRequest> {
        None
    }

    fn complete(&self, _request: BlockRequest, _data: Bytes) {}

    fn unpick(&self, request: BlockRequest) {
        self.unpicked.lock().push(request);
    }
}

fn short_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_millis(200),
        unchoke_timeout: Duration::from_millis(200),
        keepalive_interval: Duration::from_secs(60),
        read_timeout: Duration::from_secs(60),
        write_timeout: Duration::from_secs(5),
    }
}

/// Spawns a remote peer that accepts one connection, answers the
/// handshake for `info_hash`, and then runs `script` on the raw stream.
/// Await the handle at the end of a test to surface script assertions.
async fn spawn_peer<F, Fut>(info_hash: InfoHash, script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await.unwrap();
        let theirs = Handshake::decode(&buf).unwrap();
        assert_eq!(theirs.info_hash, info_hash);

        let reply = Handshake::new(info_hash, PeerId([9u8; 20]));
        stream.write_all(&reply.encode()).await.unwrap();

        script(stream).await;
    });
    (addr, handle)
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.unwrap();
    let length = u32::from_be_bytes(prefix) as usize;
    let mut frame = BytesMut::with_capacity(4 + length);
    frame.extend_from_slice(&prefix);
    frame.resize(4 + length, 0);
    stream.read_exact(&mut frame[4..]).await.unwrap();
    Message::decode(frame.freeze()).unwrap()
}

async fn send_message(stream: &mut TcpStream, message: &Message) {
    stream.write_all(&message.encode()).await.unwrap();
}

async fn expect_disconnect(
    events: &mut tokio::sync::mpsc::Receiver<PeerEvent>,
) -> PeerError {
    loop {
        match events.recv().await.expect("event stream ended early") {
            PeerEvent::Disconnected { reason } => return reason,
            PeerEvent::Downloaded { .. } => continue,
        }
    }
}

#[tokio::test]
async fn test_connect_handshake_success() {
    let info_hash = InfoHash([7u8; 20]);
    let (addr, peer) = spawn_peer(info_hash, |_stream| async {}).await;

    let conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();

    assert_eq!(conn.peer_id(), PeerId([9u8; 20]));
    assert_eq!(conn.addr(), addr);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_connect_rejects_info_hash_mismatch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await.unwrap();
        // Answer from a different swarm.
        let reply = Handshake::new(InfoHash([0xFF; 20]), PeerId([9u8; 20]));
        stream.write_all(&reply.encode()).await.unwrap();
    });

    let result = PeerConnection::connect(
        addr,
        InfoHash([7u8; 20]),
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await;
    assert!(matches!(result, Err(PeerError::HandshakeFailed)));
}

#[tokio::test]
async fn test_connect_rejects_garbage_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&[0xAB; HANDSHAKE_LEN]).await.unwrap();
    });

    let result = PeerConnection::connect(
        addr,
        InfoHash([7u8; 20]),
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await;
    assert!(matches!(result, Err(PeerError::HandshakeFailed)));
}

#[tokio::test]
async fn test_unchoke_promotes_queued_request() {
    let info_hash = InfoHash([7u8; 20]);
    let r1 = BlockRequest::new(0, 0, 16384);

    let (addr, peer) = spawn_peer(info_hash, move |mut stream| async move {
        // Interest is declared as soon as the download is queued.
        assert_eq!(read_message(&mut stream).await, Message::Interested);
        send_message(&mut stream, &Message::Unchoke).await;
        assert_eq!(
            read_message(&mut stream).await,
            Message::Request {
                index: 0,
                begin: 0,
                length: 16384,
            }
        );
    })
    .await;

    let conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();

    conn.download(r1).await.unwrap();
    peer.await.unwrap();
}

#[tokio::test]
async fn test_piece_completes_request() {
    let info_hash = InfoHash([7u8; 20]);
    let r1 = BlockRequest::new(2, 100, 5);

    let (addr, peer) = spawn_peer(info_hash, move |mut stream| async move {
        assert_eq!(read_message(&mut stream).await, Message::Interested);
        send_message(&mut stream, &Message::Unchoke).await;
        assert_eq!(
            read_message(&mut stream).await,
            Message::Request {
                index: 2,
                begin: 100,
                length: 5,
            }
        );
        send_message(
            &mut stream,
            &Message::Piece {
                index: 2,
                begin: 100,
                data: Bytes::from_static(b"hello"),
            },
        )
        .await;
    })
    .await;

    let mut conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    conn.download(r1).await.unwrap();
    match events.recv().await.unwrap() {
        PeerEvent::Downloaded { request, data } => {
            assert_eq!(request, r1);
            assert_eq!(data.as_ref(), b"hello");
            // A block built from the event answers the same request.
            assert_eq!(Block::new(2, 100, data).request(), r1);
        }
        other => panic!("expected Downloaded, got {:?}", other),
    }
    peer.await.unwrap();
}

#[tokio::test]
async fn test_downloads_transmit_in_insertion_order() {
    let info_hash = InfoHash([7u8; 20]);
    let r1 = BlockRequest::new(0, 0, 3);
    let r2 = BlockRequest::new(0, 3, 3);

    let (addr, peer) = spawn_peer(info_hash, move |mut stream| async move {
        assert_eq!(read_message(&mut stream).await, Message::Interested);
        send_message(&mut stream, &Message::Unchoke).await;

        // Only the queue head goes on the wire; the next request follows
        // its predecessor's piece.
        assert_eq!(
            read_message(&mut stream).await,
            Message::Request {
                index: 0,
                begin: 0,
                length: 3,
            }
        );
        send_message(
            &mut stream,
            &Message::Piece {
                index: 0,
                begin: 0,
                data: Bytes::from_static(b"aaa"),
            },
        )
        .await;
        assert_eq!(
            read_message(&mut stream).await,
            Message::Request {
                index: 0,
                begin: 3,
                length: 3,
            }
        );
        send_message(
            &mut stream,
            &Message::Piece {
                index: 0,
                begin: 3,
                data: Bytes::from_static(b"bbb"),
            },
        )
        .await;
    })
    .await;

    let mut conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    conn.download(r1).await.unwrap();
    conn.download(r2).await.unwrap();

    for expected in [r1, r2] {
        match events.recv().await.unwrap() {
            PeerEvent::Downloaded { request, .. } => assert_eq!(request, expected),
            other => panic!("expected Downloaded, got {:?}", other),
        }
    }
    peer.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_download_is_noop() {
    let info_hash = InfoHash([7u8; 20]);
    let r1 = BlockRequest::new(1, 0, 4);

    let (addr, peer) = spawn_peer(info_hash, move |mut stream| async move {
        assert_eq!(read_message(&mut stream).await, Message::Interested);
        send_message(&mut stream, &Message::Unchoke).await;
        assert_eq!(
            read_message(&mut stream).await,
            Message::Request {
                index: 1,
                begin: 0,
                length: 4,
            }
        );
        send_message(
            &mut stream,
            &Message::Piece {
                index: 1,
                begin: 0,
                data: Bytes::from_static(b"data"),
            },
        )
        .await;

        // No second Request frame may follow.
        let extra = tokio::time::timeout(Duration::from_millis(300), async {
            read_message(&mut stream).await
        })
        .await;
        assert!(extra.is_err(), "duplicate download reached the wire");
    })
    .await;

    let mut conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    conn.download(r1).await.unwrap();
    conn.download(r1).await.unwrap();

    match events.recv().await.unwrap() {
        PeerEvent::Downloaded { request, .. } => assert_eq!(request, r1),
        other => panic!("expected Downloaded, got {:?}", other),
    }
    peer.await.unwrap();
}

#[tokio::test]
async fn test_unexpected_piece_fails_connection() {
    let info_hash = InfoHash([7u8; 20]);

    let (addr, peer) = spawn_peer(info_hash, |mut stream| async move {
        send_message(
            &mut stream,
            &Message::Piece {
                index: 5,
                begin: 0,
                data: Bytes::from_static(b"unsolicited"),
            },
        )
        .await;
    })
    .await;

    let mut conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    let reason = expect_disconnect(&mut events).await;
    assert!(matches!(
        reason,
        PeerError::UnexpectedPiece { index: 5, begin: 0, .. }
    ));
    peer.await.unwrap();
}

#[tokio::test]
async fn test_request_timeout_fails_connection() {
    let info_hash = InfoHash([7u8; 20]);
    let r1 = BlockRequest::new(0, 0, 16384);
    let picker = Arc::new(RecordingPicker::default());

    let (addr, peer) = spawn_peer(info_hash, |mut stream| async move {
        assert_eq!(read_message(&mut stream).await, Message::Interested);
        send_message(&mut stream, &Message::Unchoke).await;
        assert!(matches!(
            read_message(&mut stream).await,
            Message::Request { .. }
        ));
        // Swallow the request and go silent, keeping the socket open so
        // the request check fires before EOF does.
        tokio::time::sleep(Duration::from_millis(600)).await;
    })
    .await;

    let mut conn = PeerConnection::connect_with(
        addr,
        info_hash,
        PeerId::generate(),
        picker.clone(),
        short_config(),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    conn.download(r1).await.unwrap();
    let reason = expect_disconnect(&mut events).await;
    assert!(matches!(reason, PeerError::PeerDoesNotRespond));
    assert_eq!(picker.unpicked.lock().as_slice(), &[r1]);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_unchoke_timeout_fails_connection() {
    let info_hash = InfoHash([7u8; 20]);
    let r1 = BlockRequest::new(0, 0, 16384);
    let picker = Arc::new(RecordingPicker::default());

    let (addr, peer) = spawn_peer(info_hash, |mut stream| async move {
        assert_eq!(read_message(&mut stream).await, Message::Interested);
        // Never unchoke, but hold the socket open past the deadline.
        tokio::time::sleep(Duration::from_millis(600)).await;
    })
    .await;

    let mut conn = PeerConnection::connect_with(
        addr,
        info_hash,
        PeerId::generate(),
        picker.clone(),
        short_config(),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    conn.download(r1).await.unwrap();
    let reason = expect_disconnect(&mut events).await;
    assert!(matches!(reason, PeerError::UnchokeTimeout));
    assert_eq!(picker.unpicked.lock().as_slice(), &[r1]);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_keepalive_sent_when_idle() {
    let info_hash = InfoHash([7u8; 20]);

    let (addr, peer) = spawn_peer(info_hash, |mut stream| async move {
        assert_eq!(read_message(&mut stream).await, Message::KeepAlive);
    })
    .await;

    let config = ConnectionConfig {
        keepalive_interval: Duration::from_millis(100),
        ..ConnectionConfig::default()
    };
    let _conn = PeerConnection::connect_with(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
        config,
    )
    .await
    .unwrap();

    peer.await.unwrap();
}

#[tokio::test]
async fn test_unknown_message_is_ignored() {
    let info_hash = InfoHash([7u8; 20]);
    let r1 = BlockRequest::new(0, 0, 2);

    let (addr, peer) = spawn_peer(info_hash, move |mut stream| async move {
        send_message(
            &mut stream,
            &Message::Unknown {
                id: 20,
                payload: Bytes::from_static(b"\x00d1:v4:teste"),
            },
        )
        .await;
        send_message(&mut stream, &Message::Bitfield(Bytes::from_static(&[0x80]))).await;
        send_message(&mut stream, &Message::Have { index: 1 }).await;

        assert_eq!(read_message(&mut stream).await, Message::Interested);
        send_message(&mut stream, &Message::Unchoke).await;
        assert!(matches!(
            read_message(&mut stream).await,
            Message::Request { .. }
        ));
        send_message(
            &mut stream,
            &Message::Piece {
                index: 0,
                begin: 0,
                data: Bytes::from_static(b"ok"),
            },
        )
        .await;
    })
    .await;

    let mut conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    conn.download(r1).await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        PeerEvent::Downloaded { .. }
    ));
    peer.await.unwrap();
}

#[tokio::test]
async fn test_malformed_message_fails_connection() {
    let info_hash = InfoHash([7u8; 20]);

    let (addr, peer) = spawn_peer(info_hash, |mut stream| async move {
        // Have must carry exactly four payload bytes.
        stream.write_all(&[0, 0, 0, 3, 4, 0, 0]).await.unwrap();
    })
    .await;

    let mut conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    let reason = expect_disconnect(&mut events).await;
    assert!(matches!(reason, PeerError::Malformed(_)));
    peer.await.unwrap();
}

#[tokio::test]
async fn test_remote_close_disconnects() {
    let info_hash = InfoHash([7u8; 20]);
    let (addr, peer) = spawn_peer(info_hash, |stream| async move {
        drop(stream);
    })
    .await;

    let mut conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        Arc::new(RecordingPicker::default()),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    let reason = expect_disconnect(&mut events).await;
    assert!(matches!(reason, PeerError::ConnectionClosed));
    peer.await.unwrap();
}

#[tokio::test]
async fn test_close_relinquishes_queued_requests() {
    let info_hash = InfoHash([7u8; 20]);
    let r1 = BlockRequest::new(4, 0, 64);
    let picker = Arc::new(RecordingPicker::default());

    let (addr, peer) = spawn_peer(info_hash, |mut stream| async move {
        assert_eq!(read_message(&mut stream).await, Message::Interested);
        // Keep the peer choked; the request never leaves the queue.
    })
    .await;

    let mut conn = PeerConnection::connect(
        addr,
        info_hash,
        PeerId::generate(),
        picker.clone(),
    )
    .await
    .unwrap();
    let mut events = conn.events().unwrap();

    // Declaring interest twice sends a single Interested frame; the
    // later download must not repeat it either.
    conn.interested().await.unwrap();
    conn.interested().await.unwrap();
    conn.download(r1).await.unwrap();
    conn.close().await;

    assert_eq!(picker.unpicked.lock().as_slice(), &[r1]);
    let reason = expect_disconnect(&mut events).await;
    assert!(matches!(reason, PeerError::ConnectionClosed));
    peer.await.unwrap();
}
