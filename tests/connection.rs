//! Connection behaviour against a scripted peer speaking raw frames.

use std::time::Duration;

use proclink::codec::DefaultCodec;
use proclink::message::{
    Arguments, MessageKind, RemoteCallCancelledResponse, RemoteCallRequest,
    RemoteCallSuccessResponse, Wrap,
};
use proclink::protocol::{ControlCode, Frame, FrameReader};
use proclink::{Address, Connection, ConnectionConfig, Message, RpcError, WrappedMessage};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

struct Peer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    async fn next_frame(&mut self) -> Frame {
        self.reader.next_frame().await.unwrap().unwrap()
    }

    async fn next_message(&mut self) -> WrappedMessage {
        loop {
            if let Frame::Data(bytes) = self.next_frame().await {
                return WrappedMessage::decode::<DefaultCodec>(&bytes).unwrap();
            }
        }
    }

    async fn send(&mut self, message: Message) {
        let payload = message
            .wrap::<DefaultCodec>()
            .unwrap()
            .encode::<DefaultCodec>()
            .unwrap();
        self.writer
            .write_all(&Frame::Data(payload).to_bytes().unwrap())
            .await
            .unwrap();
    }
}

fn connect(config: ConnectionConfig) -> (Connection, Peer) {
    let (local, remote) = duplex(256 * 1024);
    let (local_read, local_write) = tokio::io::split(local);
    let connection = Connection::builder()
        .config(config)
        .spawn(local_read, local_write);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let peer = Peer {
        reader: FrameReader::new(remote_read, 1 << 20),
        writer: remote_write,
    };
    (connection, peer)
}

fn add_request(a: i64, b: i64) -> RemoteCallRequest {
    let mut arguments = Arguments::default();
    arguments.push::<DefaultCodec, _>(&a).unwrap();
    arguments.push::<DefaultCodec, _>(&b).unwrap();
    RemoteCallRequest::new(Address::parse("/worker/calc").unwrap(), "Add", arguments)
}

#[tokio::test]
async fn test_concurrent_calls_answered_out_of_order() {
    let (connection, mut peer) = connect(ConnectionConfig::default());

    let mut calls = Vec::new();
    for i in 0..8i64 {
        let connection = connection.clone();
        calls.push(tokio::spawn(async move {
            connection
                .call::<i64>(add_request(i, 100), CancellationToken::new())
                .await
        }));
    }

    let mut received = Vec::new();
    for _ in 0..8 {
        let wrapped = peer.next_message().await;
        let Message::CallRequest(request) = wrapped.open::<DefaultCodec>().unwrap() else {
            panic!("expected a call request");
        };
        let a: i64 = request.arguments.get::<DefaultCodec, _>(0).unwrap();
        let b: i64 = request.arguments.get::<DefaultCodec, _>(1).unwrap();
        received.push((request.call_id, a + b));
    }
    assert_eq!(connection.pending_calls(), 8);

    for (call_id, sum) in received.into_iter().rev() {
        let reply = RemoteCallSuccessResponse::encode::<DefaultCodec, _>(call_id, &sum).unwrap();
        peer.send(Message::Success(reply)).await;
    }

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), i as i64 + 100);
    }
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_cancellation_forwarded_once() {
    let (connection, mut peer) = connect(ConnectionConfig::default());
    let token = CancellationToken::new();

    let call = tokio::spawn({
        let connection = connection.clone();
        let token = token.clone();
        async move {
            connection
                .send_request(Message::CallRequest(add_request(1, 2)), token)
                .await
        }
    });

    let request = peer.next_message().await;
    token.cancel();
    token.cancel();

    let cancel = peer.next_message().await;
    assert_eq!(cancel.kind, MessageKind::Cancellation);
    assert_eq!(cancel.call_id, request.call_id);
    assert_eq!(cancel.destination, request.destination);

    peer.send(Message::Cancelled(RemoteCallCancelledResponse {
        call_id: request.call_id,
    }))
    .await;
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::Cancelled));

    // The next frame on the wire is a new request, not a second cancellation.
    let follow_up = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call::<i64>(add_request(0, 0), CancellationToken::new())
                .await
        }
    });
    let next = peer.next_message().await;
    assert_eq!(next.kind, MessageKind::CallRequest);
    follow_up.abort();
}

#[tokio::test]
async fn test_non_cancellable_call_ignores_token() {
    let (connection, mut peer) = connect(ConnectionConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let call = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call::<i64>(add_request(2, 2).cancellable(false), token)
                .await
        }
    });

    let request = peer.next_message().await;
    let reply = RemoteCallSuccessResponse::encode::<DefaultCodec, _>(request.call_id, &4i64).unwrap();
    peer.send(Message::Success(reply)).await;

    assert_eq!(call.await.unwrap().unwrap(), 4);

    let follow_up = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call::<i64>(add_request(0, 0), CancellationToken::new())
                .await
        }
    });
    assert_eq!(peer.next_message().await.kind, MessageKind::CallRequest);
    follow_up.abort();
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_resolves_silent_cancellation() {
    let config = ConnectionConfig::default().cancel_grace_period(Some(Duration::from_millis(200)));
    let (connection, mut peer) = connect(config);
    let token = CancellationToken::new();

    let call = tokio::spawn({
        let connection = connection.clone();
        let token = token.clone();
        async move {
            connection
                .send_request(Message::CallRequest(add_request(1, 1)), token)
                .await
        }
    });

    peer.next_message().await;
    token.cancel();
    let cancel = peer.next_message().await;
    assert_eq!(cancel.kind, MessageKind::Cancellation);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::Cancelled));
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_forwards_cancellation() {
    let (connection, mut peer) = connect(ConnectionConfig::default());
    let request = add_request(5, 5).with_timeout(Duration::from_millis(50));
    assert!(request.absolute_timeout.is_some());

    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call::<i64>(request, CancellationToken::new()).await }
    });

    let sent = peer.next_message().await;
    let cancel = peer.next_message().await;
    assert_eq!(cancel.kind, MessageKind::Cancellation);
    assert_eq!(cancel.call_id, sent.call_id);

    peer.send(Message::Cancelled(RemoteCallCancelledResponse {
        call_id: sent.call_id,
    }))
    .await;
    assert!(matches!(call.await.unwrap(), Err(RpcError::Cancelled)));
}

#[tokio::test]
async fn test_pending_limit_refuses_new_calls() {
    let config = ConnectionConfig::default().max_pending_calls(1);
    let (connection, mut peer) = connect(config);

    let first = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call::<i64>(add_request(1, 1), CancellationToken::new())
                .await
        }
    });
    peer.next_message().await;

    let err = connection
        .call::<i64>(add_request(2, 2), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)));

    connection.close().await;
    assert!(first.await.unwrap().unwrap_err().is_connection_lost());
}

#[tokio::test]
async fn test_close_fails_pending_with_connection_closed() {
    let (connection, mut peer) = connect(ConnectionConfig::default());
    let call = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call::<i64>(add_request(1, 1), CancellationToken::new())
                .await
        }
    });
    peer.next_message().await;

    connection.close().await;
    match call.await.unwrap().unwrap_err() {
        RpcError::ConnectionLost(cause) => assert!(matches!(*cause, RpcError::ConnectionClosed)),
        other => panic!("unexpected {other:?}"),
    }

    let err = connection
        .send_one_way(Message::Cancelled(RemoteCallCancelledResponse { call_id: 1 }))
        .await
        .unwrap_err();
    assert!(err.is_connection_lost());
}

#[tokio::test]
async fn test_response_for_unknown_call_is_ignored() {
    let (connection, mut peer) = connect(ConnectionConfig::default());
    let stray = RemoteCallSuccessResponse::encode::<DefaultCodec, _>(999, &1i64).unwrap();
    peer.send(Message::Success(stray)).await;

    let call = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call::<i64>(add_request(3, 4), CancellationToken::new())
                .await
        }
    });
    let request = peer.next_message().await;
    let reply = RemoteCallSuccessResponse::encode::<DefaultCodec, _>(request.call_id, &7i64).unwrap();
    peer.send(Message::Success(reply)).await;

    assert_eq!(call.await.unwrap().unwrap(), 7);
    assert!(!connection.is_lost());
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_sends_keep_alive() {
    let config = ConnectionConfig::default().keep_alive_interval(Some(Duration::from_secs(1)));
    let (_connection, mut peer) = connect(config);

    let frame = peer.next_frame().await;
    assert!(matches!(frame, Frame::Code(ControlCode::KeepAlive)));
}

#[tokio::test]
async fn test_oversized_frame_fails_connection() {
    let config = ConnectionConfig::default().max_frame_size(16);
    let (connection, mut peer) = connect(config);
    peer.writer
        .write_all(&Frame::Data(bytes::Bytes::from(vec![0u8; 64])).to_bytes().unwrap())
        .await
        .unwrap();

    let cause = connection.lost().await;
    assert!(matches!(*cause, RpcError::FrameTooLarge { .. }));
}
