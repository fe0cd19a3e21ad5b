//! Subscription bookkeeping as seen on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proclink::codec::DefaultCodec;
use proclink::events::LostReason;
use proclink::message::{
    EndpointLostMessage, EventRaisedMessage, EventRegistrationRequest, RemoteCallSuccessResponse,
    Wrap,
};
use proclink::protocol::{Frame, FrameReader};
use proclink::{Address, Connection, Message, WrappedMessage};
use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

async fn send(writer: &mut WriteHalf<DuplexStream>, message: Message) {
    let payload = message
        .wrap::<DefaultCodec>()
        .unwrap()
        .encode::<DefaultCodec>()
        .unwrap();
    writer
        .write_all(&Frame::Data(payload).to_bytes().unwrap())
        .await
        .unwrap();
}

/// Client connection plus a peer task that acks every registration and
/// reports it, and a writer for pushing notifications.
fn connect() -> (
    Connection,
    mpsc::UnboundedReceiver<EventRegistrationRequest>,
    mpsc::UnboundedSender<Message>,
) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (local_read, local_write) = tokio::io::split(local);
    let connection = Connection::builder().spawn(local_read, local_write);

    let (remote_read, mut remote_write) = tokio::io::split(remote);
    let (registrations_tx, registrations) = mpsc::unbounded_channel();
    let (push, mut outbox) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let mut reader = FrameReader::new(remote_read, 1 << 20);
        loop {
            tokio::select! {
                frame = reader.next_frame() => {
                    let Ok(Some(frame)) = frame else { break };
                    let Frame::Data(bytes) = frame else { continue };
                    let wrapped = WrappedMessage::decode::<DefaultCodec>(&bytes).unwrap();
                    if let Message::EventRegistration(request) = wrapped.open::<DefaultCodec>().unwrap() {
                        let ack = RemoteCallSuccessResponse::encode::<DefaultCodec, _>(request.call_id, &()).unwrap();
                        let _ = registrations_tx.send(request);
                        send(&mut remote_write, Message::Success(ack)).await;
                    }
                }
                Some(message) = outbox.recv() => send(&mut remote_write, message).await,
            }
        }
    });

    (connection, registrations, push)
}

fn address(text: &str) -> Address {
    Address::parse(text).unwrap()
}

#[tokio::test]
async fn test_only_first_add_and_last_remove_reach_the_wire() {
    let (connection, mut registrations, _push) = connect();
    let subscriptions = connection.subscriptions();
    let calc = address("/p/calc");

    let mut batch = subscriptions.batch();
    let first = batch.add(calc.clone(), "Tick", |_: &EventRaisedMessage| {});
    connection.change_subscriptions(batch).await.unwrap();
    let sent = registrations.recv().await.unwrap();
    assert_eq!(sent.added, vec!["Tick".to_string()]);
    assert!(sent.removed.is_empty());
    assert_eq!(sent.destination, Some(calc.clone()));

    let mut batch = subscriptions.batch();
    let second = batch.add(calc.clone(), "Tick", |_: &EventRaisedMessage| {});
    connection.change_subscriptions(batch).await.unwrap();

    let mut batch = subscriptions.batch();
    batch.remove(calc.clone(), "Tick", first);
    connection.change_subscriptions(batch).await.unwrap();
    assert_eq!(subscriptions.handler_count(&calc, "Tick"), 1);
    assert!(registrations.try_recv().is_err());

    let mut batch = subscriptions.batch();
    batch.remove(calc.clone(), "Tick", second);
    connection.change_subscriptions(batch).await.unwrap();
    let sent = registrations.recv().await.unwrap();
    assert!(sent.added.is_empty());
    assert_eq!(sent.removed, vec!["Tick".to_string()]);
    assert_eq!(subscriptions.handler_count(&calc, "Tick"), 0);
}

#[tokio::test]
async fn test_batch_groups_by_destination() {
    let (connection, mut registrations, _push) = connect();
    let mut batch = connection.subscriptions().batch();
    batch.add(address("/p/a"), "One", |_: &EventRaisedMessage| {});
    batch.add(address("/p/b"), "Two", |_: &EventRaisedMessage| {});
    batch.add(address("/p/a"), "Three", |_: &EventRaisedMessage| {});
    connection.change_subscriptions(batch).await.unwrap();

    let first = registrations.recv().await.unwrap();
    assert_eq!(first.destination, Some(address("/p/a")));
    assert_eq!(first.added, vec!["One".to_string(), "Three".to_string()]);
    let second = registrations.recv().await.unwrap();
    assert_eq!(second.destination, Some(address("/p/b")));
    assert_eq!(second.added, vec!["Two".to_string()]);
}

#[tokio::test]
async fn test_events_delivered_in_order() {
    let (connection, _registrations, push) = connect();
    let calc = address("/p/calc");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut batch = connection.subscriptions().batch();
    batch.add(calc.clone(), "Tick", move |event: &EventRaisedMessage| {
        let value: u32 = event.decode_args::<DefaultCodec, _>().unwrap();
        let _ = tx.send(value);
    });
    connection.change_subscriptions(batch).await.unwrap();

    for value in 0..5u32 {
        let event = EventRaisedMessage::encode::<DefaultCodec, _>(calc.clone(), "Tick", &value).unwrap();
        push.send(Message::EventRaised(event)).unwrap();
    }
    for expected in 0..5u32 {
        assert_eq!(rx.recv().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_process_loss_cascades_to_endpoints() {
    let (connection, _registrations, push) = connect();
    let subscriptions = connection.subscriptions();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let other_fired = Arc::new(AtomicUsize::new(0));

    for endpoint in ["/p/a", "/p/b"] {
        let tx = tx.clone();
        subscriptions.subscribe_endpoint_lost(&address(endpoint), move |notice| {
            let _ = tx.send(notice.clone());
        });
    }
    let counter = other_fired.clone();
    subscriptions.subscribe_endpoint_lost(&address("/q/c"), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    push.send(Message::EndpointLost(EndpointLostMessage {
        endpoint_address: address("/p"),
    }))
    .unwrap();

    let mut fired = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    fired.sort_by(|x, y| x.current_address.as_str().cmp(y.current_address.as_str()));
    assert_eq!(fired[0].current_address, address("/p/a"));
    assert_eq!(fired[1].current_address, address("/p/b"));
    for notice in &fired {
        assert_eq!(notice.original_address, address("/p"));
        assert_eq!(notice.reason, LostReason::RemoteEndpointLost);
    }

    // A repeated notice finds nothing left to fire.
    push.send(Message::EndpointLost(EndpointLostMessage {
        endpoint_address: address("/p"),
    }))
    .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(other_fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unsubscribed_lost_callback_does_not_fire() {
    let (connection, _registrations, push) = connect();
    let subscriptions = connection.subscriptions();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    let token = subscriptions.subscribe_endpoint_lost(&address("/p/a"), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(subscriptions.unsubscribe_endpoint_lost(&address("/p/a"), token));
    assert!(!subscriptions.unsubscribe_endpoint_lost(&address("/p/a"), token));

    push.send(Message::EndpointLost(EndpointLostMessage {
        endpoint_address: address("/p/a"),
    }))
    .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_keep_wire_in_step() {
    let (connection, mut registrations, _push) = connect();
    let calc = address("/p/calc");
    let events: Vec<String> = (0..40).map(|i| format!("E{i}")).collect();

    let mut tasks = Vec::new();
    for event in &events {
        let mut add = connection.subscriptions().batch();
        let token = add.add(calc.clone(), event.clone(), |_: &EventRaisedMessage| {});
        let mut remove = connection.subscriptions().batch();
        remove.remove(calc.clone(), event.clone(), token);

        let first = connection.clone();
        tasks.push(tokio::spawn(async move { first.change_subscriptions(add).await }));
        let second = connection.clone();
        tasks.push(tokio::spawn(async move { second.change_subscriptions(remove).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // The last registration seen by the peer must match what is held locally.
    let mut remote: HashMap<String, bool> = HashMap::new();
    while let Ok(request) = registrations.try_recv() {
        for name in request.added {
            remote.insert(name, true);
        }
        for name in request.removed {
            remote.insert(name, false);
        }
    }
    for event in &events {
        let local = connection.subscriptions().handler_count(&calc, event) > 0;
        assert_eq!(
            remote.get(event).copied().unwrap_or(false),
            local,
            "{event} out of step"
        );
    }
}
