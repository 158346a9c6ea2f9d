// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

mod helpers;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use helpers::{echo_interface, spawn_container, TextBody};
use hive_core::{
    discovery::StaticRegistryHub,
    events::{BrokerEventSystem, EventFlags, MemoryBroker},
    HandlerError, Interface, ServiceContainer,
};
use hive_shutdown::Shutdown;
use hive_test_utils::async_assert_eventually;
use semver::Version;
use tokio::sync::mpsc;

fn subscriber_interface(
    name: &str,
    patterns: &[&str],
    flags: EventFlags,
    received: mpsc::UnboundedSender<TextBody>,
) -> Interface {
    Interface::builder(name)
        .on_event("on_event", patterns, flags, move |event| {
            let received = received.clone();
            async move {
                let body: TextBody = event
                    .decode_body()
                    .map_err(|e| HandlerError::internal(e.to_string()))?;
                let _ = received.send(body);
                Ok(())
            }
        })
        .build()
        .unwrap()
}

struct TestNet {
    hub: StaticRegistryHub,
    broker: MemoryBroker,
    shutdown: Shutdown,
}

impl TestNet {
    fn new() -> Self {
        Self {
            hub: StaticRegistryHub::new(),
            broker: MemoryBroker::new(16),
            shutdown: Shutdown::new(),
        }
    }

    async fn container(&self, name: &str) -> ServiceContainer {
        spawn_container(
            name,
            Arc::new(self.hub.registry()),
            BrokerEventSystem::new(self.broker.clone(), Default::default(), self.shutdown.to_signal()),
        )
        .await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upper_emits_event_to_subscriber() {
    let net = TestNet::new();

    let mut server = net.container("echo").await;
    server
        .install(echo_interface(server.handle(), Version::new(1, 0, 0)))
        .unwrap();
    server.start(true).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscriber = net.container("listener").await;
    subscriber
        .install(subscriber_interface(
            "listener",
            &["uppercase_transform_finished"],
            EventFlags::default(),
            tx,
        ))
        .unwrap();
    subscriber.start(true).await.unwrap();

    let mut client = net.container("client").await;
    client.start(false).await.unwrap();

    let upper: String = client
        .handle()
        .proxy("echo")
        .call("upper", &TextBody::new("foo"))
        .await
        .unwrap();
    assert_eq!(upper, "FOO");

    let event_body = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2s")
        .unwrap();
    assert_eq!(event_body, TextBody::new("foo"));

    client.stop().await;
    subscriber.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_queue_delivers_to_exactly_one_replica() {
    let net = TestNet::new();

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let mut replica_a = net.container("worker").await;
    replica_a
        .install(subscriber_interface("worker", &["job.*"], EventFlags::default(), tx_a))
        .unwrap();
    replica_a.start(false).await.unwrap();

    let mut replica_b = net.container("worker").await;
    replica_b
        .install(subscriber_interface("worker", &["job.*"], EventFlags::default(), tx_b))
        .unwrap();
    replica_b.start(false).await.unwrap();

    let mut emitter = net.container("emitter").await;
    emitter.start(false).await.unwrap();
    for i in 0..6 {
        emitter
            .handle()
            .emit("job.created", &TextBody::new(&format!("job-{}", i)))
            .await
            .unwrap();
    }

    let mut total = 0;
    for _ in 0..6 {
        tokio::select! {
            Some(_) = rx_a.recv() => total += 1,
            Some(_) = rx_b.recv() => total += 1,
            _ = tokio::time::sleep(Duration::from_secs(2)) => break,
        }
    }
    // Each event lands on exactly one replica of the shared subscription
    assert_eq!(total, 6);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());

    emitter.stop().await;
    replica_a.stop().await;
    replica_b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_reaches_every_replica() {
    let net = TestNet::new();

    let flags = EventFlags {
        broadcast: true,
        ..Default::default()
    };
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let mut replica_a = net.container("worker").await;
    replica_a
        .install(subscriber_interface("worker", &["announce"], flags, tx_a))
        .unwrap();
    replica_a.start(false).await.unwrap();

    let mut replica_b = net.container("worker").await;
    replica_b
        .install(subscriber_interface("worker", &["announce"], flags, tx_b))
        .unwrap();
    replica_b.start(false).await.unwrap();

    let mut emitter = net.container("emitter").await;
    emitter.start(false).await.unwrap();
    emitter.handle().emit("announce", &TextBody::new("all")).await.unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        let body = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("replica missed broadcast")
            .unwrap();
        assert_eq!(body, TextBody::new("all"));
    }

    emitter.stop().await;
    replica_a.stop().await;
    replica_b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn once_subscription_handles_a_single_event() {
    let net = TestNet::new();

    let count = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter = Arc::clone(&count);
    let forwarding = move |body: TextBody| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(body);
    };

    let mut subscriber = net.container("onesie").await;
    let interface = Interface::builder("onesie")
        .on_event(
            "on_first",
            &["tick"],
            EventFlags {
                once: true,
                sequential: true,
                ..Default::default()
            },
            move |event| {
                let forwarding = forwarding.clone();
                async move {
                    let body: TextBody = event
                        .decode_body()
                        .map_err(|e| HandlerError::internal(e.to_string()))?;
                    forwarding(body);
                    Ok(())
                }
            },
        )
        .build()
        .unwrap();
    subscriber.install(interface).unwrap();
    subscriber.start(false).await.unwrap();

    let mut emitter = net.container("emitter").await;
    emitter.start(false).await.unwrap();

    emitter.handle().emit("tick", &TextBody::new("first")).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, TextBody::new("first"));

    // Subsequent events are not delivered to a `once` subscription
    for _ in 0..3 {
        emitter.handle().emit("tick", &TextBody::new("again")).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    emitter.stop().await;
    subscriber.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delayed_emit_arrives_after_the_delay() {
    let net = TestNet::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscriber = net.container("waiter").await;
    subscriber
        .install(subscriber_interface("waiter", &["foo"], EventFlags::default(), tx))
        .unwrap();
    subscriber.start(false).await.unwrap();

    let mut emitter = net.container("emitter").await;
    emitter.start(false).await.unwrap();
    emitter
        .handle()
        .emit_delayed("foo", &TextBody::new("later"), Duration::from_millis(500))
        .await
        .unwrap();

    // Nothing within 0.2s...
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    // ...and exactly one delivery within 2s
    let body = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delayed event never arrived")
        .unwrap();
    assert_eq!(body, TextBody::new("later"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    emitter.stop().await;
    subscriber.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumers_recover_from_broker_failover() {
    let net = TestNet::new();

    let flags = EventFlags {
        broadcast: true,
        ..Default::default()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscriber = net.container("worker").await;
    subscriber
        .install(subscriber_interface("worker", &["announce"], flags, tx))
        .unwrap();
    subscriber.start(false).await.unwrap();

    let mut emitter = net.container("emitter").await;
    emitter.start(false).await.unwrap();
    emitter.handle().emit("announce", &TextBody::new("before")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();

    // The failover drops the broadcast queue; the consumer re-declares it on reconnect
    net.broker.simulate_failover();
    async_assert_eventually!(
        {
            emitter
                .handle()
                .emit("announce", &TextBody::new("after"))
                .await
                .unwrap();
            rx.try_recv().is_ok()
        },
        expect = true,
        max_attempts = 20,
        interval = Duration::from_millis(200)
    );

    emitter.stop().await;
    subscriber.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_backend_round_trip() {
    use hive_core::events::RelayEventSystem;

    let hub = hive_core::discovery::StaticRegistryHub::new();

    // The broker service: receives relayed emits over RPC
    let (broker_tx, mut broker_rx) = mpsc::unbounded_channel::<hive_core::Event>();
    let mut broker = spawn_container(
        "broker",
        Arc::new(hub.registry()),
        Arc::new(hive_core::events::LocalEventSystem::new()),
    )
    .await;
    let broker_interface = Interface::builder("broker")
        .raw_rpc(
            "broadcast",
            &["type", "body"],
            "Receive an event for fan-out.",
            move |req: hive_core::Request, channel| {
                let broker_tx = broker_tx.clone();
                async move {
                    let event: hive_core::Event = req.body()?;
                    let _ = broker_tx.send(event);
                    channel
                        .ack(false)
                        .await
                        .map_err(|e| HandlerError::internal(e.to_string()))?;
                    Ok(())
                }
            },
        )
        .build()
        .unwrap();
    broker.install(broker_interface).unwrap();
    broker.start(true).await.unwrap();

    // The emitting container relays emits to the broker service
    let (local_tx, mut local_rx) = mpsc::unbounded_channel();
    let mut emitter = spawn_container(
        "emitter",
        Arc::new(hub.registry()),
        Arc::new(RelayEventSystem::new("broker", Duration::from_secs(2))),
    )
    .await;
    emitter
        .install(subscriber_interface("emitter", &["fanout.*"], EventFlags::default(), local_tx))
        .unwrap();
    emitter.start(false).await.unwrap();

    emitter.handle().emit("fanout.test", &TextBody::new("relayed")).await.unwrap();
    let relayed = tokio::time::timeout(Duration::from_secs(2), broker_rx.recv())
        .await
        .expect("broker service never saw the emit")
        .unwrap();
    assert_eq!(relayed.event_type, "fanout.test");

    // The broker service pushes the event back through the `hive.event` builtin
    let channel = broker
        .handle()
        .send_request(emitter.endpoint(), "hive.event", &relayed)
        .await
        .unwrap();
    channel.get(Duration::from_secs(2)).await.unwrap();

    let body = tokio::time::timeout(Duration::from_secs(2), local_rx.recv())
        .await
        .expect("relayed event never reached the local dispatcher")
        .unwrap();
    assert_eq!(body, TextBody::new("relayed"));

    emitter.stop().await;
    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn event_carries_source_and_trace() {
    let net = TestNet::new();

    let (tx, mut rx) = mpsc::unbounded_channel::<hive_core::Event>();
    let mut subscriber = net.container("listener").await;
    let interface = Interface::builder("listener")
        .on_event("on_any", &["#"], EventFlags::default(), move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        })
        .build()
        .unwrap();
    subscriber.install(interface).unwrap();
    subscriber.start(false).await.unwrap();

    let mut emitter = net.container("emitter").await;
    emitter.start(false).await.unwrap();
    emitter.handle().emit("ping.sent", &TextBody::new("x")).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, "ping.sent");
    assert_eq!(event.source.as_deref(), Some(emitter.identity()));
    assert_eq!(event.trace_id().map(str::len), Some(32));

    emitter.stop().await;
    subscriber.stop().await;
}
