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
    connection::ConnectionStatus,
    discovery::StaticRegistryHub,
    events::{BrokerEventSystem, MemoryBroker},
    rpc::RpcError,
    ServiceContainer,
};
use hive_shutdown::Shutdown;
use hive_test_utils::async_assert_eventually;
use semver::Version;

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

    async fn echo_server(&self) -> ServiceContainer {
        let mut server = self.container("echo").await;
        server
            .install(echo_interface(server.handle(), Version::new(1, 0, 0)))
            .unwrap();
        server.start(true).await.unwrap();
        server
    }

    async fn client(&self) -> ServiceContainer {
        let mut client = self.container("client").await;
        client.start(false).await.unwrap();
        client
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_roundtrip() {
    let net = TestNet::new();
    let mut server = net.echo_server().await;
    let mut client = net.client().await;

    let channel = client
        .handle()
        .send_request("echo", "echo.echo", &TextBody::new("hi"))
        .await
        .unwrap();
    let reply = channel.get(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.decode_body::<String>().unwrap(), "hi");
    // Replies to versioned interfaces carry the version header
    assert_eq!(reply.header("version"), Some("1.0.0"));
    // The channel removed itself from the table
    assert_eq!(client.handle().server().num_pending_requests(), 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_calls_and_error_mapping() {
    let net = TestNet::new();
    let mut server = net.echo_server().await;
    let mut client = net.client().await;

    let proxy = client.handle().proxy("echo");
    let echoed: String = proxy.call("echo", &TextBody::new("hello")).await.unwrap();
    assert_eq!(echoed, "hello");

    // Declared error kinds map to typed remote errors
    let err = proxy.call::<_, ()>("fail", &TextBody::new("x")).await.unwrap_err();
    match err {
        RpcError::Remote { kind, message } => {
            assert_eq!(kind, "ValidationError");
            assert_eq!(message, "text is not valid");
        },
        other => panic!("expected remote error, got {:?}", other),
    }

    // Undeclared handler errors surface as NACK and hit the error hook
    let reports = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reports);
    server.handle().error_hook().install(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let err = proxy.call::<_, ()>("boom", &()).await.unwrap_err();
    assert!(matches!(err, RpcError::Nack));
    assert_eq!(reports.load(Ordering::SeqCst), 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_interface_and_method_yield_nack() {
    let net = TestNet::new();
    let mut server = net.echo_server().await;
    let mut client = net.client().await;

    let channel = client
        .handle()
        .send_request("echo", "nosuch.method", &())
        .await
        .unwrap();
    assert!(matches!(
        channel.get(Duration::from_secs(2)).await,
        Err(RpcError::Nack)
    ));

    let channel = client
        .handle()
        .send_request("echo", "echo.nosuch", &())
        .await
        .unwrap();
    assert!(matches!(
        channel.get(Duration::from_secs(2)).await,
        Err(RpcError::Nack)
    ));

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_service_fails_at_lookup() {
    let net = TestNet::new();
    let mut server = net.echo_server().await;
    let mut client = net.client().await;

    let err = client
        .handle()
        .send_request("missing", "missing.run", &())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Lookup(_)));

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeouts_do_not_leak_channels() {
    let net = TestNet::new();
    let mut client = net.client().await;

    // A black-hole endpoint: nothing is listening there
    let blackhole = hive_test_utils::address::get_next_local_endpoint();
    let timeout = Duration::from_millis(300);

    let mut pending = Vec::new();
    for _ in 0..8 {
        let channel = client
            .handle()
            .send_request(&blackhole, "echo.echo", &TextBody::new("void"))
            .await
            .unwrap();
        pending.push(tokio::spawn(async move { channel.get(timeout).await }));
    }
    for task in pending {
        assert!(matches!(task.await.unwrap(), Err(RpcError::Timeout(_))));
    }
    // Property: after 2d the channel table is empty
    tokio::time::sleep(timeout).await;
    assert_eq!(client.handle().server().num_pending_requests(), 0);

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trace_id_propagates_through_nested_requests() {
    let net = TestNet::new();
    let mut server = net.echo_server().await;

    let mut relay = net.container("relay").await;
    let relay_handle = relay.handle();
    relay
        .install(
            hive_core::Interface::builder("relay")
                .rpc("chain", &[], "Call echo.trace and report both trace ids.", move |req| {
                    let handle = relay_handle.clone();
                    async move {
                        let own = req.trace_id().map(ToString::to_string);
                        let observed: Option<String> = handle
                            .proxy("echo")
                            .call("trace", &())
                            .await
                            .map_err(|e| hive_core::HandlerError::internal(e.to_string()))?;
                        Ok((own, observed))
                    }
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    relay.start(true).await.unwrap();

    let mut client = net.client().await;
    let (own, observed): (Option<String>, Option<String>) =
        client.handle().proxy("relay").call("chain", &()).await.unwrap();
    let own = own.expect("relay saw no trace id");
    let observed = observed.expect("echo saw no trace id");
    // The handler's outbound request carries the trace id of the request that invoked it
    assert_eq!(own, observed);

    client.stop().await;
    relay.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heartbeats_mark_peers_responsive() {
    let net = TestNet::new();
    let mut server = net.echo_server().await;
    let mut client = net.client().await;

    let proxy = client.handle().proxy("echo");
    let _: String = proxy.call("echo", &TextBody::new("warmup")).await.unwrap();

    let server_endpoint = server.endpoint().to_string();
    async_assert_eventually!(
        client
            .handle()
            .server()
            .connection(&server_endpoint)
            .map(|c| c.status()),
        expect = Some(ConnectionStatus::Responsive),
        max_attempts = 30,
        interval = Duration::from_millis(100)
    );

    let connection = client.handle().server().connection(&server_endpoint).unwrap();
    let stats = connection.stats();
    assert!(stats.heartbeats > 0);
    assert!(stats.phi.is_finite());

    // When the peer goes away the connection turns unresponsive
    server.stop().await;
    async_assert_eventually!(
        connection.status(),
        expect = ConnectionStatus::Unresponsive,
        max_attempts = 50,
        interval = Duration::from_millis(100)
    );

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn builtin_meta_interface() {
    let net = TestNet::new();
    let mut server = net.echo_server().await;
    let mut client = net.client().await;

    let proxy = client
        .handle()
        .proxy(&server.endpoint().to_string())
        .with_namespace("hive");

    #[derive(serde::Deserialize)]
    struct Status {
        endpoint: String,
        identity: String,
    }
    let status: Status = proxy.call("status", &()).await.unwrap();
    assert_eq!(status.endpoint, server.endpoint());
    assert_eq!(status.identity, server.identity());
    assert_eq!(status.identity.len(), 32);

    #[derive(serde::Deserialize)]
    struct Inspect {
        methods: Vec<Method>,
    }
    #[derive(serde::Deserialize)]
    struct Method {
        name: String,
        params: Vec<String>,
    }
    let inspect: Inspect = proxy.call("inspect", &()).await.unwrap();
    let echo = inspect.methods.iter().find(|m| m.name == "echo.echo").unwrap();
    assert_eq!(echo.params, vec!["text".to_string()]);
    assert!(inspect.methods.iter().any(|m| m.name == "hive.ping"));

    #[derive(serde::Deserialize)]
    struct Snapshot {
        text: String,
    }
    let snapshot: Snapshot = proxy.call("get_metrics", &()).await.unwrap();
    assert!(snapshot.text.contains("rpc_requests_total"));

    client.stop().await;
    server.stop().await;
}
