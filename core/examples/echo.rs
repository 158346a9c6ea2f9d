// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! A minimal echo service and a client calling it, wired through the static registry and the
//! in-process broker.
//!
//! ```text
//! cargo run --example echo
//! ```

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use hive_core::{
    config::ContainerConfig,
    discovery::StaticRegistryHub,
    events::{BrokerEventSystem, EventFlags, MemoryBroker},
    interface::Interface,
    ContainerHandle, HandlerError, Request, ServiceContainer,
};
use hive_shutdown::Shutdown;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct TextBody {
    text: String,
}

fn echo_interface(handle: ContainerHandle) -> Result<Interface, anyhow::Error> {
    let upper_handle = handle;
    Interface::builder("echo")
        .with_version(semver::Version::new(1, 0, 0))
        .rpc("echo", &["text"], "Echo the text back.", |req: Request| async move {
            let body: TextBody = req.body()?;
            Ok(body.text)
        })
        .rpc("upper", &["text"], "Uppercase the text and announce it.", move |req: Request| {
            let handle = upper_handle.clone();
            async move {
                let body: TextBody = req.body()?;
                let upper = body.text.to_uppercase();
                handle
                    .emit("uppercase_transform_finished", &TextBody { text: body.text })
                    .await
                    .map_err(|e| HandlerError::internal(e.to_string()))?;
                Ok(upper)
            }
        })
        .on_event(
            "on_uppercase",
            &["uppercase_transform_finished"],
            EventFlags::default(),
            |event| async move {
                let body: TextBody = event
                    .decode_body()
                    .map_err(|e| HandlerError::internal(e.to_string()))?;
                println!("event: uppercased {:?}", body.text);
                Ok(())
            },
        )
        .build()
        .context("failed to build echo interface")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let hub = StaticRegistryHub::new();
    let broker = MemoryBroker::new(16);
    let shutdown = Shutdown::new();

    // The service container
    let mut server = ServiceContainer::new(
        ContainerConfig {
            service_name: Some("echo".to_string()),
            ..Default::default()
        },
        Arc::new(hub.registry()),
        BrokerEventSystem::new(broker.clone(), Default::default(), shutdown.to_signal()),
    )
    .await?;
    server.install(echo_interface(server.handle())?)?;
    server.start(true).await?;
    println!("echo service listening on {}", server.endpoint());

    // The client container
    let mut client = ServiceContainer::new(
        ContainerConfig::default(),
        Arc::new(hub.registry()),
        BrokerEventSystem::new(broker, Default::default(), shutdown.to_signal()),
    )
    .await?;
    client.start(false).await?;

    let proxy = client.handle().proxy("echo");
    let echoed: String = proxy.call("echo", &TextBody { text: "hi".to_string() }).await?;
    println!("echo.echo(\"hi\") -> {:?}", echoed);

    let upper: String = proxy.call("upper", &TextBody { text: "foo".to_string() }).await?;
    println!("echo.upper(\"foo\") -> {:?}", upper);

    // Give the event a moment to arrive before shutting down
    tokio::time::sleep(Duration::from_millis(300)).await;

    client.stop().await;
    server.stop().await;
    Ok(())
}
