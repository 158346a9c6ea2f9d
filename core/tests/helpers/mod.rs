// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use hive_core::{
    config::{ConnectionConfig, ContainerConfig},
    discovery::ServiceRegistry,
    events::EventSystem,
    interface::Interface,
    ContainerHandle, HandlerError, Request, ServiceContainer,
};
use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBody {
    pub text: String,
}

impl TextBody {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

/// Container config with short timings suitable for tests.
pub fn test_config(service_name: &str) -> ContainerConfig {
    ContainerConfig {
        service_name: Some(service_name.to_string()),
        connection: ConnectionConfig {
            heartbeat_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(5),
            unresponsive_disconnect: None,
            idle_disconnect: None,
            ..Default::default()
        },
        request_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(1),
        metrics_interval: Duration::from_millis(500),
        ..Default::default()
    }
}

pub async fn spawn_container(
    service_name: &str,
    registry: Arc<dyn ServiceRegistry>,
    events: Arc<dyn EventSystem>,
) -> ServiceContainer {
    ServiceContainer::new(test_config(service_name), registry, events)
        .await
        .expect("failed to create container")
}

/// The echo test service: `echo`, `upper` (emits `uppercase_transform_finished`), `whoami`,
/// `trace`, plus failing methods with declared and undeclared errors.
pub fn echo_interface(handle: ContainerHandle, version: Version) -> Interface {
    let upper_handle = handle.clone();
    let whoami_handle = handle;
    Interface::builder("echo")
        .with_version(version)
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
        .rpc("whoami", &[], "Report the endpoint serving this request.", move |_req| {
            let handle = whoami_handle.clone();
            async move { Ok(handle.endpoint().to_string()) }
        })
        .rpc("trace", &[], "Report the observed trace id.", |req: Request| async move {
            Ok(req.trace_id().map(ToString::to_string))
        })
        .rpc("fail", &["text"], "Always fail with a declared error.", |_req| async move {
            Err::<(), _>(HandlerError::new("ValidationError", "text is not valid"))
        })
        .raises(&["ValidationError"])
        .rpc("boom", &[], "Always fail with an undeclared error.", |_req| async move {
            Err::<(), _>(HandlerError::internal("it broke"))
        })
        .build()
        .expect("failed to build echo interface")
}
