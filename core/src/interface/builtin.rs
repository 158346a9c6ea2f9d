// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The builtin meta-interface.
//!
//! Every container hosts the `hive` interface. It is never advertised via discovery; peers reach
//! it by endpoint. `hive.ping` doubles as the heartbeat subject.

use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::{
    container::ContainerHandle,
    events::Event,
    interface::{HandlerError, Interface, InterfaceBuilder, InterfaceError, MethodDescription, Request},
    logging,
};

pub(crate) const BUILTIN_INTERFACE_NAME: &str = "hive";

const DEFAULT_LOGLEVEL_PERIOD_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct PingBody {
    #[serde(default = "default_ping_payload")]
    payload: rmpv::Value,
}

fn default_ping_payload() -> rmpv::Value {
    rmpv::Value::Nil
}

#[derive(Debug, Serialize)]
struct StatusReply {
    endpoint: String,
    identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct InspectReply {
    methods: Vec<MethodDescription>,
}

#[derive(Debug, Deserialize)]
struct ChangeLoglevelBody {
    logger: String,
    loglevel: String,
    #[serde(default = "default_loglevel_period")]
    period: u64,
}

fn default_loglevel_period() -> u64 {
    DEFAULT_LOGLEVEL_PERIOD_SECS
}

pub(crate) fn builtin_interface(handle: ContainerHandle) -> Result<Interface, InterfaceError> {
    let status_handle = handle.clone();
    let inspect_handle = handle.clone();
    let metrics_handle = handle.clone();
    let event_handle = handle.clone();

    InterfaceBuilder::new(BUILTIN_INTERFACE_NAME)
        .builtin()
        .rpc("ping", &["payload"], "Respond with the request payload.", |req: Request| async move {
            let body: PingBody = req.body()?;
            Ok(body.payload)
        })
        .rpc("status", &[], "Report this container's endpoint and identity.", move |_req| {
            let handle = status_handle.clone();
            async move {
                Ok(StatusReply {
                    endpoint: handle.endpoint().to_string(),
                    identity: handle.identity().to_string(),
                    service_name: handle.service_name(),
                })
            }
        })
        .rpc(
            "inspect",
            &[],
            "Describe all available rpc methods of this container.",
            move |_req| {
                let handle = inspect_handle.clone();
                async move {
                    Ok(InspectReply {
                        methods: handle.interfaces().describe(),
                    })
                }
            },
        )
        .rpc("get_metrics", &[], "Return the current metrics snapshot.", move |_req| {
            let handle = metrics_handle.clone();
            async move {
                handle
                    .metrics()
                    .snapshot()
                    .map_err(|e| HandlerError::internal(e.to_string()))
            }
        })
        .rpc(
            "change_loglevel",
            &["logger", "loglevel", "period"],
            "Temporarily adjust the level of a named logger, reverting after `period` seconds.",
            |req: Request| async move {
                let body: ChangeLoglevelBody = req.body()?;
                let level = LevelFilter::from_str(&body.loglevel)
                    .map_err(|_| HandlerError::new("ValueError", format!("unknown log level '{}'", body.loglevel)))?;
                logging::set_temporary_level(&body.logger, level, Duration::from_secs(body.period));
                Ok(())
            },
        )
        .raises(&["ValueError"])
        .raw_rpc(
            "event",
            &["type", "body"],
            "Receive a relayed event and dispatch it to local subscriptions.",
            move |req: Request, channel| {
                let handle = event_handle.clone();
                async move {
                    let event: Event = req.body()?;
                    handle
                        .inject_event(event)
                        .await
                        .map_err(|e| HandlerError::internal(e.to_string()))?;
                    channel
                        .ack(false)
                        .await
                        .map_err(|e| HandlerError::internal(e.to_string()))?;
                    Ok(())
                }
            },
        )
        .build()
}
