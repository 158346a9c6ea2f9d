// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Application interfaces.
//!
//! An interface is a named bundle of RPC methods and event-handler bindings, registered as plain
//! data: a table from method name to a typed handler descriptor. Parameter binding decodes the
//! request body map into the handler's argument struct; a body that does not bind (including
//! unknown keys on a `deny_unknown_fields` struct) fails the handler and yields a NACK.

pub(crate) mod builtin;
mod proxy;

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, RwLock},
    time::Instant,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use semver::Version;
use serde::{de::DeserializeOwned, Serialize};

pub use proxy::{DeferredReply, Proxy};

use crate::{
    events::{EventError, EventFlags, EventHandlerBinding, EventHandlerFn},
    hooks::{ErrorHook, ErrorReport},
    message::{Message, PING_SUBJECT},
    rpc::ReplyChannel,
    serializer,
    trace,
};

const LOG_TARGET: &str = "hive::interface";

#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("interface '{0}' is already installed")]
    DuplicateInterface(String),
    #[error("method '{0}' is declared twice")]
    DuplicateMethod(String),
    #[error(transparent)]
    Event(#[from] EventError),
}

/// An error raised by a handler. The kind becomes the `type` of a typed ERROR reply when the
/// method declares it; undeclared kinds surface as NACK.
#[derive(Debug, Clone)]
pub struct HandlerError {
    kind: String,
    message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("InternalError", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BadRequest", message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// An inbound request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    message: Message,
}

impl Request {
    pub(crate) fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn subject(&self) -> &str {
        self.message.subject()
    }

    pub fn source(&self) -> &str {
        self.message.source()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.message.trace_id()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.message.header(name)
    }

    /// Bind the request body into the handler's argument type.
    pub fn body<T>(&self) -> Result<T, HandlerError>
    where T: DeserializeOwned {
        self.message
            .decode_body()
            .map_err(|e| HandlerError::bad_request(e.to_string()))
    }

    pub fn raw_body(&self) -> &Bytes {
        self.message.body_bytes()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

pub type RpcHandlerFn = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Bytes, HandlerError>> + Send + Sync>;
pub type RawRpcHandlerFn =
    Arc<dyn Fn(Request, ReplyChannel) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// How a method handles its request: the framework replies for `Rpc` handlers, while `Raw`
/// handlers drive the [`ReplyChannel`] themselves.
#[derive(Clone)]
pub enum HandlerKind {
    Rpc(RpcHandlerFn),
    Raw(RawRpcHandlerFn),
}

/// Typed descriptor of one RPC method.
#[derive(Clone)]
pub struct RpcMethod {
    name: String,
    params: Vec<String>,
    help: String,
    declared_errors: Vec<String>,
    handler: HandlerKind,
}

impl RpcMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn declared_errors(&self) -> &[String] {
        &self.declared_errors
    }

    pub(crate) fn handler(&self) -> &HandlerKind {
        &self.handler
    }
}

/// A named bundle of RPC methods and event subscriptions.
pub struct Interface {
    name: String,
    version: Option<Version>,
    builtin: bool,
    methods: HashMap<String, RpcMethod>,
    event_handlers: Vec<Arc<EventHandlerBinding>>,
}

impl Interface {
    pub fn builder(name: impl Into<String>) -> InterfaceBuilder {
        InterfaceBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Builtin interfaces are never advertised via discovery.
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    pub fn method(&self, name: &str) -> Option<&RpcMethod> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &RpcMethod> {
        self.methods.values()
    }

    pub fn event_handlers(&self) -> &[Arc<EventHandlerBinding>] {
        &self.event_handlers
    }
}

struct PendingEventHandler {
    function: String,
    patterns: Vec<String>,
    flags: EventFlags,
    handler: EventHandlerFn,
}

pub struct InterfaceBuilder {
    name: String,
    version: Option<Version>,
    builtin: bool,
    methods: HashMap<String, RpcMethod>,
    last_method: Option<String>,
    event_handlers: Vec<PendingEventHandler>,
    error: Option<InterfaceError>,
}

impl InterfaceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            builtin: false,
            methods: HashMap::new(),
            last_method: None,
            event_handlers: Vec::new(),
            error: None,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub(crate) fn builtin(mut self) -> Self {
        self.builtin = true;
        self
    }

    /// Register an RPC method. The framework sends the returned value as the REP body; errors
    /// with a declared kind become typed ERROR replies, all others NACK.
    pub fn rpc<F, Fut, Res>(self, name: &str, params: &[&str], help: &str, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, HandlerError>> + Send + 'static,
        Res: Serialize + Send + 'static,
    {
        let handler: RpcHandlerFn = Arc::new(move |request| {
            let fut = f(request);
            Box::pin(async move {
                let result = fut.await?;
                serializer::default_serializer()
                    .encode(&result)
                    .map_err(|e| HandlerError::internal(e.to_string()))
            })
        });
        self.add_method(name, params, help, HandlerKind::Rpc(handler))
    }

    /// Register a raw RPC method which drives the [`ReplyChannel`] itself, e.g. for
    /// fire-and-forget acknowledgement or custom error payloads.
    pub fn raw_rpc<F, Fut>(self, name: &str, params: &[&str], help: &str, f: F) -> Self
    where
        F: Fn(Request, ReplyChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: RawRpcHandlerFn = Arc::new(move |request, channel| Box::pin(f(request, channel)));
        self.add_method(name, params, help, HandlerKind::Raw(handler))
    }

    fn add_method(mut self, name: &str, params: &[&str], help: &str, handler: HandlerKind) -> Self {
        if self.methods.contains_key(name) {
            self.error.get_or_insert(InterfaceError::DuplicateMethod(name.to_string()));
            return self;
        }
        self.methods.insert(name.to_string(), RpcMethod {
            name: name.to_string(),
            params: params.iter().map(ToString::to_string).collect(),
            help: help.to_string(),
            declared_errors: Vec::new(),
            handler,
        });
        self.last_method = Some(name.to_string());
        self
    }

    /// Declare the error kinds of the most recently added method. Declared kinds are returned
    /// as typed ERROR replies instead of NACK.
    pub fn raises(mut self, kinds: &[&str]) -> Self {
        if let Some(name) = &self.last_method {
            if let Some(method) = self.methods.get_mut(name) {
                method.declared_errors = kinds.iter().map(ToString::to_string).collect();
            }
        }
        self
    }

    /// Subscribe a handler function to a set of event-type patterns.
    pub fn on_event<F, Fut>(mut self, function: &str, patterns: &[&str], flags: EventFlags, f: F) -> Self
    where
        F: Fn(crate::events::Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: EventHandlerFn = Arc::new(move |event| Box::pin(f(event)));
        self.event_handlers.push(PendingEventHandler {
            function: function.to_string(),
            patterns: patterns.iter().map(ToString::to_string).collect(),
            flags,
            handler,
        });
        self
    }

    pub fn build(self) -> Result<Interface, InterfaceError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut event_handlers = Vec::with_capacity(self.event_handlers.len());
        for pending in self.event_handlers {
            event_handlers.push(EventHandlerBinding::new(
                &self.name,
                &pending.function,
                pending.patterns,
                pending.flags,
                pending.handler,
            )?);
        }
        Ok(Interface {
            name: self.name,
            version: self.version,
            builtin: self.builtin,
            methods: self.methods,
            event_handlers,
        })
    }
}

/// Description of one RPC method, as returned by `hive.inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct MethodDescription {
    pub name: String,
    pub version: Option<String>,
    pub params: Vec<String>,
    pub help: String,
}

/// Holds the installed interfaces and dispatches inbound requests to their handlers.
#[derive(Default)]
pub struct InterfaceRegistry {
    interfaces: RwLock<HashMap<String, Arc<Interface>>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&self, interface: Interface) -> Result<Arc<Interface>, InterfaceError> {
        let mut interfaces = self.interfaces.write().expect("interface registry lock poisoned");
        if interfaces.contains_key(interface.name()) {
            return Err(InterfaceError::DuplicateInterface(interface.name().to_string()));
        }
        let interface = Arc::new(interface);
        interfaces.insert(interface.name().to_string(), Arc::clone(&interface));
        Ok(interface)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Interface>> {
        self.interfaces
            .read()
            .expect("interface registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Interface>> {
        self.interfaces
            .read()
            .expect("interface registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Describe every RPC method of every installed interface.
    pub fn describe(&self) -> Vec<MethodDescription> {
        let mut methods: Vec<MethodDescription> = self
            .all()
            .iter()
            .flat_map(|interface| {
                interface.methods().map(|method| MethodDescription {
                    name: format!("{}.{}", interface.name(), method.name()),
                    version: interface.version().map(ToString::to_string),
                    params: method.params().to_vec(),
                    help: method.help().to_string(),
                })
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }

    /// Dispatch one inbound request. Unknown interfaces or methods yield NACK; handler errors
    /// are reported to the error hook and yield NACK unless their kind was declared.
    pub(crate) async fn dispatch(&self, channel: ReplyChannel, hook: ErrorHook) {
        let trace_id = channel
            .request()
            .trace_id()
            .map(ToString::to_string)
            .unwrap_or_else(trace::new_trace_id);
        trace::scope(trace_id, self.dispatch_traced(channel, hook)).await
    }

    async fn dispatch_traced(&self, channel: ReplyChannel, hook: ErrorHook) {
        let subject = channel.request().subject().to_string();
        let level = if subject == PING_SUBJECT {
            log::Level::Debug
        } else {
            log::Level::Info
        };
        log::log!(target: LOG_TARGET, level, "{} source={}", subject, channel.request().source());
        let started = Instant::now();

        let Some((interface_name, method_name)) = subject.rsplit_once('.') else {
            log::warn!(target: LOG_TARGET, "malformed subject: {}", subject);
            let _ = channel.nack(true).await;
            return;
        };
        let Some(interface) = self.get(interface_name) else {
            log::warn!(target: LOG_TARGET, "unsupported interface: {}", interface_name);
            let _ = channel.nack(true).await;
            return;
        };
        let Some(method) = interface.method(method_name).cloned() else {
            log::warn!(target: LOG_TARGET, "unknown method: {}", subject);
            let _ = channel.nack(true).await;
            return;
        };
        if let Some(version) = interface.version() {
            channel.add_header("version", &version.to_string());
        }

        let request = Request::new(channel.request().clone());
        match method.handler() {
            HandlerKind::Rpc(f) => match f(request).await {
                Ok(body) => {
                    if let Err(err) = channel.reply_raw(body).await {
                        log::warn!(target: LOG_TARGET, "failed to send reply for {}: {}", subject, err);
                    }
                },
                Err(err) => {
                    self.handle_error(&channel, &method, interface_name, method_name, err, &hook)
                        .await;
                },
            },
            HandlerKind::Raw(f) => {
                if let Err(err) = f(request, channel.clone()).await {
                    self.handle_error(&channel, &method, interface_name, method_name, err, &hook)
                        .await;
                }
            },
        }
        log::log!(
            target: LOG_TARGET,
            level,
            "subject={} duration={:?}",
            subject,
            started.elapsed()
        );
    }

    async fn handle_error(
        &self,
        channel: &ReplyChannel,
        method: &RpcMethod,
        interface_name: &str,
        method_name: &str,
        err: HandlerError,
        hook: &ErrorHook,
    ) {
        if method.declared_errors().iter().any(|kind| kind == err.kind()) {
            if let Err(send_err) = channel.error(err.kind(), err.message()).await {
                log::warn!(target: LOG_TARGET, "failed to send error reply: {}", send_err);
            }
            return;
        }
        log::error!(
            target: LOG_TARGET,
            "request error in {}.{}: {}",
            interface_name,
            method_name,
            err
        );
        hook.report(&ErrorReport::for_subject(err.to_string(), interface_name, method_name));
        if let Err(send_err) = channel.nack(true).await {
            log::warn!(target: LOG_TARGET, "failed to send automatic NACK: {}", send_err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_collects_methods_and_descriptions() {
        let interface = Interface::builder("echo")
            .with_version(Version::new(1, 2, 0))
            .rpc("echo", &["text"], "Echo the text back.", |req: Request| async move {
                req.body::<serde_json::Value>()
            })
            .raises(&["ValidationError"])
            .build()
            .unwrap();
        assert_eq!(interface.name(), "echo");
        let method = interface.method("echo").unwrap();
        assert_eq!(method.params(), &["text".to_string()]);
        assert_eq!(method.declared_errors(), &["ValidationError".to_string()]);
    }

    #[test]
    fn duplicate_method_is_rejected() {
        let result = Interface::builder("echo")
            .rpc("echo", &[], "", |_req| async { Ok(()) })
            .rpc("echo", &[], "", |_req| async { Ok(()) })
            .build();
        assert!(matches!(result, Err(InterfaceError::DuplicateMethod(_))));
    }

    #[test]
    fn registry_rejects_duplicate_interfaces() {
        let registry = InterfaceRegistry::new();
        let build = || Interface::builder("echo").build().unwrap();
        registry.register(build()).unwrap();
        assert!(matches!(
            registry.register(build()),
            Err(InterfaceError::DuplicateInterface(_))
        ));
    }

    #[test]
    fn describe_lists_dotted_names() {
        let registry = InterfaceRegistry::new();
        let interface = Interface::builder("echo")
            .rpc("upper", &["text"], "Uppercase.", |_req| async { Ok(()) })
            .build()
            .unwrap();
        registry.register(interface).unwrap();
        let described = registry.describe();
        assert_eq!(described.len(), 1);
        assert_eq!(described[0].name, "echo.upper");
    }
}
