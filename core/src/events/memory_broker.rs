// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! An in-process [`Broker`].
//!
//! Implements the full broker contract against process-local state: topic and direct exchanges,
//! durable and auto-delete queues, per-message TTL with dead-lettering, and negative
//! acknowledgement with optional requeue. Used by tests and single-process deployments;
//! [`MemoryBroker::simulate_failover`] drops auto-delete queues and emits `Reconnected`, the way
//! a broker failover looks to consumers.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use tokio::sync::{broadcast, mpsc};

use crate::events::{
    broker::{AckHandle, Broker, BrokerError, BrokerEvent, Delivery, ExchangeKind, QueueSpec},
    dispatcher::compile_pattern,
};

const LOG_TARGET: &str = "hive::events::memory_broker";

const BROKER_EVENT_CHANNEL_SIZE: usize = 16;

struct Binding {
    queue: String,
    routing_key: String,
    // Compiled topic pattern; direct exchanges match the routing key verbatim
    regex: Option<Regex>,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct QueuedMessage {
    id: u64,
    payload: Bytes,
    routing_key: String,
}

struct Queue {
    spec: QueueSpec,
    pending: VecDeque<QueuedMessage>,
    consumers: Vec<mpsc::Sender<Delivery>>,
    next_consumer: usize,
    next_tag: u64,
    unacked: HashMap<u64, QueuedMessage>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    next_message_id: u64,
}

struct TtlExpiry {
    queue: String,
    message_id: u64,
    ttl: Duration,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    events: broadcast::Sender<BrokerEvent>,
    consumer_buffer: usize,
}

impl MemoryBroker {
    pub fn new(consumer_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(BROKER_EVENT_CHANNEL_SIZE);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            events,
            consumer_buffer,
        }
    }

    /// Drop every auto-delete queue (consumers see their stream end) and announce a reconnect,
    /// prompting consumers to re-declare queues and bindings.
    pub fn simulate_failover(&self) {
        {
            let mut state = self.state.lock().expect("broker state lock poisoned");
            let dropped: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, queue)| queue.spec.auto_delete)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &dropped {
                remove_queue(&mut state, name);
            }
            log::debug!(
                target: LOG_TARGET,
                "simulated failover dropped {} auto-delete queue(s)",
                dropped.len()
            );
        }
        let _ = self.events.send(BrokerEvent::Reconnected);
    }

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = self.state.lock().expect("broker state lock poisoned");
        state.queues.get(queue).map(|q| q.pending.len() + q.unacked.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        let state = self.state.lock().expect("broker state lock poisoned");
        state.queues.contains_key(queue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker state lock poisoned");
        state.exchanges.entry(name.to_string()).or_insert_with(|| Exchange {
            kind,
            bindings: Vec::new(),
        });
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker state lock poisoned");
        state.queues.entry(spec.name.clone()).or_insert_with(|| Queue {
            spec: spec.clone(),
            pending: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            next_tag: 0,
            unacked: HashMap::new(),
        });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker state lock poisoned");
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let exchange_entry = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        let exists = exchange_entry
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if exists {
            return Ok(());
        }
        let regex = match exchange_entry.kind {
            ExchangeKind::Topic => Some(
                compile_pattern(routing_key).map_err(|e| BrokerError::Backend(e.to_string()))?,
            ),
            ExchangeKind::Direct => None,
        };
        exchange_entry.bindings.push(Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            regex,
        });
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<(), BrokerError> {
        let expiries = {
            let mut state = self.state.lock().expect("broker state lock poisoned");
            let exchange_entry = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
            let targets: Vec<String> = exchange_entry
                .bindings
                .iter()
                .filter(|binding| match &binding.regex {
                    Some(regex) => regex.is_match(routing_key),
                    None => binding.routing_key == routing_key,
                })
                .map(|binding| binding.queue.clone())
                .collect();

            let mut expiries = Vec::new();
            for queue_name in targets {
                let id = {
                    state.next_message_id += 1;
                    state.next_message_id
                };
                let Some(queue) = state.queues.get_mut(&queue_name) else { continue };
                queue.pending.push_back(QueuedMessage {
                    id,
                    payload: payload.clone(),
                    routing_key: routing_key.to_string(),
                });
                if let Some(ttl) = queue.spec.message_ttl {
                    expiries.push(TtlExpiry {
                        queue: queue_name.clone(),
                        message_id: id,
                        ttl,
                    });
                }
                pump(&mut state, &queue_name, &self.state);
            }
            expiries
        };

        for expiry in expiries {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(expiry.ttl).await;
                broker.expire_message(&expiry.queue, expiry.message_id).await;
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let (tx, rx) = mpsc::channel(self.consumer_buffer);
        let mut state = self.state.lock().expect("broker state lock poisoned");
        let queue_entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        queue_entry.consumers.push(tx);
        pump(&mut state, queue, &self.state);
        Ok(rx)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}

impl MemoryBroker {
    /// Dead-letter or drop a message whose TTL elapsed while it was still pending.
    async fn expire_message(&self, queue_name: &str, message_id: u64) {
        let dead_letter = {
            let mut state = self.state.lock().expect("broker state lock poisoned");
            let Some(queue) = state.queues.get_mut(queue_name) else { return };
            let position = queue.pending.iter().position(|msg| msg.id == message_id);
            let Some(position) = position else { return };
            let msg = queue.pending.remove(position).expect("position just found");
            match (&queue.spec.dead_letter_exchange, &queue.spec.dead_letter_routing_key) {
                (Some(exchange), Some(key)) => Some((exchange.clone(), key.clone(), msg.payload)),
                _ => None,
            }
        };
        if let Some((exchange, routing_key, payload)) = dead_letter {
            if let Err(err) = self.publish(&exchange, &routing_key, payload).await {
                log::warn!(
                    target: LOG_TARGET,
                    "failed to dead-letter expired message from '{}': {}",
                    queue_name,
                    err
                );
            }
        }
    }
}

/// Deliver pending messages to the queue's consumers, round-robin.
fn pump(state: &mut BrokerState, queue_name: &str, state_arc: &Arc<Mutex<BrokerState>>) {
    let Some(queue) = state.queues.get_mut(queue_name) else { return };
    loop {
        // Drop closed consumers first
        queue.consumers.retain(|tx| !tx.is_closed());
        if queue.consumers.is_empty() || queue.pending.is_empty() {
            break;
        }
        let Some(msg) = queue.pending.pop_front() else { break };
        let tag = {
            queue.next_tag += 1;
            queue.next_tag
        };
        let delivery = Delivery::new(
            msg.payload.clone(),
            msg.routing_key.clone(),
            Box::new(MemoryAck {
                state: Arc::clone(state_arc),
                queue: queue_name.to_string(),
                tag,
            }),
        );
        let idx = queue.next_consumer % queue.consumers.len();
        queue.next_consumer = queue.next_consumer.wrapping_add(1);
        match queue.consumers[idx].try_send(delivery) {
            Ok(()) => {
                queue.unacked.insert(tag, msg);
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Consumer buffer is full; retry on the next pump
                queue.pending.push_front(msg);
                break;
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                queue.consumers.remove(idx);
                queue.pending.push_front(msg);
            },
        }
    }
    let auto_delete = queue.spec.auto_delete && queue.consumers.is_empty() && queue.next_tag > 0;
    if auto_delete {
        remove_queue(state, queue_name);
    }
}

fn remove_queue(state: &mut BrokerState, queue_name: &str) {
    state.queues.remove(queue_name);
    for exchange in state.exchanges.values_mut() {
        exchange.bindings.retain(|binding| binding.queue != queue_name);
    }
}

struct MemoryAck {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&mut self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker state lock poisoned");
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.unacked.remove(&self.tag);
        }
        Ok(())
    }

    async fn nack(&mut self, requeue: bool) -> Result<(), BrokerError> {
        let state_arc = Arc::clone(&self.state);
        let mut state = self.state.lock().expect("broker state lock poisoned");
        let Some(queue) = state.queues.get_mut(&self.queue) else { return Ok(()) };
        let Some(msg) = queue.unacked.remove(&self.tag) else { return Ok(()) };
        if requeue {
            queue.pending.push_front(msg);
            let queue_name = self.queue.clone();
            pump(&mut state, &queue_name, &state_arc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn topic_broker() -> MemoryBroker {
        let broker = MemoryBroker::new(16);
        broker.declare_exchange("hive", ExchangeKind::Topic, true).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn routes_by_topic_pattern() {
        let broker = topic_broker().await;
        broker.declare_queue(&QueueSpec::durable("q1")).await.unwrap();
        broker.bind_queue("q1", "hive", "foo.#").await.unwrap();
        let mut rx = broker.consume("q1").await.unwrap();

        broker.publish("hive", "foo.bar", Bytes::from_static(b"a")).await.unwrap();
        broker.publish("hive", "other", Bytes::from_static(b"b")).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.payload, Bytes::from_static(b"a"));
        delivery.ack().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shared_queue_delivers_to_one_consumer_per_message() {
        let broker = topic_broker().await;
        broker.declare_queue(&QueueSpec::durable("shared")).await.unwrap();
        broker.bind_queue("shared", "hive", "evt").await.unwrap();
        let mut a = broker.consume("shared").await.unwrap();
        let mut b = broker.consume("shared").await.unwrap();

        for _ in 0..4 {
            broker.publish("hive", "evt", Bytes::from_static(b"x")).await.unwrap();
        }
        let mut got_a = 0;
        let mut got_b = 0;
        for _ in 0..4 {
            tokio::select! {
                Some(d) = a.recv() => { got_a += 1; d.ack().await.unwrap(); },
                Some(d) = b.recv() => { got_b += 1; d.ack().await.unwrap(); },
            }
        }
        assert_eq!(got_a + got_b, 4);
        assert!(got_a > 0 && got_b > 0);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = topic_broker().await;
        broker.declare_queue(&QueueSpec::durable("q")).await.unwrap();
        broker.bind_queue("q", "hive", "evt").await.unwrap();
        let mut rx = broker.consume("q").await.unwrap();

        broker.publish("hive", "evt", Bytes::from_static(b"m")).await.unwrap();
        let first = rx.recv().await.unwrap();
        first.nack(true).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"m"));
        second.nack(false).await.unwrap();
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn ttl_dead_letters_to_main_exchange() {
        let broker = topic_broker().await;
        broker.declare_exchange("hive_waiting", ExchangeKind::Direct, true).await.unwrap();
        broker
            .declare_queue(&QueueSpec {
                name: "evt-wait_100".to_string(),
                durable: true,
                auto_delete: false,
                message_ttl: Some(Duration::from_millis(100)),
                dead_letter_exchange: Some("hive".to_string()),
                dead_letter_routing_key: Some("evt".to_string()),
            })
            .await
            .unwrap();
        broker.bind_queue("evt-wait_100", "hive_waiting", "evt").await.unwrap();

        broker.declare_queue(&QueueSpec::durable("sink")).await.unwrap();
        broker.bind_queue("sink", "hive", "evt").await.unwrap();
        let mut rx = broker.consume("sink").await.unwrap();

        broker.publish("hive_waiting", "evt", Bytes::from_static(b"late")).await.unwrap();
        assert!(rx.try_recv().is_err());
        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, Bytes::from_static(b"late"));
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn failover_drops_auto_delete_queues() {
        let broker = topic_broker().await;
        broker.declare_queue(&QueueSpec::auto_delete("bcast-1")).await.unwrap();
        broker.bind_queue("bcast-1", "hive", "evt").await.unwrap();
        let mut events = broker.subscribe_events();
        broker.simulate_failover();
        assert!(!broker.has_queue("bcast-1"));
        assert_eq!(events.recv().await.unwrap(), BrokerEvent::Reconnected);
    }
}
