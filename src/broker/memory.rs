//! In-process broker used for synthetic delivery in tests and local runs.
//!
//! Exchanges fan out to every bound queue and ignore routing keys, except the
//! default exchange (`""`) which routes straight to the queue named by the
//! routing key.

use super::connection::{ConnectParams, Opener};
use super::message::{Delivery, Message};
use super::transport::{DeliveryReceiver, Fetched, Transport};
use crate::error::{ConnectError, TransportError};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const CONSUMER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

struct Subscriber {
    tx: mpsc::Sender<Delivery>,
    auto_ack: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    consumers: Vec<Subscriber>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Vec<String>>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, (String, Message)>,
    published: Vec<Published>,
    next_tag: u64,
    epoch: u64,
    refuse_connections: bool,
}

/// Shared broker state. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn declare_exchange(&self, name: &str) {
        self.lock().exchanges.entry(name.to_string()).or_default();
    }

    pub fn declare_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    /// Deletes a queue; active consumers observe a cancellation.
    pub fn delete_queue(&self, name: &str) {
        let mut state = self.lock();
        state.queues.remove(name);
        for bound in state.exchanges.values_mut() {
            bound.retain(|queue| queue != name);
        }
    }

    pub fn bind(&self, queue: &str, exchange: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Queue {
                queue: queue.to_string(),
                message: "no such queue".into(),
            });
        }
        let Some(bound) = state.exchanges.get_mut(exchange) else {
            return Err(TransportError::Queue {
                queue: queue.to_string(),
                message: format!("no such exchange {exchange}"),
            });
        };
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    /// Routes a message the way a client publish would, without a session.
    pub fn inject(&self, queue: &str, message: Message) {
        let mut state = self.lock();
        Self::enqueue(&mut state, queue, message);
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Every message published through a session, in publish order.
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<Message> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.exchange == exchange)
            .map(|p| p.message.clone())
            .collect()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Simulates a fatal I/O error on every open session.
    pub fn sever_sessions(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    fn enqueue(state: &mut BrokerState, queue: &str, message: Message) {
        let tag = state.next_tag + 1;
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };

        target.consumers.retain(|sub| !sub.tx.is_closed());
        if target.consumers.is_empty() {
            target.ready.push_back(message);
            return;
        }

        let idx = target.next_consumer % target.consumers.len();
        target.next_consumer = target.next_consumer.wrapping_add(1);
        let delivery = Delivery {
            tag,
            message: message.clone(),
        };
        let subscriber = &target.consumers[idx];
        let auto_ack = subscriber.auto_ack;
        if subscriber.tx.try_send(delivery).is_ok() {
            state.next_tag = tag;
            if !auto_ack {
                state.unacked.insert(tag, (queue.to_string(), message));
            }
        } else {
            target.ready.push_back(message);
        }
    }

    fn take_tag(state: &mut BrokerState) -> u64 {
        state.next_tag += 1;
        state.next_tag
    }
}

/// Opens sessions against an [`InMemoryBroker`].
pub struct InMemoryOpener {
    broker: InMemoryBroker,
}

impl InMemoryOpener {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self { broker }
    }
}

impl Opener for InMemoryOpener {
    fn open<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Transport>, ConnectError>> + Send + 'a>> {
        Box::pin(async move {
            let epoch = {
                let state = self.broker.lock();
                if state.refuse_connections {
                    return Err(ConnectError::Failed {
                        host: params.host.clone(),
                        message: "connection refused".into(),
                    });
                }
                state.epoch
            };
            let session: Arc<dyn Transport> = Arc::new(InMemorySession {
                broker: self.broker.clone(),
                epoch,
                closed: AtomicBool::new(false),
            });
            Ok(session)
        })
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
    epoch: u64,
    closed: AtomicBool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Transport for InMemorySession {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.broker.lock().epoch == self.epoch
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            let targets = if exchange.is_empty() {
                vec![routing_key.to_string()]
            } else {
                state
                    .exchanges
                    .get(exchange)
                    .cloned()
                    .ok_or_else(|| TransportError::Publish {
                        exchange: exchange.to_string(),
                        message: "no such exchange".into(),
                    })?
            };
            state.published.push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
            });
            for queue in targets {
                InMemoryBroker::enqueue(&mut state, &queue, message.clone());
            }
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        queue: &'a str,
        auto_ack: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Fetched>, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(TransportError::Queue {
                    queue: queue.to_string(),
                    message: "no such queue".into(),
                });
            };
            let Some(message) = target.ready.pop_front() else {
                return Ok(None);
            };
            let remaining = u32::try_from(target.ready.len()).unwrap_or(u32::MAX);
            let tag = InMemoryBroker::take_tag(&mut state);
            if !auto_ack {
                state
                    .unacked
                    .insert(tag, (queue.to_string(), message.clone()));
            }
            Ok(Some(Fetched {
                delivery: Delivery { tag, message },
                remaining,
            }))
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        auto_ack: bool,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceiver, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_open()?;
            let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
            let mut state = self.broker.lock();
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(TransportError::Queue {
                    queue: queue.to_string(),
                    message: "no such queue".into(),
                });
            };

            let backlog: Vec<Message> = target.ready.drain(..).collect();
            target.consumers.push(Subscriber { tx, auto_ack });
            for message in backlog {
                InMemoryBroker::enqueue(&mut state, queue, message);
            }
            tracing::debug!(queue, consumer_tag, "In-memory consumer attached");
            Ok(rx)
        })
    }

    fn ack<'a>(
        &'a self,
        delivery_tag: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_open()?;
            match self.broker.lock().unacked.remove(&delivery_tag) {
                Some(_) => Ok(()),
                None => Err(TransportError::Ack {
                    tag: delivery_tag,
                    message: "unknown delivery tag".into(),
                }),
            }
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.broker.bind(queue, exchange)
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
