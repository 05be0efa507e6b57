use super::message::{Delivery, Message};
use crate::error::TransportError;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Result of a single non-blocking `get` on a queue.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub delivery: Delivery,
    /// Messages still waiting in the queue after this one was taken.
    pub remaining: u32,
}

/// Stream of pushed deliveries. The sender side is dropped when the broker
/// cancels the subscription (queue deleted, channel closed).
pub type DeliveryReceiver = mpsc::Receiver<Delivery>;

/// One open broker session.
///
/// Implementations own the underlying channel; every method is safe to call
/// concurrently from the consumer workers and the periodic jobs.
pub trait Transport: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Whether the session is still usable. A fatal I/O error flips this.
    fn is_open(&self) -> bool;

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Pull one message if one is available (AMQP `basic.get`).
    fn get<'a>(
        &'a self,
        queue: &'a str,
        auto_ack: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Fetched>, TransportError>> + Send + 'a>>;

    /// Start pushing deliveries from `queue` (AMQP `basic.consume`).
    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        auto_ack: bool,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceiver, TransportError>> + Send + 'a>>;

    fn ack<'a>(
        &'a self,
        delivery_tag: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Bind `queue` to `exchange`. Fails when either does not exist.
    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;
}
