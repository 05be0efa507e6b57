use super::connection::{ConnectionManager, MIN_RETRY_PAUSE};
use super::message::{Delivery, Headers, Message};
use crate::dispatch::MessageHandler;
use crate::error::TransportError;
use futures_util::{FutureExt, Stream};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ─── Async (push) consumer ──────────────────────────────────────────────────

/// Pushes every delivery from one queue to a handler.
///
/// Deliveries are pulled from the transport's channel by a pool of worker
/// tasks; there is no ordering guarantee across concurrent deliveries.
pub struct AsyncConsumer {
    connection: Arc<ConnectionManager>,
    queue: Mutex<Option<String>>,
    workers: usize,
    auto_ack: bool,
}

/// Handle on a running subscription.
pub struct Subscription {
    consumer_tag: String,
    shutdown: CancellationToken,
    lost: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stops the worker pool. Deliveries already being handled finish first.
    pub async fn cancel(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }

    /// Resolves when the broker ends the delivery stream (session lost,
    /// queue deleted). Pending forever after [`Subscription::cancel`].
    pub async fn lost(&self) {
        self.lost.cancelled().await;
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once every worker has exited (broker-side cancellation or
    /// [`Subscription::cancel`]).
    pub async fn closed(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

impl AsyncConsumer {
    /// `threads` of 0 selects the transport default of a single dispatch worker.
    pub fn new(connection: Arc<ConnectionManager>, threads: usize, auto_ack: bool) -> Self {
        Self {
            connection,
            queue: Mutex::new(None),
            workers: threads.max(1),
            auto_ack,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Binds the consumer to `queue`, replacing any previous binding.
    pub fn connect(&self, queue: &str) {
        *self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(queue.to_string());
    }

    pub async fn subscribe(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, TransportError> {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Queue {
                queue: String::new(),
                message: "consumer is not connected to a queue".into(),
            })?;
        let transport = self
            .connection
            .transport()
            .ok_or(TransportError::NotConnected)?;

        let consumer_tag = format!("neuronbroker-{}", uuid::Uuid::new_v4());
        let deliveries = transport
            .consume(&queue, &consumer_tag, self.auto_ack)
            .await?;
        let deliveries = Arc::new(tokio::sync::Mutex::new(deliveries));

        tracing::info!(
            queue = queue.as_str(),
            consumer_tag = consumer_tag.as_str(),
            workers = self.workers,
            auto_ack = self.auto_ack,
            "Subscribed to queue"
        );

        let shutdown = CancellationToken::new();
        let lost = CancellationToken::new();
        let cancelled_reported = Arc::new(AtomicBool::new(false));
        let workers = (0..self.workers)
            .map(|worker_id| {
                let ctx = WorkerContext {
                    worker_id,
                    consumer_tag: consumer_tag.clone(),
                    deliveries: Arc::clone(&deliveries),
                    handler: Arc::clone(&handler),
                    connection: Arc::clone(&self.connection),
                    auto_ack: self.auto_ack,
                    shutdown: shutdown.clone(),
                    lost: lost.clone(),
                    cancelled_reported: Arc::clone(&cancelled_reported),
                };
                tokio::spawn(run_worker(ctx))
            })
            .collect();

        Ok(Subscription {
            consumer_tag,
            shutdown,
            lost,
            workers,
        })
    }
}

struct WorkerContext {
    worker_id: usize,
    consumer_tag: String,
    deliveries: Arc<tokio::sync::Mutex<super::transport::DeliveryReceiver>>,
    handler: Arc<dyn MessageHandler>,
    connection: Arc<ConnectionManager>,
    auto_ack: bool,
    shutdown: CancellationToken,
    lost: CancellationToken,
    cancelled_reported: Arc<AtomicBool>,
}

async fn run_worker(ctx: WorkerContext) {
    loop {
        let next: Option<Delivery> = tokio::select! {
            () = ctx.shutdown.cancelled() => return,
            next = async { ctx.deliveries.lock().await.recv().await } => next,
        };

        let Some(delivery) = next else {
            if !ctx.cancelled_reported.swap(true, Ordering::SeqCst) {
                ctx.handler.on_cancelled(&ctx.consumer_tag);
            }
            ctx.lost.cancel();
            return;
        };

        tracing::debug!(
            worker = ctx.worker_id,
            tag = delivery.tag,
            msg_type = delivery.message.headers.message_type().as_deref().unwrap_or("-"),
            "Delivery received"
        );
        let handled = AssertUnwindSafe(
            ctx.handler
                .on_message(&delivery.message.headers, &delivery.message.body),
        )
        .catch_unwind()
        .await;
        if handled.is_err() {
            tracing::error!(worker = ctx.worker_id, tag = delivery.tag, "Message handler panicked");
        }

        if !ctx.auto_ack {
            acknowledge(&ctx.connection, delivery.tag).await;
        }
    }
}

async fn acknowledge(connection: &ConnectionManager, tag: u64) {
    let Some(transport) = connection.transport() else {
        tracing::warn!(tag, "Cannot ack delivery: broker connection is closed");
        return;
    };
    if let Err(e) = transport.ack(tag).await {
        tracing::warn!(tag, "Ack failed: {e}");
    }
}

// ─── Bulk (pull) consumer ───────────────────────────────────────────────────

type RejectFn = dyn Fn(&Headers) -> bool + Send + Sync;

/// Restricts which messages and header keys a bulk retrieval yields.
#[derive(Clone, Default)]
pub struct MessageFilter {
    keep_headers: Option<HashSet<String>>,
    reject: Option<Arc<RejectFn>>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only these header keys are retained on yielded messages.
    pub fn keep_headers<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_headers = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Messages for which `reject` returns true are consumed but not yielded.
    pub fn reject_when(mut self, reject: impl Fn(&Headers) -> bool + Send + Sync + 'static) -> Self {
        self.reject = Some(Arc::new(reject));
        self
    }

    fn apply(&self, mut message: Message) -> Option<Message> {
        if let Some(reject) = &self.reject
            && reject(&message.headers)
        {
            return None;
        }
        if let Some(keep) = &self.keep_headers {
            message.headers.retain(|key| keep.contains(key));
        }
        Some(message)
    }
}

/// Drains whatever is currently in a queue, one `get` at a time.
pub struct BulkConsumer {
    connection: Arc<ConnectionManager>,
    queue: Mutex<Option<String>>,
    acknowledge: bool,
}

impl BulkConsumer {
    pub fn new(connection: Arc<ConnectionManager>, acknowledge: bool) -> Self {
        Self {
            connection,
            queue: Mutex::new(None),
            acknowledge,
        }
    }

    /// Opens the connection if needed (up to `retries` attempts) and binds
    /// `queue` to `exchange` when an exchange is given.
    pub async fn connect(
        &self,
        exchange: &str,
        queue: &str,
        retries: u32,
    ) -> Result<(), TransportError> {
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            match self.connection.open().await {
                Ok(_) if self.connection.is_open() => break,
                Ok(_) => return Err(TransportError::NotConnected),
                Err(e) if attempt < attempts => {
                    tracing::warn!(queue, attempt, "Bulk consumer connect failed, retrying: {e}");
                    tokio::time::sleep(MIN_RETRY_PAUSE).await;
                }
                Err(e) => {
                    tracing::error!(queue, "Bulk consumer connect failed: {e}");
                    return Err(TransportError::NotConnected);
                }
            }
        }

        let transport = self
            .connection
            .transport()
            .ok_or(TransportError::NotConnected)?;
        if !exchange.trim().is_empty() {
            transport.bind_queue(queue, exchange).await?;
        }
        *self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(queue.to_string());
        Ok(())
    }

    /// Lazily pulls every message currently in the queue.
    ///
    /// The sequence ends once the broker reports no messages left after the
    /// last fetch; reconnect to retrieve again.
    pub fn retrieve_messages(&self, filter: MessageFilter) -> impl Stream<Item = Message> + '_ {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let acknowledge = self.acknowledge;

        async_stream::stream! {
            let Some(queue) = queue else {
                tracing::warn!("Bulk retrieval requested before connect");
                return;
            };
            let Some(transport) = self.connection.transport() else {
                tracing::warn!(queue = queue.as_str(), "Bulk retrieval skipped: broker connection is closed");
                return;
            };

            loop {
                let fetched = match transport.get(&queue, acknowledge).await {
                    Ok(Some(fetched)) => fetched,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(queue = queue.as_str(), "Bulk retrieval aborted: {e}");
                        break;
                    }
                };
                let remaining = fetched.remaining;
                if let Some(message) = filter.apply(fetched.delivery.message) {
                    yield message;
                }
                if remaining == 0 {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::ConnectParams;
    use crate::broker::memory::{InMemoryBroker, InMemoryOpener};
    use futures_util::StreamExt;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Headers>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl MessageHandler for Recorder {
        fn on_message<'a>(
            &'a self,
            headers: &'a Headers,
            _body: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(headers.clone());
            })
        }

        fn on_cancelled(&self, consumer_tag: &str) {
            self.cancelled.lock().unwrap().push(consumer_tag.to_string());
        }
    }

    async fn open_manager(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(InMemoryOpener::new(broker.clone())),
            ConnectParams {
                host: "memory".into(),
                user: String::new(),
                password: String::new(),
                concurrency: 0,
            },
        ));
        manager.open().await.unwrap();
        manager
    }

    fn typed(kind: &str) -> Message {
        Message::new(Headers::new().with("msgType", kind), Vec::new())
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn zero_threads_uses_single_worker() {
        let broker = InMemoryBroker::new();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(InMemoryOpener::new(broker)),
            ConnectParams {
                host: "memory".into(),
                user: String::new(),
                password: String::new(),
                concurrency: 0,
            },
        ));
        assert_eq!(AsyncConsumer::new(manager, 0, true).worker_count(), 1);
    }

    #[tokio::test]
    async fn subscribe_without_queue_fails() {
        let broker = InMemoryBroker::new();
        let consumer = AsyncConsumer::new(open_manager(&broker).await, 1, true);
        let result = consumer.subscribe(Arc::new(Recorder::default())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delivers_every_message_to_handler() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("inbound");
        broker.inject("inbound", typed("A"));

        let consumer = AsyncConsumer::new(open_manager(&broker).await, 3, true);
        consumer.connect("inbound");
        let recorder = Arc::new(Recorder::default());
        let subscription = consumer.subscribe(recorder.clone()).await.unwrap();

        broker.inject("inbound", typed("B"));
        broker.inject("inbound", typed("C"));

        wait_for(|| recorder.seen.lock().unwrap().len() == 3).await;
        let mut kinds: Vec<String> = recorder
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(Headers::message_type)
            .collect();
        kinds.sort();
        assert_eq!(kinds, vec!["A", "B", "C"]);
        subscription.cancel().await;
    }

    #[tokio::test]
    async fn manual_ack_acknowledges_after_handling() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("inbound");

        let consumer = AsyncConsumer::new(open_manager(&broker).await, 1, false);
        consumer.connect("inbound");
        let recorder = Arc::new(Recorder::default());
        let subscription = consumer.subscribe(recorder.clone()).await.unwrap();

        broker.inject("inbound", typed("A"));
        wait_for(|| recorder.seen.lock().unwrap().len() == 1).await;
        wait_for(|| broker.unacked_count() == 0).await;
        subscription.cancel().await;
    }

    #[tokio::test]
    async fn deleted_queue_reports_cancellation_once() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("inbound");

        let consumer = AsyncConsumer::new(open_manager(&broker).await, 4, true);
        consumer.connect("inbound");
        let recorder = Arc::new(Recorder::default());
        let subscription = consumer.subscribe(recorder.clone()).await.unwrap();
        let tag = subscription.consumer_tag().to_string();

        broker.delete_queue("inbound");
        subscription.lost().await;
        subscription.closed().await;

        assert_eq!(*recorder.cancelled.lock().unwrap(), vec![tag]);
    }

    #[tokio::test]
    async fn severed_session_marks_subscription_lost() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("inbound");

        let consumer = AsyncConsumer::new(open_manager(&broker).await, 2, true);
        consumer.connect("inbound");
        let recorder = Arc::new(Recorder::default());
        let subscription = consumer.subscribe(recorder.clone()).await.unwrap();
        assert!(!subscription.is_lost());

        broker.sever_sessions();
        subscription.lost().await;
        assert!(subscription.is_lost());
        subscription.closed().await;
    }

    #[tokio::test]
    async fn cancelled_subscription_is_not_lost() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("inbound");

        let consumer = AsyncConsumer::new(open_manager(&broker).await, 1, true);
        consumer.connect("inbound");
        let subscription = consumer
            .subscribe(Arc::new(Recorder::default()))
            .await
            .unwrap();
        let lost = subscription.lost.clone();
        subscription.cancel().await;
        assert!(!lost.is_cancelled());
    }

    #[tokio::test]
    async fn bulk_retrieval_drains_queue_and_stops() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("traffic");
        broker.declare_queue("backup");
        let manager = open_manager(&broker).await;

        let consumer = BulkConsumer::new(Arc::clone(&manager), true);
        consumer.connect("traffic", "backup", 3).await.unwrap();
        let transport = manager.transport().unwrap();
        for kind in ["A", "B", "C"] {
            transport.publish("traffic", "", &typed(kind)).await.unwrap();
        }

        let messages: Vec<Message> = consumer.retrieve_messages(MessageFilter::new()).collect().await;
        assert_eq!(messages.len(), 3);
        assert_eq!(broker.queue_depth("backup"), 0);

        let again: Vec<Message> = consumer.retrieve_messages(MessageFilter::new()).collect().await;
        assert!(again.is_empty(), "retrieval is restartable only by reconnecting");
    }

    #[tokio::test]
    async fn bulk_filter_rejects_and_strips_headers() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("backup");
        broker.inject(
            "backup",
            Message::new(
                Headers::new().with("msgType", "KEEP").with("user", "alice"),
                Vec::new(),
            ),
        );
        broker.inject("backup", typed("DROP"));

        let consumer = BulkConsumer::new(open_manager(&broker).await, true);
        consumer.connect("", "backup", 1).await.unwrap();
        let filter = MessageFilter::new()
            .keep_headers(["msgType"])
            .reject_when(|h| h.message_type().as_deref() == Some("DROP"));

        let messages: Vec<Message> = consumer.retrieve_messages(filter).collect().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].headers.message_type().as_deref(), Some("KEEP"));
        assert!(!messages[0].headers.contains_key("user"));
    }

    #[tokio::test]
    async fn bulk_connect_fails_for_unknown_exchange() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("backup");
        let consumer = BulkConsumer::new(open_manager(&broker).await, true);
        assert!(consumer.connect("nope", "backup", 1).await.is_err());
    }
}
