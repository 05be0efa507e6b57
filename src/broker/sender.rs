use super::connection::ConnectionManager;
use super::message::{Headers, Message};
use crate::dispatch::MessageSink;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
}

/// Publishes messages to one exchange + routing key.
///
/// Sending is fire-and-forget: publish failures are logged and swallowed so
/// a reply can never hold up the inbound delivery that produced it.
pub struct MessageSender {
    connection: Arc<ConnectionManager>,
    binding: Mutex<Option<Binding>>,
}

impl MessageSender {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            binding: Mutex::new(None),
        }
    }

    /// Binds the sender, replacing any previous binding.
    ///
    /// No-op when the connection is not open or `exchange` is blank.
    pub fn connect(&self, exchange: &str, routing_key: &str) {
        if !self.connection.is_open() {
            tracing::warn!(exchange, "Sender not bound: broker connection is not open");
            return;
        }
        if exchange.trim().is_empty() {
            return;
        }
        *self.lock() = Some(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        tracing::debug!(exchange, routing_key, "Sender bound");
    }

    pub fn disconnect(&self) {
        self.lock().take();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    pub fn exchange(&self) -> Option<String> {
        self.lock().as_ref().map(|b| b.exchange.clone())
    }

    pub async fn send(&self, headers: Headers, body: Vec<u8>) {
        self.send_message(&Message::new(headers, body)).await;
    }

    pub async fn send_message(&self, message: &Message) {
        let Some(binding) = self.lock().clone() else {
            tracing::debug!("Dropping outbound message: sender not bound");
            return;
        };
        let Some(transport) = self.connection.transport() else {
            tracing::warn!(
                exchange = binding.exchange.as_str(),
                "Dropping outbound message: broker connection is closed"
            );
            return;
        };

        if let Err(e) = transport
            .publish(&binding.exchange, &binding.routing_key, message)
            .await
        {
            tracing::warn!(
                exchange = binding.exchange.as_str(),
                routing_key = binding.routing_key.as_str(),
                msg_type = message.headers.message_type().as_deref().unwrap_or("-"),
                "Publish failed: {e}"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Binding>> {
        self.binding
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl MessageSink for MessageSender {
    fn name(&self) -> String {
        self.exchange().unwrap_or_else(|| "unbound".to_string())
    }

    fn deliver<'a>(&'a self, message: &'a Message) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.send_message(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::ConnectParams;
    use crate::broker::memory::{InMemoryBroker, InMemoryOpener};

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

    #[tokio::test]
    async fn connect_is_noop_when_connection_closed() {
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
        let sender = MessageSender::new(manager);
        sender.connect("replies", "");
        assert!(!sender.is_connected());
    }

    #[tokio::test]
    async fn blank_exchange_leaves_sender_unbound() {
        let broker = InMemoryBroker::new();
        let sender = MessageSender::new(open_manager(&broker).await);
        sender.connect("  ", "");
        assert!(!sender.is_connected());
    }

    #[tokio::test]
    async fn rebinding_replaces_previous_exchange() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("first");
        broker.declare_exchange("second");
        let sender = MessageSender::new(open_manager(&broker).await);

        sender.connect("first", "");
        sender.connect("second", "");
        sender.send(Headers::new().with("msgType", "X"), Vec::new()).await;

        assert!(broker.published_to("first").is_empty());
        assert_eq!(broker.published_to("second").len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let broker = InMemoryBroker::new();
        let sender = MessageSender::new(open_manager(&broker).await);
        sender.connect("missing-exchange", "");

        sender.send(Headers::new(), b"payload".to_vec()).await;
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn disconnected_sender_drops_messages() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("replies");
        let sender = MessageSender::new(open_manager(&broker).await);
        sender.connect("replies", "");
        sender.disconnect();

        sender.send(Headers::new(), Vec::new()).await;
        assert!(broker.published().is_empty());
    }
}
