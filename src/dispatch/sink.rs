use crate::broker::Message;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Destination for outbound messages.
pub trait MessageSink: Send + Sync {
    fn name(&self) -> String;

    /// Delivers the message. Failures are the sink's concern; they never
    /// reach the handler that produced the message.
    fn deliver<'a>(&'a self, message: &'a Message) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Ordered list of sinks, invoked in declared order.
#[derive(Clone, Default)]
pub struct SinkChain {
    sinks: Vec<Arc<dyn MessageSink>>,
}

impl SinkChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn MessageSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub async fn emit(&self, message: &Message) {
        for sink in &self.sinks {
            sink.deliver(message).await;
        }
    }
}

/// Outbound routes for one adapter.
#[derive(Clone, Default)]
pub struct Replies {
    pub success: SinkChain,
    pub error: SinkChain,
    pub forward: SinkChain,
}

impl Replies {
    pub async fn success(&self, message: &Message) {
        self.success.emit(message).await;
    }

    pub async fn error(&self, message: &Message) {
        self.error.emit(message).await;
    }

    pub async fn forward(&self, message: &Message) {
        self.forward.emit(message).await;
    }
}

/// Sink that keeps every delivered message in memory.
#[derive(Default)]
pub struct RecordingSink {
    name: String,
    messages: Mutex<Vec<Message>>,
}

impl RecordingSink {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageSink for RecordingSink {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn deliver<'a>(&'a self, message: &'a Message) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(message.clone());
        })
    }
}
