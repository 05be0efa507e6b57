//! Per-adapter message dispatch.
//!
//! Each adapter decodes the `msgType` discriminant into a closed enum and
//! reacts to it; outbound results go through [`Replies`].

pub mod agent;
pub mod indexing;
pub mod neuron;
pub mod sink;

use crate::broker::{Headers, MSG_TYPE, Message};
use std::future::Future;
use std::pin::Pin;

pub use agent::{AgentHandler, AgentMessage};
pub use indexing::{IndexingHandler, IndexingMessage, IndexingQueues};
pub use neuron::{NeuronHandler, NeuronMessage};
pub use sink::{MessageSink, RecordingSink, Replies, SinkChain};

pub const ERROR_PROCESSING: &str = "ERROR_PROCESSING";

// Header keys shared by the adapters.
pub const TARGET_IDS: &str = "targetIds";
pub const WORKSPACE: &str = "workspace";
pub const USER: &str = "user";
pub const TARGET_USER: &str = "target_user";
pub const DECISION: &str = "decision";
pub const DESCRIPTION: &str = "description";
pub const OBJECT_ID: &str = "objectId";
pub const OBJECT_CLASS: &str = "objectClass";
pub const ANCESTOR_ID: &str = "ancestorId";

/// Receives deliveries from an [`crate::broker::AsyncConsumer`].
///
/// Implementations must not fail: every error is converted into an outbound
/// reply or a log line so that delivery keeps flowing.
pub trait MessageHandler: Send + Sync {
    fn on_message<'a>(
        &'a self,
        headers: &'a Headers,
        body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// The broker cancelled the subscription (queue deleted, channel lost).
    fn on_cancelled(&self, consumer_tag: &str) {
        tracing::warn!(consumer_tag, "Subscription cancelled by broker");
    }
}

/// Builds the `ERROR_PROCESSING` reply for a message that could not be
/// handled. Original headers (including `targetIds`) are kept for tracing.
pub fn error_reply(headers: &Headers, body: &[u8], description: &str) -> Message {
    let mut reply = headers.clone();
    reply.insert(MSG_TYPE, ERROR_PROCESSING);
    reply.insert(DESCRIPTION, description);
    Message::new(reply, body.to_vec())
}

/// Parses a comma-separated id list, skipping blanks.
pub fn parse_id_list(raw: &str) -> Result<Vec<i64>, std::num::ParseIntError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}
