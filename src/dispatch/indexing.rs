//! Indexing adapter. Inbound messages only enqueue; a periodic flush
//! drains the queues into the search-index service.

use super::{
    ANCESTOR_ID, MessageHandler, OBJECT_CLASS, OBJECT_ID, Replies, TARGET_IDS, error_reply,
};
use crate::broker::{Headers, MSG_TYPE, Message};
use crate::error::{BrokerError, DecodeError};
use crate::model::Reference;
use crate::queue::{AncestorQueues, AncestorTick, DedupedDelayQueue, WorkProcessor};
use crate::rest::IndexingGateway;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_INDEXING_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_BATCH: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexingMessageType {
    AddAncestor,
    DeleteDoc,
    UpdateDoc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexingMessage {
    AddAncestor { ancestor_id: i64, descendant_id: i64 },
    DeleteDoc { doc_id: i64 },
    UpdateDoc { reference: Reference },
}

impl IndexingMessage {
    pub fn decode(headers: &Headers) -> Result<Self, DecodeError> {
        let raw = headers
            .message_type()
            .ok_or(DecodeError::MissingHeader(MSG_TYPE))?;
        let kind =
            IndexingMessageType::from_str(&raw).map_err(|_| DecodeError::UnknownType(raw.clone()))?;

        let object_id = required_long(headers, OBJECT_ID)?;
        Ok(match kind {
            IndexingMessageType::AddAncestor => Self::AddAncestor {
                ancestor_id: required_long(headers, ANCESTOR_ID)?,
                descendant_id: object_id,
            },
            IndexingMessageType::DeleteDoc => Self::DeleteDoc { doc_id: object_id },
            IndexingMessageType::UpdateDoc => Self::UpdateDoc {
                reference: Reference::new(
                    headers
                        .get_str(OBJECT_CLASS)
                        .filter(|c| !c.is_empty())
                        .ok_or(DecodeError::MissingHeader(OBJECT_CLASS))?,
                    object_id,
                ),
            },
        })
    }

    pub fn kind(&self) -> IndexingMessageType {
        match self {
            Self::AddAncestor { .. } => IndexingMessageType::AddAncestor,
            Self::DeleteDoc { .. } => IndexingMessageType::DeleteDoc,
            Self::UpdateDoc { .. } => IndexingMessageType::UpdateDoc,
        }
    }
}

fn required_long(headers: &Headers, name: &'static str) -> Result<i64, DecodeError> {
    match headers.get(name) {
        None => Err(DecodeError::MissingHeader(name)),
        Some(value) => headers
            .get_long(name)
            .ok_or_else(|| DecodeError::InvalidHeader {
                name,
                value: value.to_string_lossy(),
            }),
    }
}

/// Pending index work shared by the delivery workers and the flush job.
#[derive(Debug)]
pub struct IndexingQueues {
    pub docs_to_index: DedupedDelayQueue<Reference>,
    pub doc_ids_to_remove: DedupedDelayQueue<i64>,
    pub descendants_to_add: AncestorQueues,
}

impl IndexingQueues {
    pub fn new(delay: Duration) -> Self {
        Self {
            docs_to_index: DedupedDelayQueue::new("docs-to-index", delay),
            doc_ids_to_remove: DedupedDelayQueue::new("doc-ids-to-remove", delay),
            descendants_to_add: AncestorQueues::new(delay),
        }
    }

    pub fn enqueue(&self, message: IndexingMessage) -> bool {
        match message {
            IndexingMessage::AddAncestor {
                ancestor_id,
                descendant_id,
            } => self.descendants_to_add.add(ancestor_id, descendant_id),
            IndexingMessage::DeleteDoc { doc_id } => self.doc_ids_to_remove.add_work_item(doc_id),
            IndexingMessage::UpdateDoc { reference } => {
                self.docs_to_index.add_work_item(reference)
            }
        }
    }
}

impl Default for IndexingQueues {
    fn default() -> Self {
        Self::new(DEFAULT_INDEXING_DELAY)
    }
}

/// What one flush pass drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub indexed: usize,
    pub removed: usize,
    pub ancestor: Option<AncestorTick>,
}

pub struct IndexingHandler {
    queues: Arc<IndexingQueues>,
    gateway: Arc<dyn IndexingGateway>,
    replies: Replies,
    max_batch: usize,
}

impl IndexingHandler {
    pub fn new(
        queues: Arc<IndexingQueues>,
        gateway: Arc<dyn IndexingGateway>,
        replies: Replies,
        max_batch: usize,
    ) -> Self {
        Self {
            queues,
            gateway,
            replies,
            max_batch: max_batch.max(1),
        }
    }

    pub fn queues(&self) -> &Arc<IndexingQueues> {
        &self.queues
    }

    pub async fn handle(&self, headers: &Headers, body: &[u8]) {
        match IndexingMessage::decode(headers) {
            Ok(message) => {
                let kind = message.kind();
                if !self.queues.enqueue(message) {
                    tracing::debug!(msg_type = %kind, "Coalesced duplicate index request");
                }
            }
            Err(DecodeError::UnknownType(kind)) => {
                tracing::warn!(msg_type = kind.as_str(), "Ignoring unsupported indexing message");
            }
            Err(e) => {
                tracing::warn!("Could not decode indexing message: {e}");
                let reply = error_reply(headers, body, &format!("unable to process message: {e}"));
                self.replies.error(&reply).await;
            }
        }
    }

    /// Drains both stable queues, then one ancestor queue.
    ///
    /// A failed REST call drops its batch for this cycle.
    pub async fn flush(&self) -> FlushReport {
        let indexed = self
            .queues
            .docs_to_index
            .process(self.max_batch, &IndexDocs { handler: self })
            .await;
        let removed = self
            .queues
            .doc_ids_to_remove
            .process(self.max_batch, &RemoveDocs { handler: self })
            .await;
        let ancestor = self
            .queues
            .descendants_to_add
            .process_next(self.max_batch, |ancestor_id| AddAncestor {
                handler: self,
                ancestor_id,
            })
            .await;

        let report = FlushReport {
            indexed,
            removed,
            ancestor,
        };
        if indexed > 0 || removed > 0 || ancestor.is_some_and(|t| t.processed > 0) {
            tracing::info!(
                indexed,
                removed,
                ancestor_id = ancestor.map(|t| t.ancestor_id),
                descendants = ancestor.map_or(0, |t| t.processed),
                pending_ancestors = self.queues.descendants_to_add.len(),
                "Index flush complete"
            );
        }
        report
    }

    async fn publish_summary(&self, kind: IndexingMessageType, mut headers: Headers, body: Vec<u8>) {
        headers.insert(MSG_TYPE, kind.to_string());
        self.replies.success(&Message::new(headers, body)).await;
    }
}

impl MessageHandler for IndexingHandler {
    fn on_message<'a>(
        &'a self,
        headers: &'a Headers,
        body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.handle(headers, body))
    }
}

fn id_list(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, BrokerError> {
    serde_json::to_vec(value).map_err(|e| BrokerError::Other(e.into()))
}

struct IndexDocs<'h> {
    handler: &'h IndexingHandler,
}

impl WorkProcessor<Reference> for IndexDocs<'_> {
    fn process<'a>(
        &'a self,
        items: Vec<Reference>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            self.handler.gateway.index_doc_references(&items).await?;
            let ids: Vec<i64> = items.iter().map(|r| r.object_id).collect();
            let headers = Headers::new().with(TARGET_IDS, id_list(&ids));
            self.handler
                .publish_summary(IndexingMessageType::UpdateDoc, headers, encode(&items)?)
                .await;
            Ok(())
        })
    }
}

struct RemoveDocs<'h> {
    handler: &'h IndexingHandler,
}

impl WorkProcessor<i64> for RemoveDocs<'_> {
    fn process<'a>(
        &'a self,
        items: Vec<i64>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            self.handler.gateway.remove_docs(&items).await?;
            let headers = Headers::new().with(TARGET_IDS, id_list(&items));
            self.handler
                .publish_summary(IndexingMessageType::DeleteDoc, headers, encode(&items)?)
                .await;
            Ok(())
        })
    }
}

struct AddAncestor<'h> {
    handler: &'h IndexingHandler,
    ancestor_id: i64,
}

impl WorkProcessor<i64> for AddAncestor<'_> {
    fn process<'a>(
        &'a self,
        items: Vec<i64>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            self.handler
                .gateway
                .add_ancestor_to_docs(self.ancestor_id, &items)
                .await?;
            let headers = Headers::new()
                .with(ANCESTOR_ID, self.ancestor_id)
                .with(TARGET_IDS, id_list(&items));
            self.handler
                .publish_summary(IndexingMessageType::AddAncestor, headers, encode(&items)?)
                .await;
            Ok(())
        })
    }
}
