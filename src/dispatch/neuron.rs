//! Neuron adapter: edits and the ownership state machine.
//!
//! Ownership is never cached here; every request reads the current owner
//! from the persistence service and writes the outcome straight back.

use super::{
    DECISION, MessageHandler, Replies, TARGET_IDS, TARGET_USER, USER, WORKSPACE, error_reply,
    parse_id_list,
};
use crate::broker::{Headers, MSG_TYPE, Message};
use crate::error::{BrokerError, DecodeError};
use crate::model::Neuron;
use crate::rest::NeuronGateway;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

/// Default shared owner whose neurons may be claimed by anyone.
pub const DEFAULT_SYSTEM_OWNER: &str = "group:mouselight";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NeuronMessageType {
    NeuronCreate,
    NeuronSaveNeurondata,
    NeuronSaveMetadata,
    NeuronDelete,
    RequestNeuronOwnership,
    RequestNeuronAssignment,
    NeuronOwnershipDecision,
}

/// Decoded neuron-adapter message.
#[derive(Debug, Clone, PartialEq)]
pub enum NeuronMessage {
    Delete {
        neuron: Neuron,
    },
    /// Create, save-neurondata and save-metadata all persist the body.
    Save {
        kind: NeuronMessageType,
        neuron: Neuron,
    },
    RequestAssignment {
        neuron: Neuron,
        target_user: String,
    },
    OwnershipDecision {
        neuron_ids: Vec<i64>,
        decision: bool,
    },
    RequestOwnership {
        neuron_ids: Vec<i64>,
    },
}

impl NeuronMessage {
    pub fn decode(headers: &Headers, body: &[u8]) -> Result<Self, DecodeError> {
        let raw = headers
            .message_type()
            .ok_or(DecodeError::MissingHeader(MSG_TYPE))?;
        let kind =
            NeuronMessageType::from_str(&raw).map_err(|_| DecodeError::UnknownType(raw.clone()))?;

        Ok(match kind {
            NeuronMessageType::NeuronDelete => Self::Delete {
                neuron: decode_neuron(body)?,
            },
            NeuronMessageType::NeuronCreate
            | NeuronMessageType::NeuronSaveNeurondata
            | NeuronMessageType::NeuronSaveMetadata => Self::Save {
                kind,
                neuron: decode_neuron(body)?,
            },
            NeuronMessageType::RequestNeuronAssignment => Self::RequestAssignment {
                neuron: decode_neuron(body)?,
                target_user: headers
                    .get_str(TARGET_USER)
                    .filter(|u| !u.is_empty())
                    .ok_or(DecodeError::MissingHeader(TARGET_USER))?,
            },
            NeuronMessageType::NeuronOwnershipDecision => Self::OwnershipDecision {
                neuron_ids: target_ids(headers)?,
                decision: headers
                    .get_bool(DECISION)
                    .ok_or(DecodeError::MissingHeader(DECISION))?,
            },
            NeuronMessageType::RequestNeuronOwnership => Self::RequestOwnership {
                neuron_ids: target_ids(headers)?,
            },
        })
    }

    pub fn kind(&self) -> NeuronMessageType {
        match self {
            Self::Delete { .. } => NeuronMessageType::NeuronDelete,
            Self::Save { kind, .. } => *kind,
            Self::RequestAssignment { .. } => NeuronMessageType::RequestNeuronAssignment,
            Self::OwnershipDecision { .. } => NeuronMessageType::NeuronOwnershipDecision,
            Self::RequestOwnership { .. } => NeuronMessageType::RequestNeuronOwnership,
        }
    }
}

fn decode_neuron(body: &[u8]) -> Result<Neuron, DecodeError> {
    if body.is_empty() {
        return Err(DecodeError::Body("empty neuron payload".into()));
    }
    serde_json::from_slice(body).map_err(|e| DecodeError::Body(e.to_string()))
}

fn target_ids(headers: &Headers) -> Result<Vec<i64>, DecodeError> {
    let raw = headers
        .get_str(TARGET_IDS)
        .ok_or(DecodeError::MissingHeader(TARGET_IDS))?;
    let ids = parse_id_list(&raw).map_err(|_| DecodeError::InvalidHeader {
        name: TARGET_IDS,
        value: raw.clone(),
    })?;
    if ids.is_empty() {
        return Err(DecodeError::MissingHeader(TARGET_IDS));
    }
    Ok(ids)
}

fn encode_neuron(neuron: &Neuron) -> Result<Vec<u8>, BrokerError> {
    serde_json::to_vec(neuron).map_err(|e| BrokerError::Other(e.into()))
}

/// Per-request context pulled from the inbound headers.
struct Request<'a> {
    headers: &'a Headers,
    body: &'a [u8],
    user: String,
    workspace: Option<String>,
}

pub struct NeuronHandler {
    gateway: Arc<dyn NeuronGateway>,
    replies: Replies,
    system_owner: String,
}

impl NeuronHandler {
    pub fn new(gateway: Arc<dyn NeuronGateway>, replies: Replies, system_owner: &str) -> Self {
        Self {
            gateway,
            replies,
            system_owner: system_owner.to_string(),
        }
    }

    pub fn system_owner(&self) -> &str {
        &self.system_owner
    }

    pub async fn handle(&self, headers: &Headers, body: &[u8]) {
        let message = match NeuronMessage::decode(headers, body) {
            Ok(message) => message,
            Err(DecodeError::UnknownType(kind)) => {
                tracing::warn!(msg_type = kind.as_str(), "Ignoring unsupported neuron message");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    target_ids = headers.get_str(TARGET_IDS).as_deref().unwrap_or("-"),
                    "Could not decode neuron message: {e}"
                );
                let reply = error_reply(headers, body, &format!("unable to process message: {e}"));
                self.replies.error(&reply).await;
                return;
            }
        };

        let request = Request {
            headers,
            body,
            user: headers.get_str(USER).unwrap_or_default(),
            workspace: headers.get_str(WORKSPACE),
        };
        let kind = message.kind();

        let outcome = AssertUnwindSafe(self.dispatch(message, &request))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handler panicked".to_string(),
        };

        tracing::error!(
            msg_type = %kind,
            user = request.user.as_str(),
            target_ids = headers.get_str(TARGET_IDS).as_deref().unwrap_or("-"),
            "Neuron request failed: {failure}"
        );
        let reply = error_reply(headers, body, &format!("{kind} failed for user {}: {failure}", request.user));
        self.replies.error(&reply).await;
    }

    async fn dispatch(&self, message: NeuronMessage, req: &Request<'_>) -> Result<(), BrokerError> {
        match message {
            NeuronMessage::Delete { neuron } => self.delete(&neuron, req).await,
            NeuronMessage::Save { kind, neuron } => self.save(kind, &neuron, req).await,
            NeuronMessage::RequestAssignment {
                neuron,
                target_user,
            } => self.assign(neuron, &target_user, req).await,
            NeuronMessage::OwnershipDecision {
                neuron_ids,
                decision,
            } => self.decide(&neuron_ids, decision, req).await,
            NeuronMessage::RequestOwnership { neuron_ids } => {
                self.request_ownership(&neuron_ids, req).await
            }
        }
    }

    // Deletes are not owner-checked.
    async fn delete(&self, neuron: &Neuron, req: &Request<'_>) -> Result<(), BrokerError> {
        self.gateway.remove_neuron(neuron, &req.user).await?;
        tracing::info!(neuron = neuron.id_label(), user = req.user.as_str(), "Neuron deleted");
        self.replies
            .success(&Message::new(req.headers.clone(), req.body.to_vec()))
            .await;
        Ok(())
    }

    async fn save(
        &self,
        kind: NeuronMessageType,
        neuron: &Neuron,
        req: &Request<'_>,
    ) -> Result<(), BrokerError> {
        if !neuron.is_owned_by(&req.user) {
            tracing::info!(
                msg_type = %kind,
                neuron = neuron.id_label(),
                user = req.user.as_str(),
                owner = neuron.owner_key.as_str(),
                "Rejected save from non-owner"
            );
            return Ok(());
        }

        let saved = self.gateway.save_neuron(neuron, &req.user).await?;
        tracing::debug!(msg_type = %kind, neuron = saved.id_label(), "Neuron persisted");

        let mut headers = req.headers.clone();
        if let Some(id) = saved.id {
            headers.insert(TARGET_IDS, id.to_string());
        }
        self.replies
            .success(&Message::new(headers, encode_neuron(&saved)?))
            .await;
        Ok(())
    }

    async fn assign(
        &self,
        mut neuron: Neuron,
        target_user: &str,
        req: &Request<'_>,
    ) -> Result<(), BrokerError> {
        neuron.transfer_to(target_user);
        let saved = self.gateway.save_neuron(&neuron, &req.user).await?;
        tracing::info!(
            neuron = saved.id_label(),
            target_user,
            assigned_by = req.user.as_str(),
            "Neuron assigned"
        );
        self.reply_decision(&saved, target_user, true, req).await
    }

    async fn decide(
        &self,
        neuron_ids: &[i64],
        decision: bool,
        req: &Request<'_>,
    ) -> Result<(), BrokerError> {
        // The user the decision is about; older clients only send `user`.
        let requester = req
            .headers
            .get_str(TARGET_USER)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| req.user.clone());

        for neuron in self.fetch(neuron_ids, req).await? {
            let neuron = if decision {
                let mut neuron = neuron;
                neuron.transfer_to(&requester);
                self.gateway.update_neuron(&neuron, &req.user).await?
            } else {
                neuron
            };
            self.reply_decision(&neuron, &requester, decision, req)
                .await?;
        }
        Ok(())
    }

    async fn request_ownership(
        &self,
        neuron_ids: &[i64],
        req: &Request<'_>,
    ) -> Result<(), BrokerError> {
        for neuron in self.fetch(neuron_ids, req).await? {
            if neuron.is_owned_by(&self.system_owner) {
                let mut neuron = neuron;
                neuron.transfer_to(&req.user);
                let saved = self.gateway.update_neuron(&neuron, &req.user).await?;
                tracing::info!(neuron = saved.id_label(), user = req.user.as_str(), "Ownership granted");
                self.reply_decision(&saved, &req.user, true, req).await?;
            } else if neuron.is_owned_by(&req.user) {
                self.reply_decision(&neuron, &req.user, true, req).await?;
            } else {
                tracing::info!(
                    neuron = neuron.id_label(),
                    user = req.user.as_str(),
                    owner = neuron.owner_key.as_str(),
                    "Ownership refused"
                );
                self.reply_decision(&neuron, &req.user, false, req).await?;
            }
        }
        Ok(())
    }

    async fn fetch(&self, ids: &[i64], req: &Request<'_>) -> Result<Vec<Neuron>, BrokerError> {
        let neurons = self.gateway.get_neurons(ids, &req.user).await?;
        if neurons.len() < ids.len() {
            tracing::warn!(
                requested = ids.len(),
                found = neurons.len(),
                "Some requested neurons were not found"
            );
        }
        Ok(neurons)
    }

    async fn reply_decision(
        &self,
        neuron: &Neuron,
        user: &str,
        decision: bool,
        req: &Request<'_>,
    ) -> Result<(), BrokerError> {
        let mut headers = Headers::new()
            .with(MSG_TYPE, NeuronMessageType::NeuronOwnershipDecision.to_string())
            .with(USER, user)
            .with(DECISION, decision);
        if let Some(id) = neuron.id {
            headers.insert(TARGET_IDS, id.to_string());
        }
        if let Some(workspace) = &req.workspace {
            headers.insert(WORKSPACE, workspace.as_str());
        }
        self.replies
            .success(&Message::new(headers, encode_neuron(neuron)?))
            .await;
        Ok(())
    }
}

impl MessageHandler for NeuronHandler {
    fn on_message<'a>(
        &'a self,
        headers: &'a Headers,
        body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.handle(headers, body))
    }
}
