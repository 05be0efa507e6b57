//! Agent-tracking adapter. Automated tracing agents register, push neuron
//! updates and report completion; updates are relayed to workstations.

use super::neuron::NeuronMessageType;
use super::{MessageHandler, Replies, TARGET_IDS, USER, WORKSPACE, error_reply};
use crate::broker::{Headers, MSG_TYPE, Message};
use crate::error::{BrokerError, DecodeError};
use crate::model::Neuron;
use crate::rest::{AgentGateway, NeuronGateway};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

pub const AGENT_ID: &str = "agentId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMessageType {
    AgentRegister,
    AgentNeuronUpdate,
    AgentComplete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Register {
        agent_id: String,
        workspace: String,
    },
    NeuronUpdate {
        agent_id: String,
        workspace: String,
        neuron: Neuron,
    },
    Complete {
        agent_id: String,
        workspace: String,
    },
}

impl AgentMessage {
    pub fn decode(headers: &Headers, body: &[u8]) -> Result<Self, DecodeError> {
        let raw = headers
            .message_type()
            .ok_or(DecodeError::MissingHeader(MSG_TYPE))?;
        let kind =
            AgentMessageType::from_str(&raw).map_err(|_| DecodeError::UnknownType(raw.clone()))?;

        let agent_id = required(headers, AGENT_ID)?;
        let workspace = required(headers, WORKSPACE)?;
        Ok(match kind {
            AgentMessageType::AgentRegister => Self::Register {
                agent_id,
                workspace,
            },
            AgentMessageType::AgentNeuronUpdate => Self::NeuronUpdate {
                agent_id,
                workspace,
                neuron: serde_json::from_slice(body)
                    .map_err(|e| DecodeError::Body(e.to_string()))?,
            },
            AgentMessageType::AgentComplete => Self::Complete {
                agent_id,
                workspace,
            },
        })
    }

    pub fn kind(&self) -> AgentMessageType {
        match self {
            Self::Register { .. } => AgentMessageType::AgentRegister,
            Self::NeuronUpdate { .. } => AgentMessageType::AgentNeuronUpdate,
            Self::Complete { .. } => AgentMessageType::AgentComplete,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Self::Register { agent_id, .. }
            | Self::NeuronUpdate { agent_id, .. }
            | Self::Complete { agent_id, .. } => agent_id,
        }
    }
}

fn required(headers: &Headers, name: &'static str) -> Result<String, DecodeError> {
    headers
        .get_str(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or(DecodeError::MissingHeader(name))
}

pub struct AgentHandler {
    agents: Arc<dyn AgentGateway>,
    neurons: Arc<dyn NeuronGateway>,
    replies: Replies,
}

impl AgentHandler {
    pub fn new(
        agents: Arc<dyn AgentGateway>,
        neurons: Arc<dyn NeuronGateway>,
        replies: Replies,
    ) -> Self {
        Self {
            agents,
            neurons,
            replies,
        }
    }

    pub async fn handle(&self, headers: &Headers, body: &[u8]) {
        let message = match AgentMessage::decode(headers, body) {
            Ok(message) => message,
            Err(DecodeError::UnknownType(kind)) => {
                tracing::warn!(msg_type = kind.as_str(), "Ignoring unsupported agent message");
                return;
            }
            Err(e) => {
                tracing::warn!("Could not decode agent message: {e}");
                let reply = error_reply(headers, body, &format!("unable to process message: {e}"));
                self.replies.error(&reply).await;
                return;
            }
        };

        let kind = message.kind();
        let agent_id = message.agent_id().to_string();
        let outcome = AssertUnwindSafe(self.dispatch(message, headers, body))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handler panicked".to_string(),
        };

        tracing::error!(msg_type = %kind, agent_id = agent_id.as_str(), "Agent request failed: {failure}");
        let reply = error_reply(headers, body, &format!("{kind} failed for agent {agent_id}: {failure}"));
        self.replies.error(&reply).await;
    }

    async fn dispatch(
        &self,
        message: AgentMessage,
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        match message {
            AgentMessage::Register {
                agent_id,
                workspace,
            } => {
                self.agents
                    .register_agent(&agent_id, &workspace, &agent_id)
                    .await?;
                tracing::info!(agent_id = agent_id.as_str(), workspace = workspace.as_str(), "Agent registered");
                self.replies
                    .success(&Message::new(headers.clone(), body.to_vec()))
                    .await;
            }
            AgentMessage::NeuronUpdate {
                agent_id,
                workspace,
                neuron,
            } => {
                let saved = self.neurons.save_neuron(&neuron, &agent_id).await?;
                let payload =
                    serde_json::to_vec(&saved).map_err(|e| BrokerError::Other(e.into()))?;

                let mut reply = headers.clone();
                let mut relay = Headers::new()
                    .with(MSG_TYPE, NeuronMessageType::NeuronSaveNeurondata.to_string())
                    .with(USER, agent_id.as_str())
                    .with(WORKSPACE, workspace.as_str());
                if let Some(id) = saved.id {
                    reply.insert(TARGET_IDS, id.to_string());
                    relay.insert(TARGET_IDS, id.to_string());
                }
                tracing::debug!(agent_id = agent_id.as_str(), neuron = saved.id_label(), "Agent neuron saved");
                self.replies
                    .success(&Message::new(reply, payload.clone()))
                    .await;
                self.replies.forward(&Message::new(relay, payload)).await;
            }
            AgentMessage::Complete {
                agent_id,
                workspace,
            } => {
                self.agents
                    .complete_agent(&agent_id, &workspace, &agent_id)
                    .await?;
                tracing::info!(agent_id = agent_id.as_str(), workspace = workspace.as_str(), "Agent completed");
                let message = Message::new(headers.clone(), body.to_vec());
                self.replies.success(&message).await;
                self.replies.forward(&message).await;
            }
        }
        Ok(())
    }
}

impl MessageHandler for AgentHandler {
    fn on_message<'a>(
        &'a self,
        headers: &'a Headers,
        body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.handle(headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ERROR_PROCESSING, RecordingSink, SinkChain};
    use crate::error::GatewayError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        log: Mutex<Vec<String>>,
        reject: bool,
    }

    impl FakeBackend {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn note(&self, entry: String) -> Result<(), GatewayError> {
            self.log.lock().unwrap().push(entry);
            if self.reject {
                Err(GatewayError::Status {
                    url: "http://agents".into(),
                    status: 403,
                    body: "forbidden".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    impl AgentGateway for FakeBackend {
        fn register_agent<'a>(
            &'a self,
            agent_id: &'a str,
            workspace: &'a str,
            _subject: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
            Box::pin(async move { self.note(format!("register {agent_id} {workspace}")) })
        }

        fn complete_agent<'a>(
            &'a self,
            agent_id: &'a str,
            workspace: &'a str,
            _subject: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
            Box::pin(async move { self.note(format!("complete {agent_id} {workspace}")) })
        }
    }

    impl NeuronGateway for FakeBackend {
        fn get_neurons<'a>(
            &'a self,
            _ids: &'a [i64],
            _subject: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Neuron>, GatewayError>> + Send + 'a>>
        {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn create_neuron<'a>(
            &'a self,
            neuron: &'a Neuron,
            subject: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>> {
            Box::pin(async move {
                self.note(format!("create by {subject}"))?;
                let mut created = neuron.clone();
                created.id = Some(55);
                Ok(created)
            })
        }

        fn update_neuron<'a>(
            &'a self,
            neuron: &'a Neuron,
            subject: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>> {
            Box::pin(async move {
                self.note(format!("update by {subject}"))?;
                Ok(neuron.clone())
            })
        }

        fn remove_neuron<'a>(
            &'a self,
            _neuron: &'a Neuron,
            _subject: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Fixture {
        backend: Arc<FakeBackend>,
        success: Arc<RecordingSink>,
        error: Arc<RecordingSink>,
        forward: Arc<RecordingSink>,
        handler: AgentHandler,
    }

    fn fixture(backend: FakeBackend) -> Fixture {
        let backend = Arc::new(backend);
        let success = RecordingSink::new("success");
        let error = RecordingSink::new("error");
        let forward = RecordingSink::new("forward");
        let replies = Replies {
            success: SinkChain::new().then(success.clone()),
            error: SinkChain::new().then(error.clone()),
            forward: SinkChain::new().then(forward.clone()),
        };
        let handler = AgentHandler::new(backend.clone(), backend.clone(), replies);
        Fixture {
            backend,
            success,
            error,
            forward,
            handler,
        }
    }

    fn headers(kind: &str) -> Headers {
        Headers::new()
            .with(MSG_TYPE, kind)
            .with(AGENT_ID, "agent-7")
            .with(WORKSPACE, "12")
    }

    #[tokio::test]
    async fn register_replies_without_forwarding() {
        let f = fixture(FakeBackend::default());
        f.handler.handle(&headers("AGENT_REGISTER"), &[]).await;

        assert_eq!(f.backend.log(), vec!["register agent-7 12"]);
        assert_eq!(f.success.len(), 1);
        assert!(f.forward.is_empty());
    }

    #[tokio::test]
    async fn neuron_update_is_saved_and_relayed() {
        let f = fixture(FakeBackend::default());
        let neuron = Neuron::new("agent-7");
        let body = serde_json::to_vec(&neuron).unwrap();

        f.handler
            .handle(&headers("AGENT_NEURON_UPDATE"), &body)
            .await;

        assert_eq!(f.backend.log(), vec!["create by agent-7"]);
        let relayed = f.forward.messages();
        assert_eq!(relayed.len(), 1);
        assert_eq!(
            relayed[0].headers.message_type().as_deref(),
            Some("NEURON_SAVE_NEURONDATA")
        );
        assert_eq!(relayed[0].headers.get_str(TARGET_IDS).as_deref(), Some("55"));
        assert_eq!(relayed[0].headers.get_str(USER).as_deref(), Some("agent-7"));
        assert_eq!(f.success.messages()[0].headers.get_str(TARGET_IDS).as_deref(), Some("55"));
    }

    #[tokio::test]
    async fn completion_is_replied_and_forwarded() {
        let f = fixture(FakeBackend::default());
        f.handler.handle(&headers("AGENT_COMPLETE"), &[]).await;
        assert_eq!(f.backend.log(), vec!["complete agent-7 12"]);
        assert_eq!(f.success.len(), 1);
        assert_eq!(f.forward.len(), 1);
    }

    #[tokio::test]
    async fn gateway_rejection_becomes_error_reply() {
        let f = fixture(FakeBackend {
            reject: true,
            ..FakeBackend::default()
        });
        f.handler.handle(&headers("AGENT_COMPLETE"), &[]).await;

        assert!(f.success.is_empty());
        assert!(f.forward.is_empty());
        let errors = f.error.messages();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].headers.get_str("description").unwrap().contains("403"));
    }

    #[tokio::test]
    async fn missing_agent_id_is_error_processing() {
        let f = fixture(FakeBackend::default());
        let h = Headers::new()
            .with(MSG_TYPE, "AGENT_REGISTER")
            .with(WORKSPACE, "12");
        f.handler.handle(&h, &[]).await;

        assert!(f.backend.log().is_empty());
        let errors = f.error.messages();
        assert_eq!(errors[0].headers.message_type().as_deref(), Some(ERROR_PROCESSING));
    }

    #[tokio::test]
    async fn unknown_agent_type_is_dropped() {
        let f = fixture(FakeBackend::default());
        f.handler.handle(&headers("AGENT_PAUSE"), &[]).await;
        assert!(f.backend.log().is_empty());
        assert!(f.error.is_empty());
    }
}
