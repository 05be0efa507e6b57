use super::AgentGateway;
use super::http::RestClient;
use crate::error::GatewayError;
use reqwest::Method;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentSession<'a> {
    agent_id: &'a str,
    workspace: &'a str,
}

/// Agent-tracking service gateway.
pub struct HttpAgentGateway {
    rest: RestClient,
}

impl HttpAgentGateway {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

impl AgentGateway for HttpAgentGateway {
    fn register_agent<'a>(
        &'a self,
        agent_id: &'a str,
        workspace: &'a str,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.rest.endpoint("agents")?;
            let request = self
                .rest
                .request(Method::PUT, url, subject)
                .json(&AgentSession { agent_id, workspace });
            self.rest.send(request).await.map(drop)
        })
    }

    fn complete_agent<'a>(
        &'a self,
        agent_id: &'a str,
        workspace: &'a str,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let mut url = self.rest.endpoint("agents/complete")?;
            url.query_pairs_mut().append_pair("agentId", agent_id);
            let request = self
                .rest
                .request(Method::POST, url, subject)
                .json(&AgentSession { agent_id, workspace });
            self.rest.send(request).await.map(drop)
        })
    }
}
