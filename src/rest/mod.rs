//! REST backends the brokers talk to. Each is a narrow trait so handlers
//! can be exercised against in-process fakes.

pub mod agent;
pub mod http;
pub mod indexing;
pub mod neuron;

use crate::error::GatewayError;
use crate::model::{Neuron, Reference};
use std::future::Future;
use std::pin::Pin;

pub use agent::HttpAgentGateway;
pub use http::RestClient;
pub use indexing::HttpIndexingGateway;
pub use neuron::HttpNeuronGateway;

/// Neuron persistence.
pub trait NeuronGateway: Send + Sync {
    fn get_neurons<'a>(
        &'a self,
        ids: &'a [i64],
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Neuron>, GatewayError>> + Send + 'a>>;

    fn create_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>>;

    fn update_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>>;

    fn remove_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;

    /// Creates when the neuron has no id yet, updates otherwise.
    fn save_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>> {
        if neuron.id.is_none() {
            self.create_neuron(neuron, subject)
        } else {
            self.update_neuron(neuron, subject)
        }
    }
}

/// Document search index.
pub trait IndexingGateway: Send + Sync {
    fn index_doc_references<'a>(
        &'a self,
        refs: &'a [Reference],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;

    fn remove_docs<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;

    fn add_ancestor_to_docs<'a>(
        &'a self,
        ancestor_id: i64,
        descendant_ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;
}

/// Agent session tracking.
pub trait AgentGateway: Send + Sync {
    fn register_agent<'a>(
        &'a self,
        agent_id: &'a str,
        workspace: &'a str,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;

    fn complete_agent<'a>(
        &'a self,
        agent_id: &'a str,
        workspace: &'a str,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;
}
