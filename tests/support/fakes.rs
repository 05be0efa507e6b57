#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use neuronbroker::BrokerConfig;
use neuronbroker::broker::memory::{InMemoryBroker, InMemoryOpener};
use neuronbroker::error::GatewayError;
use neuronbroker::model::{Neuron, Reference};
use neuronbroker::rest::{AgentGateway, IndexingGateway, NeuronGateway};

pub const INBOUND: &str = "ToBroker";
pub const SUCCESS: &str = "ModelRefresh";
pub const ERRORS: &str = "ModelErrors";
pub const FORWARD: &str = "Workstation";

/// A broker with the inbound queue and reply exchanges declared.
pub fn broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.declare_queue(INBOUND);
    for exchange in [SUCCESS, ERRORS, FORWARD] {
        broker.declare_exchange(exchange);
    }
    broker
}

pub fn opener(broker: &InMemoryBroker) -> Arc<InMemoryOpener> {
    Arc::new(InMemoryOpener::new(broker.clone()))
}

pub fn config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.message.host = "memory".into();
    config.message.receive_queue = INBOUND.into();
    config.message.success_exchange = Some(SUCCESS.into());
    config.message.error_exchange = Some(ERRORS.into());
    config.message.forward_exchange = Some(FORWARD.into());
    config.message.consumer_threads = 2;
    config
}

/// Polls `done` until it holds, sleeping between checks.
pub async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[derive(Default)]
pub struct NeuronStore {
    neurons: Mutex<HashMap<i64, Neuron>>,
    writes: Mutex<Vec<(i64, String)>>,
}

impl NeuronStore {
    pub fn with(neurons: impl IntoIterator<Item = Neuron>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut map = store.neurons.lock().unwrap();
            for neuron in neurons {
                map.insert(neuron.id.unwrap(), neuron);
            }
        }
        Arc::new(store)
    }

    pub fn get(&self, id: i64) -> Option<Neuron> {
        self.neurons.lock().unwrap().get(&id).cloned()
    }

    /// `(neuron id, subject)` for every create/update.
    pub fn writes(&self) -> Vec<(i64, String)> {
        self.writes.lock().unwrap().clone()
    }

    fn put(&self, neuron: Neuron, subject: &str) -> Neuron {
        let mut map = self.neurons.lock().unwrap();
        let id = neuron.id.unwrap_or_else(|| map.keys().max().copied().unwrap_or(0) + 1);
        let mut stored = neuron;
        stored.id = Some(id);
        map.insert(id, stored.clone());
        self.writes.lock().unwrap().push((id, subject.to_string()));
        stored
    }
}

impl NeuronGateway for NeuronStore {
    fn get_neurons<'a>(
        &'a self,
        ids: &'a [i64],
        _subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Neuron>, GatewayError>> + Send + 'a>> {
        Box::pin(async move { Ok(ids.iter().filter_map(|id| self.get(*id)).collect()) })
    }

    fn create_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.put(neuron.clone(), subject)) })
    }

    fn update_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.put(neuron.clone(), subject)) })
    }

    fn remove_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        _subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(id) = neuron.id {
                self.neurons.lock().unwrap().remove(&id);
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexCall {
    Index(Vec<Reference>),
    Remove(Vec<i64>),
    Ancestor(i64, Vec<i64>),
}

#[derive(Default)]
pub struct SearchIndex {
    calls: Mutex<Vec<IndexCall>>,
}

impl SearchIndex {
    pub fn calls(&self) -> Vec<IndexCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: IndexCall) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl IndexingGateway for SearchIndex {
    fn index_doc_references<'a>(
        &'a self,
        refs: &'a [Reference],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move { self.record(IndexCall::Index(refs.to_vec())) })
    }

    fn remove_docs<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move { self.record(IndexCall::Remove(ids.to_vec())) })
    }

    fn add_ancestor_to_docs<'a>(
        &'a self,
        ancestor_id: i64,
        descendant_ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(IndexCall::Ancestor(ancestor_id, descendant_ids.to_vec()))
        })
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    events: Mutex<Vec<String>>,
}

impl AgentRegistry {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl AgentGateway for AgentRegistry {
    fn register_agent<'a>(
        &'a self,
        agent_id: &'a str,
        workspace: &'a str,
        _subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            self.events
                .lock()
                .unwrap()
                .push(format!("register {agent_id}@{workspace}"));
            Ok(())
        })
    }

    fn complete_agent<'a>(
        &'a self,
        agent_id: &'a str,
        workspace: &'a str,
        _subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            self.events
                .lock()
                .unwrap()
                .push(format!("complete {agent_id}@{workspace}"));
            Ok(())
        })
    }
}
