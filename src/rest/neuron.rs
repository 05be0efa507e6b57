use super::NeuronGateway;
use super::http::RestClient;
use crate::error::GatewayError;
use crate::model::Neuron;
use reqwest::Method;
use std::future::Future;
use std::pin::Pin;

const NEURON_PATH: &str = "workspace/neuron";
const NEURONS_PATH: &str = "workspace/neurons";

/// Persistence-service gateway for neuron metadata.
pub struct HttpNeuronGateway {
    rest: RestClient,
}

impl HttpNeuronGateway {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

impl NeuronGateway for HttpNeuronGateway {
    fn get_neurons<'a>(
        &'a self,
        ids: &'a [i64],
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Neuron>, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let joined = ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let url = self.rest.endpoint(NEURONS_PATH)?;
            let request = self
                .rest
                .request(Method::GET, url, subject)
                .query(&[("ids", joined)]);
            self.rest.send_json(request).await
        })
    }

    fn create_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.rest.endpoint(NEURON_PATH)?;
            let request = self.rest.request(Method::PUT, url, subject).json(neuron);
            self.rest.send_json(request).await
        })
    }

    fn update_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Neuron, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.rest.endpoint(NEURON_PATH)?;
            let request = self.rest.request(Method::POST, url, subject).json(neuron);
            self.rest.send_json(request).await
        })
    }

    fn remove_neuron<'a>(
        &'a self,
        neuron: &'a Neuron,
        subject: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(id) = neuron.id else {
                return Err(GatewayError::Request {
                    url: NEURON_PATH.to_string(),
                    message: "cannot remove a neuron without an id".into(),
                });
            };
            let url = self.rest.endpoint(NEURON_PATH)?;
            let request = self
                .rest
                .request(Method::DELETE, url, subject)
                .query(&[("neuronId", id)]);
            self.rest.send(request).await.map(drop)
        })
    }
}
