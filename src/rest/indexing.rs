use super::IndexingGateway;
use super::http::RestClient;
use crate::error::GatewayError;
use crate::model::Reference;
use reqwest::Method;
use std::future::Future;
use std::pin::Pin;

/// Indexing-service gateway. Calls run as the service itself, so no subject
/// header is attached.
pub struct HttpIndexingGateway {
    rest: RestClient,
}

impl HttpIndexingGateway {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

impl IndexingGateway for HttpIndexingGateway {
    fn index_doc_references<'a>(
        &'a self,
        refs: &'a [Reference],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.rest.endpoint("searchIndex")?;
            let request = self.rest.request(Method::POST, url, "").json(refs);
            self.rest.send(request).await.map(drop)
        })
    }

    fn remove_docs<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.rest.endpoint("searchIndex/docsToRemove")?;
            let request = self.rest.request(Method::POST, url, "").json(ids);
            self.rest.send(request).await.map(drop)
        })
    }

    fn add_ancestor_to_docs<'a>(
        &'a self,
        ancestor_id: i64,
        descendant_ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self
                .rest
                .endpoint(&format!("searchIndex/{ancestor_id}/descendants"))?;
            let request = self.rest.request(Method::PUT, url, "").json(descendant_ids);
            self.rest.send(request).await.map(drop)
        })
    }
}
