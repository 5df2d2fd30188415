use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use super::{IndexClient, SinkError};
use crate::config::SinkConfig;
use crate::document::Document;

/// Elasticsearch index and document API over HTTP.
#[derive(Debug, Clone)]
pub struct ElasticClient {
    http: Client,
    server: String,
}

impl ElasticClient {
    /// # Errors
    ///
    /// Errors if the HTTP client cannot be built.
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(SinkError::Client)?;

        Ok(ElasticClient { http, server: config.server.trim_end_matches('/').to_string() })
    }

    fn index_url(&self, index: &str) -> String {
        format!("{}/{index}", self.server)
    }

    fn document_url(&self, index: &str) -> String {
        format!("{}/{index}/_doc", self.server)
    }

    async fn rejection(response: Response) -> SinkError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        SinkError::Status { status, body }
    }
}

impl IndexClient for ElasticClient {
    fn ensure_index<'a>(
        &'a self,
        index: &'a str,
        mapping: &'a Value,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            let response = self.http.put(self.index_url(index)).json(mapping).send().await?;
            if response.status().is_success() {
                return Ok(());
            }

            match Self::rejection(response).await {
                SinkError::Status { status, body }
                    if status == StatusCode::BAD_REQUEST.as_u16() && already_exists(&body) =>
                {
                    Ok(())
                }
                err => Err(err),
            }
        }
        .boxed()
    }

    fn send<'a>(
        &'a self,
        index: &'a str,
        document: &'a Document,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            let response = self.http.post(self.document_url(index)).json(document).send().await?;
            match response.status().is_success() {
                true => Ok(()),
                false => Err(Self::rejection(response).await),
            }
        }
        .boxed()
    }
}

/// Whether an error body reports that the index already exists.
fn already_exists(body: &str) -> bool {
    serde_json::from_str::<Value>(body).is_ok_and(|body| {
        body.pointer("/error/type").and_then(Value::as_str)
            == Some("resource_already_exists_exception")
    })
}
