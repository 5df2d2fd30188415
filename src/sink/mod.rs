//! Delivery of documents to the index store.

mod elastic;

pub use elastic::ElasticClient;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::document::Document;

/// Index store the documents are written to.
pub trait IndexClient: Send + Sync {
    /// Creates `index` with `mapping`; an existing index is left untouched and is not an error.
    fn ensure_index<'a>(
        &'a self,
        index: &'a str,
        mapping: &'a Value,
    ) -> BoxFuture<'a, Result<(), SinkError>>;

    /// Stores `document` as a single record of `index`.
    fn send<'a>(&'a self, index: &'a str, document: &'a Document)
        -> BoxFuture<'a, Result<(), SinkError>>;
}

/// Minimal mapping declaring the metadata fields.
#[must_use]
pub fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "@timestamp": { "type": "date" },
                "@host-id": { "type": "keyword" },
            }
        }
    })
}

/// Outcome of one tick's report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The document was lost; the failure has been logged.
    Dropped,
    /// Final tick without a document.
    Flushed,
}

/// Ensures the target index exists, then submits documents without retrying.
pub struct SinkAdapter<C> {
    client: C,
    index: String,
    mapping: Value,
    index_ready: bool,
}

impl<C> SinkAdapter<C>
where
    C: IndexClient,
{
    pub fn new(client: C, index: impl Into<String>) -> Self {
        SinkAdapter { client, index: index.into(), mapping: index_mapping(), index_ready: false }
    }

    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Reports one tick; `None` is the final flush tick and sends nothing.
    pub async fn report(&mut self, document: Option<&Document>) -> Delivery {
        let Some(document) = document else {
            return Delivery::Flushed;
        };

        if !self.index_ready {
            if let Err(err) = self.client.ensure_index(&self.index, &self.mapping).await {
                warn!(index = %self.index, %err, "Failed to create index, dropping document");

                return Delivery::Dropped;
            }
            self.index_ready = true;
        }

        match self.client.send(&self.index, document).await {
            Ok(()) => Delivery::Sent,
            Err(err) => {
                warn!(index = %self.index, %err, "Failed to send document");

                Delivery::Dropped
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Build HTTP client; err={0}")]
    Client(reqwest::Error),
    #[error("Request; err={0}")]
    Request(#[from] reqwest::Error),
    #[error("Rejected; status={status}; body={body}")]
    Status { status: u16, body: String },
}
