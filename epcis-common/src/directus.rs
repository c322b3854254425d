use std::time;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::dispatch::RecordId;
use crate::store::{DocumentStore, Fields, Query, StoreError};

/// Responses from the items API wrap their payload in `data`.
#[derive(Deserialize, Debug)]
struct Envelope<T> {
    data: T,
}

/// `DocumentStore` backed by the document store's REST items API.
pub struct DirectusStore {
    base_url: String,
    client: reqwest::Client,
}

impl DirectusStore {
    pub fn new(
        base_url: &str,
        api_key: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, StoreError> {
        let mut headers = header::HeaderMap::new();
        if !api_key.is_empty() {
            let mut auth = header::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| StoreError::Client(e.to_string()))?;
            auth.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, auth);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("EPCIS Dispatcher")
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Client(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn items_url(&self, collection: &str) -> String {
        format!("{}/items/{}", self.base_url, collection)
    }
}

/// Turn any non-2XX response into a `StoreError`, keeping the body for context.
async fn check_status(
    response: reqwest::Response,
    collection: &str,
    id: &str,
) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND && !id.is_empty() {
        return Err(StoreError::NotFound {
            collection: collection.to_owned(),
            id: id.to_owned(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl DocumentStore for DirectusStore {
    async fn query_records(
        &self,
        collection: &str,
        query: &Query,
    ) -> Result<Vec<Fields>, StoreError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(filter) = &query.filter {
            params.push(("filter", filter.to_json().to_string()));
        }
        if !query.fields.is_empty() {
            params.push(("fields", query.fields.join(",")));
        }
        if !query.sort.is_empty() {
            params.push(("sort", query.sort.join(",")));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(offset) = query.offset {
            params.push(("offset", offset.to_string()));
        }

        debug!(collection, ?params, "querying records");

        let response = self
            .client
            .get(self.items_url(collection))
            .query(&params)
            .send()
            .await?;
        let response = check_status(response, collection, "").await?;

        let envelope: Envelope<Vec<Fields>> = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn create_record(
        &self,
        collection: &str,
        fields: Fields,
    ) -> Result<RecordId, StoreError> {
        let response = self
            .client
            .post(self.items_url(collection))
            .json(&fields)
            .send()
            .await?;
        let response = check_status(response, collection, "").await?;

        let envelope: Envelope<Fields> = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        envelope
            .data
            .get("id")
            .and_then(RecordId::from_value)
            .ok_or(StoreError::MissingId)
    }

    async fn update_record(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Fields,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .patch(format!("{}/{}", self.items_url(collection), id))
            .json(&Value::Object(fields))
            .send()
            .await?;
        check_status(response, collection, id.as_str()).await?;

        Ok(())
    }

    async fn read_file(&self, file_id: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .client
            .get(format!("{}/assets/{}", self.base_url, file_id))
            .send()
            .await?;
        let response = check_status(response, "files", file_id).await?;

        Ok(response.bytes().await?.to_vec())
    }
}
