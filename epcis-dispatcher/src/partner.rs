//! Partner network channels: document submission over mutual TLS, and delivery status
//! lookups against the partner dashboard.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use epcis_common::dispatch::{RecordId, TransactionId};
use epcis_common::timestamp::parse_timestamp;
use futures::StreamExt;
use reqwest::{header, Certificate, Client, Identity, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::DispatchDocument;
use crate::error::ChannelError;

/// Error bodies are cut to this many bytes before they reach a record.
const MAX_RESPONSE_BODY: usize = 2048;
/// Cached tokens are dropped this long before the partner expires them.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;
const MAX_SEARCH_PAGES: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub transaction_id: TransactionId,
    pub accepted_at: DateTime<Utc>,
}

/// Raw status of a transaction as reported by the partner.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerStatus {
    pub status_code: Option<i64>,
    pub status_message: String,
}

#[async_trait]
pub trait SubmissionChannel: Send + Sync {
    async fn submit(
        &self,
        document: &DispatchDocument,
        cancel: &CancellationToken,
    ) -> Result<Submission, ChannelError>;
}

/// Answers of a status query over several transactions, one per transaction asked for.
pub type StatusAnswers = HashMap<TransactionId, Result<PartnerStatus, ChannelError>>;

#[async_trait]
pub trait StatusChannel: Send + Sync {
    async fn query_status(
        &self,
        transaction_id: &TransactionId,
        cancel: &CancellationToken,
    ) -> Result<PartnerStatus, ChannelError>;

    /// Status of every transaction in `transaction_ids`. An error for the whole call
    /// means none of them could be looked up. Asks one at a time unless overridden.
    async fn query_statuses(
        &self,
        transaction_ids: &[TransactionId],
        cancel: &CancellationToken,
    ) -> Result<StatusAnswers, ChannelError> {
        let mut answers = HashMap::with_capacity(transaction_ids.len());
        for transaction_id in transaction_ids {
            match self.query_status(transaction_id, cancel).await {
                Err(ChannelError::Cancelled) => return Err(ChannelError::Cancelled),
                answer => {
                    answers.insert(transaction_id.clone(), answer);
                }
            }
        }
        Ok(answers)
    }
}

/// Race a partner call against the cancellation token. The call is dropped, and with it
/// any in-flight request, as soon as the token fires.
pub async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, ChannelError>
where
    F: Future<Output = Result<T, ChannelError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChannelError::Cancelled),
        result = call => result,
    }
}

/// Read at most `n` bytes of a response body, lossily decoded.
pub async fn first_n_bytes_of_response(response: Response, n: usize) -> String {
    let mut body = response.bytes_stream();
    let mut buffer = Vec::with_capacity(n);

    while let Some(chunk) = body.next().await {
        let Ok(chunk) = chunk else {
            break;
        };
        let remaining = n - buffer.len();
        buffer.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        if buffer.len() >= n {
            break;
        }
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

async fn error_for_status(response: Response) -> Result<Response, ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = first_n_bytes_of_response(response, MAX_RESPONSE_BODY).await;
    Err(ChannelError::from_status(status, body))
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    created_at: Option<String>,
}

/// Posts EPCIS documents to the partner storage endpoint.
pub struct PartnerSubmitClient {
    client: Client,
    endpoint: String,
}

impl PartnerSubmitClient {
    /// Build a client authenticating with `identity` and trusting only `ca`.
    pub fn new(
        endpoint: &str,
        identity: Identity,
        ca: Certificate,
        timeout: time::Duration,
    ) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .identity(identity)
            .add_root_certificate(ca)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .user_agent("EPCIS Dispatcher")
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Configuration(e.to_string()))?;

        Ok(Self::with_client(endpoint, client))
    }

    /// Load the PEM encoded client certificate, its PKCS#8 key and the partner CA.
    pub fn from_files(
        endpoint: &str,
        cert_file: &str,
        key_file: &str,
        ca_file: &str,
        timeout: time::Duration,
    ) -> Result<Self, ChannelError> {
        let read = |path: &str| {
            std::fs::read(path)
                .map_err(|e| ChannelError::Configuration(format!("could not read {path}: {e}")))
        };

        let identity = Identity::from_pkcs8_pem(&read(cert_file)?, &read(key_file)?)
            .map_err(|e| ChannelError::Configuration(format!("invalid client identity: {e}")))?;
        let ca = Certificate::from_pem(&read(ca_file)?)
            .map_err(|e| ChannelError::Configuration(format!("invalid partner CA: {e}")))?;

        Self::new(endpoint, identity, ca, timeout)
    }

    pub fn with_client(endpoint: &str, client: Client) -> Self {
        Self {
            client,
            endpoint: endpoint.to_owned(),
        }
    }

    async fn post(&self, document: &DispatchDocument) -> Result<Submission, ChannelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "application/xml")
            .body(document.payload.clone())
            .send()
            .await?;
        let response = error_for_status(response).await?;

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Decode(e.to_string()))?;

        let transaction_id = body
            .id
            .as_ref()
            .and_then(RecordId::from_value)
            .and_then(|id| TransactionId::new(id.as_str()))
            .ok_or_else(|| ChannelError::Decode("response has no transaction id".to_owned()))?;

        let accepted_at = match body.created_at.as_deref().map(parse_timestamp) {
            Some(Some(at)) => at,
            Some(None) => {
                warn!(
                    transaction_id = %transaction_id,
                    "unparseable acceptance time, using local clock"
                );
                Utc::now()
            }
            None => Utc::now(),
        };

        Ok(Submission {
            transaction_id,
            accepted_at,
        })
    }
}

#[async_trait]
impl SubmissionChannel for PartnerSubmitClient {
    async fn submit(
        &self,
        document: &DispatchDocument,
        cancel: &CancellationToken,
    ) -> Result<Submission, ChannelError> {
        debug!(
            target_location = %document.target_location,
            bytes = document.payload.len(),
            "submitting document to partner"
        );
        cancellable(cancel, self.post(document)).await
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Dashboard session token with its expiry. Owned by whoever builds the status client,
/// so tests and several clients can share or replace it.
#[derive(Debug, Default)]
pub struct TokenCache {
    entry: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached token, unless it is due to expire at `now`.
    pub fn get(&self, now: DateTime<Utc>) -> Option<String> {
        let entry = self
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entry
            .as_ref()
            .filter(|cached| now < cached.expires_at)
            .map(|cached| cached.token.clone())
    }

    /// Keep `token` for `expires_in_secs` less the safety margin.
    pub fn set(&self, token: String, expires_in_secs: i64, now: DateTime<Utc>) {
        let expires_at = now + Duration::seconds(expires_in_secs - TOKEN_EXPIRY_MARGIN_SECS);
        let mut entry = self
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *entry = Some(CachedToken { token, expires_at });
    }

    pub fn invalidate(&self) {
        let mut entry = self
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *entry = None;
    }
}

#[derive(Debug, Clone)]
pub struct DashboardCredentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    username: &'a str,
    password: &'a str,
    client_id: &'a str,
    scope: &'static str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<LogEntry>,
}

#[derive(Deserialize)]
struct LogEntry {
    #[serde(rename = "logGuid", default)]
    log_guid: Option<String>,
    #[serde(default)]
    source_file: Option<String>,
    #[serde(rename = "statusCode", default)]
    status_code: Option<i64>,
    #[serde(rename = "statusMsg", default)]
    status_message: Option<String>,
}

impl LogEntry {
    fn is_for(&self, transaction_id: &TransactionId) -> bool {
        let id = transaction_id.as_str();
        self.log_guid.as_deref() == Some(id)
            || self
                .source_file
                .as_deref()
                .and_then(|file| file.strip_prefix(id))
                .map_or(false, |rest| rest.starts_with('/'))
    }
}

/// Looks up transaction status in the partner dashboard's company log.
pub struct PartnerStatusClient {
    client: Client,
    dashboard_url: String,
    company_id: String,
    credentials: DashboardCredentials,
    lookback: Duration,
    tokens: Arc<TokenCache>,
}

impl PartnerStatusClient {
    pub fn new(
        dashboard_url: &str,
        company_id: &str,
        credentials: DashboardCredentials,
        lookback_days: u32,
        tokens: Arc<TokenCache>,
        timeout: time::Duration,
    ) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .user_agent("EPCIS Dispatcher")
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            dashboard_url: dashboard_url.trim_end_matches('/').to_owned(),
            company_id: company_id.to_owned(),
            credentials,
            lookback: Duration::days(i64::from(lookback_days)),
            tokens,
        })
    }

    async fn token(&self) -> Result<String, ChannelError> {
        let now = Utc::now();
        if let Some(token) = self.tokens.get(now) {
            return Ok(token);
        }

        let response = self
            .client
            .post(format!("{}/token", self.dashboard_url))
            .json(&TokenRequest {
                username: &self.credentials.username,
                password: &self.credentials.password,
                client_id: &self.credentials.client_id,
                scope: "openid",
            })
            .send()
            .await?;
        let response = error_for_status(response).await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Decode(e.to_string()))?;

        info!(expires_in = body.expires_in, "obtained partner dashboard token");
        self.tokens.set(body.access_token.clone(), body.expires_in, now);
        Ok(body.access_token)
    }

    async fn search_page(
        &self,
        token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: u32,
    ) -> Result<SearchPage, ChannelError> {
        let response = self
            .client
            .get(format!(
                "{}/de-status/company/{}/log/",
                self.dashboard_url, self.company_id
            ))
            .bearer_auth(token)
            .query(&[
                ("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("page", page.to_string()),
            ])
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate();
        }
        let response = error_for_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ChannelError::Decode(e.to_string()))
    }

    /// Walk the company log over the lookback window until every transaction in
    /// `wanted` has been seen or the log ends. The first entry for a transaction wins.
    async fn scan(
        &self,
        wanted: &[TransactionId],
    ) -> Result<HashMap<TransactionId, PartnerStatus>, ChannelError> {
        let mut found = HashMap::with_capacity(wanted.len());
        if wanted.is_empty() {
            return Ok(found);
        }

        let token = self.token().await?;
        let end = Utc::now();
        let start = end - self.lookback;

        for page in 1..=MAX_SEARCH_PAGES {
            let results = self.search_page(&token, start, end, page).await?;

            for entry in &results.results {
                for transaction_id in wanted {
                    if !found.contains_key(transaction_id) && entry.is_for(transaction_id) {
                        found.insert(
                            transaction_id.clone(),
                            PartnerStatus {
                                status_code: entry.status_code,
                                status_message: entry.status_message.clone().unwrap_or_default(),
                            },
                        );
                    }
                }
            }

            if found.len() == wanted.len() || results.next.is_none() {
                break;
            }
            if page == MAX_SEARCH_PAGES {
                warn!(pages = page, "reached partner log pagination limit");
            }
        }

        debug!(
            wanted = wanted.len(),
            found = found.len(),
            "searched partner company log"
        );
        Ok(found)
    }
}

#[async_trait]
impl StatusChannel for PartnerStatusClient {
    async fn query_status(
        &self,
        transaction_id: &TransactionId,
        cancel: &CancellationToken,
    ) -> Result<PartnerStatus, ChannelError> {
        let wanted = std::slice::from_ref(transaction_id);
        let mut found = cancellable(cancel, self.scan(wanted)).await?;
        found
            .remove(transaction_id)
            .ok_or_else(|| ChannelError::NotFound(transaction_id.to_string()))
    }

    /// One pass over the log answers the whole batch.
    async fn query_statuses(
        &self,
        transaction_ids: &[TransactionId],
        cancel: &CancellationToken,
    ) -> Result<StatusAnswers, ChannelError> {
        let mut found = cancellable(cancel, self.scan(transaction_ids)).await?;

        Ok(transaction_ids
            .iter()
            .map(|transaction_id| {
                let answer = found
                    .remove(transaction_id)
                    .ok_or_else(|| ChannelError::NotFound(transaction_id.to_string()));
                (transaction_id.clone(), answer)
            })
            .collect())
    }
}
