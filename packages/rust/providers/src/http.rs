//! HTTP provider variants: synchronous JSON and asynchronous task queue.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use cartograph_shared::{CartographError, ProviderEntry, Result};

use crate::USER_AGENT;
use crate::error::ProviderError;
use crate::model::{PollStatus, ProviderRequest, ProviderTicket};
use crate::provider::{Provider, poll_ready_ticket};

/// Connection settings shared by both HTTP variants.
struct HttpEndpoint {
    id: String,
    base_url: Url,
    api_key: Option<String>,
    client: Client,
}

impl HttpEndpoint {
    fn from_entry(entry: &ProviderEntry) -> Result<Self> {
        let raw = entry.base_url.as_deref().ok_or_else(|| {
            CartographError::config(format!("provider '{}' needs a base_url", entry.id))
        })?;
        // A trailing slash keeps `join` from replacing the last path segment
        let base_url = Url::parse(&format!("{}/", raw.trim_end_matches('/'))).map_err(|e| {
            CartographError::config(format!("provider '{}' has invalid base_url: {e}", entry.id))
        })?;

        let api_key = entry
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty());

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(entry.timeout_secs.max(1)))
            .build()
            .map_err(|e| CartographError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            id: entry.id.clone(),
            base_url,
            api_key,
            client,
        })
    }

    fn url(&self, path: &str) -> std::result::Result<Url, ProviderError> {
        self.base_url.join(path).map_err(|e| ProviderError::Rejected {
            status: 0,
            message: format!("bad request path {path}: {e}"),
        })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send_json(
        &self,
        builder: RequestBuilder,
    ) -> std::result::Result<serde_json::Value, ProviderError> {
        let response = self.authorize(builder).send().await?;
        let response = check_status(response).await?;
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

/// Map a non-success response onto the provider error taxonomy.
async fn check_status(response: Response) -> std::result::Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), &body))
}

// ---------------------------------------------------------------------------
// HttpJsonProvider
// ---------------------------------------------------------------------------

/// Synchronous request/response source: `POST {base}/{kind}` answers with
/// the payload.
pub struct HttpJsonProvider {
    endpoint: HttpEndpoint,
}

impl HttpJsonProvider {
    pub fn from_entry(entry: &ProviderEntry) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::from_entry(entry)?,
        })
    }
}

#[async_trait]
impl Provider for HttpJsonProvider {
    fn id(&self) -> &str {
        &self.endpoint.id
    }

    async fn submit(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderTicket, ProviderError> {
        let url = self.endpoint.url(request.kind())?;
        debug!(provider = %self.endpoint.id, %url, "submitting request");
        let payload = self
            .endpoint
            .send_json(self.endpoint.client.post(url).json(request))
            .await?;
        Ok(ProviderTicket::ready(
            &self.endpoint.id,
            Uuid::now_v7().to_string(),
            payload,
        ))
    }

    async fn poll(&self, ticket: &ProviderTicket) -> std::result::Result<PollStatus, ProviderError> {
        Ok(poll_ready_ticket(ticket))
    }
}

// ---------------------------------------------------------------------------
// QueuedHttpProvider
// ---------------------------------------------------------------------------

/// Asynchronous three-phase source: post a task, check readiness, fetch.
///
/// - `POST {base}/tasks` returns `{"id": ..}`
/// - `GET {base}/tasks/{id}/ready` returns `{"ready": bool, "status": ..}`
/// - `GET {base}/tasks/{id}` returns the payload
pub struct QueuedHttpProvider {
    endpoint: HttpEndpoint,
}

#[derive(Deserialize)]
struct TaskCreated {
    id: String,
}

#[derive(Deserialize)]
struct TaskReadiness {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl QueuedHttpProvider {
    pub fn from_entry(entry: &ProviderEntry) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::from_entry(entry)?,
        })
    }
}

#[async_trait]
impl Provider for QueuedHttpProvider {
    fn id(&self) -> &str {
        &self.endpoint.id
    }

    async fn submit(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderTicket, ProviderError> {
        let url = self.endpoint.url("tasks")?;
        let body = self
            .endpoint
            .send_json(self.endpoint.client.post(url).json(request))
            .await?;
        let created: TaskCreated = serde_json::from_value(body)
            .map_err(|e| ProviderError::Malformed(format!("task id missing: {e}")))?;
        debug!(provider = %self.endpoint.id, task_id = %created.id, "task posted");
        Ok(ProviderTicket::pending(&self.endpoint.id, created.id))
    }

    async fn poll(&self, ticket: &ProviderTicket) -> std::result::Result<PollStatus, ProviderError> {
        if ticket.payload.is_some() {
            return Ok(poll_ready_ticket(ticket));
        }

        let ready_url = self
            .endpoint
            .url(&format!("tasks/{}/ready", ticket.task_id))?;
        let body = self
            .endpoint
            .send_json(self.endpoint.client.get(ready_url))
            .await?;
        let readiness: TaskReadiness = serde_json::from_value(body)
            .map_err(|e| ProviderError::Malformed(format!("readiness: {e}")))?;

        if readiness.status.as_deref() == Some("failed") {
            return Ok(PollStatus::Failed(
                readiness
                    .error
                    .unwrap_or_else(|| format!("task {} failed", ticket.task_id)),
            ));
        }
        if !readiness.ready {
            return Ok(PollStatus::Pending);
        }

        let result_url = self.endpoint.url(&format!("tasks/{}", ticket.task_id))?;
        let payload = self
            .endpoint
            .send_json(self.endpoint.client.get(result_url))
            .await?;
        Ok(PollStatus::Ready(payload))
    }
}
