//! Request, ticket, and canonical payload types shared by all providers.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use cartograph_shared::AgentError;

// ---------------------------------------------------------------------------
// Requests and tickets
// ---------------------------------------------------------------------------

/// What an agent asks a provider for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderRequest {
    SerpQuery {
        keywords: Vec<String>,
        geo: String,
        language: String,
    },
    BacklinkMetrics {
        domain: String,
    },
    TechFingerprint {
        domain: String,
    },
    PageFetch {
        domain: String,
    },
}

impl ProviderRequest {
    /// Stable name of the request kind (also the HTTP path segment).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SerpQuery { .. } => "serp_query",
            Self::BacklinkMetrics { .. } => "backlink_metrics",
            Self::TechFingerprint { .. } => "tech_fingerprint",
            Self::PageFetch { .. } => "page_fetch",
        }
    }

    /// The domain the request is about, if any.
    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::SerpQuery { .. } => None,
            Self::BacklinkMetrics { domain }
            | Self::TechFingerprint { domain }
            | Self::PageFetch { domain } => Some(domain),
        }
    }
}

/// Handle returned by `submit`.
///
/// Synchronous providers return a ticket that already carries the payload,
/// so the first poll is `Ready`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTicket {
    pub provider_id: String,
    pub task_id: String,
    pub payload: Option<serde_json::Value>,
}

impl ProviderTicket {
    pub fn ready(provider_id: &str, task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            task_id: task_id.into(),
            payload: Some(payload),
        }
    }

    pub fn pending(provider_id: &str, task_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            task_id: task_id.into(),
            payload: None,
        }
    }
}

/// Result of polling a ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Ready(serde_json::Value),
    Failed(String),
}

/// Decode a provider payload into a canonical type. A payload that does not
/// decode is Fatal: retrying will not fix it.
pub fn decode_payload<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, AgentError> {
    serde_json::from_value(value).map_err(|e| AgentError::fatal(format!("malformed payload: {e}")))
}

// ---------------------------------------------------------------------------
// Canonical payloads
// ---------------------------------------------------------------------------

/// One organic search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerpResult {
    pub keyword: String,
    pub domain: String,
    #[serde(default)]
    pub url: String,
    pub position: u32,
    /// Result-page features present for the query (`shopping_carousel`, ...).
    #[serde(default)]
    pub serp_features: BTreeMap<String, bool>,
    #[serde(default)]
    pub source: String,
    /// SHA-256 of the serialized result, for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload_hash: Option<String>,
}

impl SerpResult {
    /// Hash of the result with its own hash field cleared.
    pub fn compute_hash(&self) -> String {
        let mut unhashed = self.clone();
        unhashed.raw_payload_hash = None;
        let bytes = serde_json::to_vec(&unhashed).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerpPayload {
    #[serde(default)]
    pub results: Vec<SerpResult>,
}

impl SerpPayload {
    /// Fill in any missing `raw_payload_hash`.
    pub fn seal(mut self) -> Self {
        for result in &mut self.results {
            if result.raw_payload_hash.is_none() {
                result.raw_payload_hash = Some(result.compute_hash());
            }
        }
        self
    }
}

/// Authority, link and traffic metrics for a domain. Any field may be
/// missing depending on which source answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacklinkPayload {
    pub domain: String,
    #[serde(default)]
    pub domain_rating: Option<i64>,
    #[serde(default)]
    pub domain_authority: Option<i64>,
    #[serde(default)]
    pub page_authority: Option<i64>,
    #[serde(default)]
    pub spam_score: Option<i64>,
    #[serde(default)]
    pub referring_domains_count: Option<u64>,
    #[serde(default)]
    pub backlinks_count: Option<u64>,
    #[serde(default)]
    pub organic_traffic_estimate: Option<u64>,
    #[serde(default)]
    pub organic_keywords_count: Option<u64>,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedTech {
    pub name: String,
    /// Detection confidence, 0 to 1.
    pub confidence: f64,
}

/// Technology fingerprint of a domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechPayload {
    pub domain: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub platform_confidence: f64,
    #[serde(default)]
    pub technologies: Vec<DetectedTech>,
    #[serde(default)]
    pub detected_via: String,
}

/// A fetched homepage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PagePayload {
    pub domain: String,
    #[serde(default)]
    pub html: String,
    /// Response headers, names lowercased.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Same-host URLs linked from the page.
    #[serde(default)]
    pub sample_urls: Vec<String>,
}
