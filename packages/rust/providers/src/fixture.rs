//! Deterministic in-memory provider.
//!
//! Serves canned payloads per request kind (optionally per domain), can be
//! scripted to fail or to stay pending for a number of polls, and counts
//! every call so tests can assert that no call was made.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::model::{
    BacklinkPayload, DetectedTech, PagePayload, PollStatus, ProviderRequest, ProviderTicket,
    SerpPayload, SerpResult, TechPayload,
};
use crate::provider::Provider;

#[derive(Default)]
struct FixtureState {
    payloads: HashMap<String, Value>,
    failures: VecDeque<ProviderError>,
    /// Outstanding tickets: remaining pending polls and the payload.
    tickets: HashMap<String, (u32, Value)>,
}

pub struct FixtureProvider {
    id: String,
    pending_polls: u32,
    state: Mutex<FixtureState>,
    submits: AtomicUsize,
    polls: AtomicUsize,
}

impl FixtureProvider {
    /// An empty fixture: unknown requests get an empty payload of the right shape.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pending_polls: 0,
            state: Mutex::new(FixtureState::default()),
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    /// A fixture preloaded with realistic sample data for `example.co.uk`
    /// and a handful of SERP results. Used for `kind = "fixture"` providers.
    pub fn demo(id: impl Into<String>) -> Self {
        let provider = Self::new(id);
        provider.set_payload("serp_query", None, demo_serp());
        provider.set_payload(
            "backlink_metrics",
            Some("example.co.uk"),
            json!(BacklinkPayload {
                domain: "example.co.uk".into(),
                domain_rating: Some(54),
                domain_authority: Some(48),
                page_authority: Some(41),
                spam_score: Some(12),
                referring_domains_count: Some(1840),
                backlinks_count: Some(23_400),
                organic_traffic_estimate: Some(89_000),
                organic_keywords_count: Some(14_200),
                source: "fixture".into(),
            }),
        );
        provider.set_payload(
            "tech_fingerprint",
            Some("example.co.uk"),
            json!(TechPayload {
                domain: "example.co.uk".into(),
                platform: Some("Shopify".into()),
                platform_confidence: 0.95,
                technologies: ["Shopify", "Klaviyo", "Stripe", "Cloudflare", "GA4"]
                    .into_iter()
                    .map(|name| DetectedTech {
                        name: name.into(),
                        confidence: 0.9,
                    })
                    .collect(),
                detected_via: "fixture".into(),
            }),
        );
        provider.set_payload(
            "page_fetch",
            Some("example.co.uk"),
            json!(PagePayload {
                domain: "example.co.uk".into(),
                html: r#"<html><head><script src="https://cdn.shopify.com/s/app.js"></script>
<script type="application/ld+json">{"@type":"Product","name":"Trail Runner"}</script>
<script src="https://js.stripe.com/v3"></script></head>
<body><a href="/cart">Basket</a></body></html>"#
                    .into(),
                headers: BTreeMap::new(),
                sample_urls: vec!["https://example.co.uk/cart".into()],
            }),
        );
        provider
    }

    /// Builder form of [`FixtureProvider::set_payload`] for a whole request kind.
    pub fn with_payload(self, kind: &str, payload: Value) -> Self {
        self.set_payload(kind, None, payload);
        self
    }

    /// Builder form of [`FixtureProvider::set_payload`] for one domain.
    pub fn with_payload_for(self, kind: &str, domain: &str, payload: Value) -> Self {
        self.set_payload(kind, Some(domain), payload);
        self
    }

    /// Require `n` pending polls before each ticket becomes ready.
    pub fn with_pending_polls(mut self, n: u32) -> Self {
        self.pending_polls = n;
        self
    }

    /// Replace the canned payload for a request kind, optionally per domain.
    pub fn set_payload(&self, kind: &str, domain: Option<&str>, payload: Value) {
        let mut state = self.lock();
        state.payloads.insert(payload_key(kind, domain), payload);
    }

    /// Make the next submit fail with `error`. Failures queue up in order.
    pub fn fail_next(&self, error: ProviderError) {
        self.lock().failures.push_back(error);
    }

    /// Make the next `n` submits fail with `error`.
    pub fn fail_times(&self, n: usize, error: ProviderError) {
        let mut state = self.lock();
        for _ in 0..n {
            state.failures.push_back(error.clone());
        }
    }

    /// Number of `submit` calls received.
    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// Number of `poll` calls received.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Provider for FixtureProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn submit(&self, request: &ProviderRequest) -> Result<ProviderTicket, ProviderError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();

        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let payload = request
            .domain()
            .and_then(|d| state.payloads.get(&payload_key(request.kind(), Some(d))))
            .or_else(|| state.payloads.get(&payload_key(request.kind(), None)))
            .cloned()
            .unwrap_or_else(|| empty_payload(request));

        let task_id = Uuid::now_v7().to_string();
        if self.pending_polls == 0 {
            return Ok(ProviderTicket::ready(&self.id, task_id, payload));
        }
        state
            .tickets
            .insert(task_id.clone(), (self.pending_polls, payload));
        Ok(ProviderTicket::pending(&self.id, task_id))
    }

    async fn poll(&self, ticket: &ProviderTicket) -> Result<PollStatus, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(payload) = &ticket.payload {
            return Ok(PollStatus::Ready(payload.clone()));
        }

        let mut state = self.lock();
        let remaining = state.tickets.get(&ticket.task_id).map(|(n, _)| *n);
        match remaining {
            Some(n) if n > 0 => {
                if let Some(entry) = state.tickets.get_mut(&ticket.task_id) {
                    entry.0 = n - 1;
                }
                Ok(PollStatus::Pending)
            }
            Some(_) => {
                let (_, payload) = state
                    .tickets
                    .remove(&ticket.task_id)
                    .unwrap_or((0, Value::Null));
                Ok(PollStatus::Ready(payload))
            }
            None => Ok(PollStatus::Failed(format!(
                "unknown task {}",
                ticket.task_id
            ))),
        }
    }
}

fn payload_key(kind: &str, domain: Option<&str>) -> String {
    match domain {
        Some(d) => format!("{kind}:{d}"),
        None => kind.to_string(),
    }
}

/// An empty payload of the shape the request kind expects.
fn empty_payload(request: &ProviderRequest) -> Value {
    let domain = request.domain().unwrap_or_default().to_string();
    match request {
        ProviderRequest::SerpQuery { .. } => json!(SerpPayload::default()),
        ProviderRequest::BacklinkMetrics { .. } => json!(BacklinkPayload {
            domain,
            source: "fixture".into(),
            ..Default::default()
        }),
        ProviderRequest::TechFingerprint { .. } => json!(TechPayload {
            domain,
            detected_via: "fixture".into(),
            ..Default::default()
        }),
        ProviderRequest::PageFetch { .. } => json!(PagePayload {
            domain,
            ..Default::default()
        }),
    }
}

fn demo_serp() -> Value {
    let features = |carousel: bool, sitelinks: bool| {
        BTreeMap::from([
            ("shopping_carousel".to_string(), carousel),
            ("people_also_ask".to_string(), true),
            ("featured_snippet".to_string(), false),
            ("local_pack".to_string(), false),
            ("sitelinks".to_string(), sitelinks),
            ("image_pack".to_string(), false),
            ("ai_overview".to_string(), false),
        ])
    };
    let result = |domain: &str, path: &str, position: u32, carousel: bool, sitelinks: bool| {
        SerpResult {
            keyword: "buy running shoes uk".into(),
            domain: domain.into(),
            url: format!("https://{domain}{path}"),
            position,
            serp_features: features(carousel, sitelinks),
            source: "fixture".into(),
            raw_payload_hash: None,
        }
    };
    json!(
        SerpPayload {
            results: vec![
                result("example.co.uk", "/running-shoes", 1, true, true),
                result("sportstop.co.uk", "/footwear/running", 2, true, false),
                result("amazon.co.uk", "/s?k=running+shoes", 3, true, false),
            ],
        }
        .seal()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backlinks(domain: &str) -> ProviderRequest {
        ProviderRequest::BacklinkMetrics {
            domain: domain.into(),
        }
    }

    #[tokio::test]
    async fn serves_domain_specific_then_kind_default() {
        let provider = FixtureProvider::new("backlinks")
            .with_payload("backlink_metrics", json!({"domain": "default"}))
            .with_payload_for("backlink_metrics", "example.co.uk", json!({"domain": "example.co.uk"}));

        let ticket = provider.submit(&backlinks("example.co.uk")).await.unwrap();
        let status = provider.poll(&ticket).await.unwrap();
        assert_eq!(status, PollStatus::Ready(json!({"domain": "example.co.uk"})));

        let ticket = provider.submit(&backlinks("other.co.uk")).await.unwrap();
        let status = provider.poll(&ticket).await.unwrap();
        assert_eq!(status, PollStatus::Ready(json!({"domain": "default"})));
        assert_eq!(provider.submit_count(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let provider = FixtureProvider::new("serp");
        provider.fail_times(2, ProviderError::Timeout("slow".into()));

        assert!(provider.submit(&backlinks("a.co.uk")).await.is_err());
        assert!(provider.submit(&backlinks("a.co.uk")).await.is_err());
        assert!(provider.submit(&backlinks("a.co.uk")).await.is_ok());
        assert_eq!(provider.submit_count(), 3);
    }

    #[tokio::test]
    async fn pending_polls_before_ready() {
        let provider = FixtureProvider::new("serp").with_pending_polls(2);
        let ticket = provider.submit(&backlinks("a.co.uk")).await.unwrap();
        assert!(ticket.payload.is_none());

        assert_eq!(provider.poll(&ticket).await.unwrap(), PollStatus::Pending);
        assert_eq!(provider.poll(&ticket).await.unwrap(), PollStatus::Pending);
        assert!(matches!(
            provider.poll(&ticket).await.unwrap(),
            PollStatus::Ready(_)
        ));
        assert_eq!(provider.poll_count(), 3);
    }

    #[tokio::test]
    async fn unknown_request_gets_empty_shape() {
        let provider = FixtureProvider::new("tech");
        let ticket = provider
            .submit(&ProviderRequest::TechFingerprint {
                domain: "nobody.co.uk".into(),
            })
            .await
            .unwrap();
        let PollStatus::Ready(value) = provider.poll(&ticket).await.unwrap() else {
            panic!("expected ready");
        };
        let tech: TechPayload = serde_json::from_value(value).unwrap();
        assert_eq!(tech.domain, "nobody.co.uk");
        assert!(tech.technologies.is_empty());
    }

    #[test]
    fn demo_serp_results_are_hashed() {
        let payload: SerpPayload = serde_json::from_value(demo_serp()).unwrap();
        assert_eq!(payload.results.len(), 3);
        assert!(payload.results.iter().all(|r| r.raw_payload_hash.is_some()));
    }
}
