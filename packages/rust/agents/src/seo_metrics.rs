//! Authority, link and traffic metrics with cross-source validation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use cartograph_providers::{BacklinkPayload, ProviderGateway, ProviderRequest, decode_payload};
use cartograph_shared::{AgentError, AgentType, FactDelta};

use crate::runner::{AgentRunner, RunContext};

/// |DR - DA| above this sets `divergence_flag`.
pub const DIVERGENCE_THRESHOLD: i64 = 30;
const LOW_TRAFFIC: u64 = 10;
const HIGH_SPAM: i64 = 60;

/// The value written to `seo_metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeoMetrics {
    pub domain_rating: Option<i64>,
    pub referring_domains_count: Option<u64>,
    pub backlinks_count: Option<u64>,
    pub organic_traffic_estimate: Option<u64>,
    pub organic_keywords_count: Option<u64>,
    pub domain_authority: Option<i64>,
    pub page_authority: Option<i64>,
    pub spam_score: Option<i64>,
    pub divergence_flag: bool,
    pub low_traffic_flag: bool,
    pub high_spam_flag: bool,
    pub sources_used: Vec<String>,
}

/// Combine the primary and (optional) supplementary answers.
pub fn combine(primary: &BacklinkPayload, supplementary: Option<&BacklinkPayload>) -> SeoMetrics {
    let mut metrics = SeoMetrics {
        domain_rating: primary.domain_rating,
        referring_domains_count: primary.referring_domains_count,
        backlinks_count: primary.backlinks_count,
        organic_traffic_estimate: primary.organic_traffic_estimate,
        organic_keywords_count: primary.organic_keywords_count,
        domain_authority: primary.domain_authority,
        page_authority: primary.page_authority,
        spam_score: primary.spam_score,
        sources_used: vec![source_name(primary, "primary")],
        ..Default::default()
    };

    if let Some(supp) = supplementary {
        metrics.domain_authority = supp.domain_authority.or(metrics.domain_authority);
        metrics.page_authority = supp.page_authority.or(metrics.page_authority);
        metrics.spam_score = supp.spam_score.or(metrics.spam_score);
        metrics.sources_used.push(source_name(supp, "supplementary"));
    }

    metrics.divergence_flag = matches!(
        (metrics.domain_rating, metrics.domain_authority),
        (Some(dr), Some(da)) if (dr - da).abs() > DIVERGENCE_THRESHOLD
    );
    metrics.low_traffic_flag = metrics
        .organic_traffic_estimate
        .is_some_and(|t| t < LOW_TRAFFIC);
    metrics.high_spam_flag = metrics.spam_score.is_some_and(|s| s > HIGH_SPAM);
    metrics
}

fn source_name(payload: &BacklinkPayload, fallback: &str) -> String {
    if payload.source.is_empty() {
        fallback.to_string()
    } else {
        payload.source.clone()
    }
}

/// Confidence and evidence for a combined result.
pub fn assess(metrics: &SeoMetrics) -> (f64, Vec<String>) {
    let mut evidence = vec![format!("sources: {}", metrics.sources_used.join(", "))];
    let confidence = if metrics.divergence_flag {
        evidence.push(format!(
            "authority scores diverge: DR {} vs DA {}",
            metrics.domain_rating.unwrap_or_default(),
            metrics.domain_authority.unwrap_or_default()
        ));
        0.6
    } else if metrics.sources_used.len() < 2 {
        evidence.push("single source, not cross-validated".into());
        0.8
    } else {
        1.0
    };
    if metrics.low_traffic_flag {
        evidence.push("organic traffic below 10".into());
    }
    if metrics.high_spam_flag {
        evidence.push(format!(
            "spam score {} above {HIGH_SPAM}",
            metrics.spam_score.unwrap_or_default()
        ));
    }
    (confidence, evidence)
}

pub struct SeoMetricsRunner {
    primary: Arc<ProviderGateway>,
    supplementary: Option<Arc<ProviderGateway>>,
}

impl SeoMetricsRunner {
    pub fn new(primary: Arc<ProviderGateway>, supplementary: Option<Arc<ProviderGateway>>) -> Self {
        Self {
            primary,
            supplementary,
        }
    }
}

#[async_trait]
impl AgentRunner for SeoMetricsRunner {
    fn agent_type(&self) -> AgentType {
        AgentType::SeoMetrics
    }

    async fn run(&self, ctx: &RunContext) -> Result<FactDelta, AgentError> {
        let request = ProviderRequest::BacklinkMetrics {
            domain: ctx.entity_id.to_string(),
        };
        let primary: BacklinkPayload =
            decode_payload(self.primary.call(&request, &ctx.cancel).await?)?;

        let supplementary = match &self.supplementary {
            Some(gateway) => match gateway.call(&request, &ctx.cancel).await {
                Ok(value) => match decode_payload::<BacklinkPayload>(value) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(provider = gateway.id(), error = %e, "supplementary metrics unusable");
                        None
                    }
                },
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    warn!(provider = gateway.id(), error = %e, "supplementary metrics failed");
                    None
                }
            },
            None => None,
        };

        let metrics = combine(&primary, supplementary.as_ref());
        let (confidence, evidence) = assess(&metrics);
        Ok(ctx.delta(AgentType::SeoMetrics, json!(metrics), confidence, evidence))
    }
}
