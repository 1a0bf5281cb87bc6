//! Candidate-domain discovery from search result pages.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use cartograph_providers::{ProviderGateway, ProviderRequest, SerpPayload, decode_payload};
use cartograph_shared::{
    AgentError, AgentType, EntityId, FactDelta, IdempotencyKey, JobId, groups,
};

use crate::keyword_miner::KeywordSet;
use crate::runner::{AgentRunner, RunContext};

/// UK location code and language sent with every SERP query.
const GEO: &str = "2826";
const LANGUAGE: &str = "en";

/// Marketplaces, social networks and reference sites that are never candidates.
static EXCLUDED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(^|\.)amazon\.(co\.uk|com)$",
        r"(^|\.)ebay\.",
        r"(^|\.)etsy\.com$",
        r"(^|\.)google\.",
        r"(^|\.)facebook\.",
        r"(^|\.)instagram\.",
        r"(^|\.)youtube\.",
        r"(^|\.)pinterest\.",
        r"(^|\.)wikipedia\.org$",
        r"(^|\.)reddit\.com$",
        r"(^|\.)trustpilot\.com$",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static UK_TLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(co\.uk|org\.uk|me\.uk|uk)$")
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordPosition {
    pub query: String,
    pub position: u32,
}

/// A domain that survived filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDomain {
    pub domain: String,
    pub tld: String,
    /// First keyword the domain ranked for, and its position there.
    pub keyword: String,
    pub position: u32,
    /// Union of result-page features across every query the domain ranked for.
    pub serp_features: BTreeMap<String, bool>,
    pub keywords: Vec<KeywordPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload_hash: Option<String>,
}

/// The value written to `discovery`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub keywords_processed: usize,
    pub results_seen: usize,
    pub excluded_count: usize,
    pub non_uk_count: usize,
    #[serde(default)]
    pub domains: Vec<DiscoveredDomain>,
}

/// The value written to a discovered domain's `serp_intelligence` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerpIntelligence {
    pub serp_features: BTreeMap<String, bool>,
    pub keywords: Vec<KeywordPosition>,
    pub best_position: u32,
    pub discovery_keyword: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload_hash: Option<String>,
}

pub fn is_excluded(domain: &str) -> bool {
    EXCLUDED.iter().any(|re| re.is_match(domain))
}

pub fn is_uk_relevant(domain: &str) -> bool {
    UK_TLD.is_match(domain) || domain.ends_with(".com")
}

fn normalize_domain(raw: &str) -> String {
    let lower = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}

fn tld_of(domain: &str) -> String {
    for suffix in ["co.uk", "org.uk", "me.uk"] {
        if domain.ends_with(&format!(".{suffix}")) {
            return suffix.to_string();
        }
    }
    domain.rsplit('.').next().unwrap_or_default().to_string()
}

/// Filter and deduplicate SERP results into discovered domains.
pub fn filter_results(payload: &SerpPayload, keywords_processed: usize) -> DiscoveryResult {
    let mut result = DiscoveryResult {
        keywords_processed,
        results_seen: payload.results.len(),
        ..Default::default()
    };
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for serp in &payload.results {
        let domain = normalize_domain(&serp.domain);
        if domain.is_empty() || is_excluded(&domain) {
            result.excluded_count += 1;
            continue;
        }
        if !is_uk_relevant(&domain) {
            result.non_uk_count += 1;
            continue;
        }

        let appearance = KeywordPosition {
            query: serp.keyword.clone(),
            position: serp.position,
        };
        match index.get(&domain).copied() {
            Some(i) => {
                let entry = &mut result.domains[i];
                for (feature, present) in &serp.serp_features {
                    let slot = entry.serp_features.entry(feature.clone()).or_insert(false);
                    *slot |= *present;
                }
                if !entry.keywords.iter().any(|k| k.query == appearance.query) {
                    entry.keywords.push(appearance);
                }
            }
            None => {
                index.insert(domain.clone(), result.domains.len());
                result.domains.push(DiscoveredDomain {
                    tld: tld_of(&domain),
                    domain,
                    keyword: serp.keyword.clone(),
                    position: serp.position,
                    serp_features: serp.serp_features.clone(),
                    keywords: vec![appearance],
                    raw_payload_hash: serp.raw_payload_hash.clone(),
                });
            }
        }
    }
    result
}

/// One `serp_intelligence` delta per discovered domain, keyed by
/// `hash(job_id, domain)` so a redelivered discovery job fans out idempotently.
pub fn serp_intelligence_deltas(
    discovery: &FactDelta,
    job_id: &JobId,
) -> Result<Vec<FactDelta>, AgentError> {
    let result: DiscoveryResult = decode_payload(discovery.value.clone())?;
    Ok(result
        .domains
        .into_iter()
        .map(|d| {
            let entity_id = EntityId::new(&d.domain);
            let best_position = d
                .keywords
                .iter()
                .map(|k| k.position)
                .min()
                .unwrap_or(d.position);
            let evidence = vec![format!(
                "ranked for {} keyword(s), best position {best_position}",
                d.keywords.len()
            )];
            FactDelta {
                agent_type: AgentType::SerpDiscovery,
                idempotency_key: IdempotencyKey::derive(job_id, &entity_id),
                entity_id,
                group_name: groups::SERP_INTELLIGENCE.to_string(),
                value: json!(SerpIntelligence {
                    serp_features: d.serp_features,
                    keywords: d.keywords,
                    best_position,
                    discovery_keyword: d.keyword,
                    raw_payload_hash: d.raw_payload_hash,
                }),
                confidence: 1.0,
                evidence,
                produced_at: discovery.produced_at,
                error: None,
            }
        })
        .collect())
}

pub struct SerpDiscoveryRunner {
    serp: Arc<ProviderGateway>,
}

impl SerpDiscoveryRunner {
    pub fn new(serp: Arc<ProviderGateway>) -> Self {
        Self { serp }
    }
}

#[async_trait]
impl AgentRunner for SerpDiscoveryRunner {
    fn agent_type(&self) -> AgentType {
        AgentType::SerpDiscovery
    }

    async fn run(&self, ctx: &RunContext) -> Result<FactDelta, AgentError> {
        let set: KeywordSet = match ctx.record.value(groups::KEYWORD_SET) {
            Some(value) => decode_payload(value.clone())?,
            None => {
                return Err(AgentError::recoverable(format!(
                    "{} has no keyword_set yet",
                    ctx.entity_id
                )));
            }
        };
        if set.keywords.is_empty() {
            return Err(AgentError::fatal(format!(
                "{} has an empty keyword_set",
                ctx.entity_id
            )));
        }

        let keywords: Vec<String> = set.keywords.iter().map(|k| k.keyword.clone()).collect();
        let request = ProviderRequest::SerpQuery {
            keywords: keywords.clone(),
            geo: GEO.to_string(),
            language: LANGUAGE.to_string(),
        };
        let payload: SerpPayload = decode_payload(self.serp.call(&request, &ctx.cancel).await?)?;
        let payload = payload.seal();

        let result = filter_results(&payload, keywords.len());
        info!(
            entity_id = %ctx.entity_id,
            discovered = result.domains.len(),
            excluded = result.excluded_count,
            "serp discovery complete"
        );
        debug!(non_uk = result.non_uk_count, "non-UK results skipped");

        let evidence = vec![
            format!(
                "{} results for {} keywords via {}",
                result.results_seen,
                result.keywords_processed,
                self.serp.id()
            ),
            format!(
                "{} excluded as marketplace or social, {} outside UK",
                result.excluded_count, result.non_uk_count
            ),
        ];
        Ok(ctx.delta(AgentType::SerpDiscovery, json!(result), 1.0, evidence))
    }
}
