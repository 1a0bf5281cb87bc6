//! Qualifying-store classification from structural page signals.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use cartograph_providers::{PagePayload, ProviderGateway, ProviderRequest, decode_payload};
use cartograph_shared::{AgentError, AgentType, FactDelta, FactRecord, groups};

use crate::runner::{AgentRunner, RunContext};
use crate::serp_discovery::SerpIntelligence;

/// Likelihood at or above which a domain qualifies.
pub const QUALIFY_THRESHOLD: f64 = 0.4;

const PLATFORM_SIGNATURES: &[(&str, &[&str])] = &[
    (
        "shopify",
        &["cdn.shopify.com", "myshopify.com", "shopify.theme", "window.shopify", "/checkouts/"],
    ),
    (
        "woocommerce",
        &["woocommerce", "wc-ajax", "add-to-cart", "wc_add_to_cart_params"],
    ),
    ("magento", &["mage/cookies", "magento", "mage-init", "static/version"]),
    ("bigcommerce", &["bigcommerce.com", "cdn11.bigcommerce", "stencil-utils"]),
    ("squarespace", &["squarespace.com", "static1.squarespace", "squarespace-commerce"]),
    ("wix", &["wixstatic.com", "wix.com", "wix-ecommerce"]),
    ("prestashop", &["prestashop", "/modules/ps_"]),
];

const PRODUCT_SCHEMA_MARKERS: &[&str] = &[
    "\"@type\":\"product\"",
    "\"@type\": \"product\"",
    "schema.org/product",
];

const PAYMENT_MARKERS: &[(&str, &str)] = &[
    ("stripe.com/v3", "stripe"),
    ("braintreegateway", "braintree"),
    ("paypal.com/sdk", "paypal"),
    ("klarna.com/uk", "klarna"),
    ("sagepay", "sagepay"),
    ("worldpay", "worldpay"),
    ("checkout.com", "checkout.com"),
];

const EXCLUSION_MARKERS: &[(&str, &[&str])] = &[
    (
        "news",
        &["news_keywords", "article:published_time", "\"og:type\" content=\"article\""],
    ),
    ("directory", &["/directory/", "/listing/", "business-directory", "find-a-"]),
    ("blog_only", &["wp-content/themes/", "blogspot.com", "medium.com"]),
    ("forum", &["vbulletin", "phpbb", "xenforo", "discourse"]),
];

static CHECKOUT_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/(cart|checkout|basket|bag|order|buy|purchase|shop|store)")
        .expect("valid regex")
});

/// Structural signals found on (or about) a domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_header: Option<String>,
    pub product_schema: bool,
    pub checkout_path: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_script: Option<String>,
    pub shopping_carousel: bool,
    pub top10: bool,
}

impl Signals {
    /// Number of independent pieces of evidence.
    pub fn evidence_count(&self) -> u32 {
        [
            self.platform.is_some(),
            self.platform_header.is_some(),
            self.product_schema,
            self.checkout_path,
            self.payment_script.is_some(),
            self.shopping_carousel,
            self.top10,
        ]
        .into_iter()
        .filter(|b| *b)
        .count() as u32
    }
}

/// The value written to `classification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub qualifies: bool,
    pub likelihood: f64,
    pub score: u32,
    pub signals: Signals,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

/// Scan a fetched page (and any SERP presence) for signals and exclusions.
pub fn detect(page: &PagePayload, serp: Option<&SerpIntelligence>) -> (Signals, Vec<String>) {
    let html = page.html.to_lowercase();

    let platform = PLATFORM_SIGNATURES
        .iter()
        .map(|(name, markers)| (*name, markers.iter().filter(|m| html.contains(*m)).count()))
        .filter(|(_, hits)| *hits > 0)
        .max_by_key(|(_, hits)| *hits)
        .map(|(name, _)| name.to_string());

    let platform_header = page.headers.get("x-powered-by").and_then(|v| {
        let v = v.to_lowercase();
        ["woocommerce", "shopify"]
            .into_iter()
            .find(|p| v.contains(p))
            .map(String::from)
    });

    let product_schema = PRODUCT_SCHEMA_MARKERS.iter().any(|m| html.contains(m))
        || (html.contains("application/ld+json") && html.contains("\"product\""));

    let checkout_path =
        CHECKOUT_PATH.is_match(&html) || page.sample_urls.iter().any(|u| CHECKOUT_PATH.is_match(u));

    let payment_script = PAYMENT_MARKERS
        .iter()
        .find(|(marker, _)| html.contains(marker))
        .map(|(_, name)| name.to_string());

    let (shopping_carousel, top10) = match serp {
        Some(intel) => (
            intel
                .serp_features
                .get("shopping_carousel")
                .copied()
                .unwrap_or(false),
            intel.best_position <= 10,
        ),
        None => (false, false),
    };

    let signals = Signals {
        platform,
        platform_header,
        product_schema,
        checkout_path,
        payment_script,
        shopping_carousel,
        top10,
    };

    let exclusions = EXCLUSION_MARKERS
        .iter()
        .filter(|(name, markers)| {
            // WordPress themes are everywhere; only a store-less site is a blog
            if *name == "blog_only" && (signals.platform.is_some() || signals.checkout_path) {
                return false;
            }
            markers.iter().any(|m| html.contains(m))
        })
        .map(|(name, _)| name.to_string())
        .collect();

    (signals, exclusions)
}

/// Score signals into a verdict.
pub fn classify(signals: Signals, exclusions: Vec<String>) -> Classification {
    let mut score = signals.evidence_count();
    if signals.platform.is_some() {
        score += 1;
    }
    if signals.product_schema && signals.checkout_path {
        score += 1;
    }
    let likelihood = (score as f64 * 0.2 - 0.25 * exclusions.len() as f64).clamp(0.0, 1.0);
    let likelihood = (likelihood * 100.0).round() / 100.0;
    Classification {
        qualifies: likelihood >= QUALIFY_THRESHOLD && exclusions.len() < 2,
        likelihood,
        score,
        signals,
        exclusions,
    }
}

/// Human-readable evidence for both the signals found and those missing.
pub fn describe(c: &Classification) -> Vec<String> {
    let s = &c.signals;
    let mut evidence = Vec::new();
    match &s.platform {
        Some(p) => evidence.push(format!("{p} platform fingerprint")),
        None => evidence.push("no ecommerce platform fingerprint".into()),
    }
    if let Some(h) = &s.platform_header {
        evidence.push(format!("x-powered-by header names {h}"));
    }
    evidence.push(if s.checkout_path {
        "checkout path found".into()
    } else {
        "no checkout path found".into()
    });
    evidence.push(if s.product_schema {
        "product schema present".into()
    } else {
        "no product schema".into()
    });
    match &s.payment_script {
        Some(p) => evidence.push(format!("{p} payment script")),
        None => evidence.push("no payment script".into()),
    }
    if s.shopping_carousel {
        evidence.push("appears in shopping carousel".into());
    }
    if s.top10 {
        evidence.push("ranks in top 10".into());
    }
    for exclusion in &c.exclusions {
        evidence.push(format!("excluded as {exclusion}"));
    }
    evidence
}

fn serp_intelligence(record: &FactRecord) -> Option<SerpIntelligence> {
    let value = record.value(groups::SERP_INTELLIGENCE)?;
    serde_json::from_value(value.clone()).ok()
}

pub struct DomainClassifierRunner {
    pages: Arc<ProviderGateway>,
}

impl DomainClassifierRunner {
    pub fn new(pages: Arc<ProviderGateway>) -> Self {
        Self { pages }
    }
}

#[async_trait]
impl AgentRunner for DomainClassifierRunner {
    fn agent_type(&self) -> AgentType {
        AgentType::DomainClassifier
    }

    async fn run(&self, ctx: &RunContext) -> Result<FactDelta, AgentError> {
        if !ctx.entity_id.is_valid_domain() {
            return Err(AgentError::fatal(format!(
                "'{}' is not a valid domain",
                ctx.entity_id
            )));
        }

        let request = ProviderRequest::PageFetch {
            domain: ctx.entity_id.to_string(),
        };
        let page: PagePayload = decode_payload(self.pages.call(&request, &ctx.cancel).await?)?;
        let serp = serp_intelligence(&ctx.record);

        let (signals, exclusions) = detect(&page, serp.as_ref());
        debug!(?signals, ?exclusions, "classification signals");
        let verdict = classify(signals, exclusions);
        let confidence = verdict.likelihood.max(1.0 - verdict.likelihood).min(0.95);
        info!(
            entity_id = %ctx.entity_id,
            qualifies = verdict.qualifies,
            likelihood = verdict.likelihood,
            "classified"
        );

        let evidence = describe(&verdict);
        Ok(ctx.delta(
            AgentType::DomainClassifier,
            json!(verdict),
            confidence,
            evidence,
        ))
    }
}
