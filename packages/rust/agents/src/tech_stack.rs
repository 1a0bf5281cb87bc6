//! Technology fingerprinting.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use cartograph_providers::{ProviderGateway, ProviderRequest, TechPayload, decode_payload};
use cartograph_shared::{AgentError, AgentType, FactDelta};

use crate::runner::{AgentRunner, RunContext};

/// Detections below this confidence are dropped.
pub const MIN_CONFIDENCE: f64 = 0.5;

const CATEGORIES: &[(&str, &[&str])] = &[
    (
        "ecommerce_platform",
        &["Shopify", "WooCommerce", "Magento", "BigCommerce", "Squarespace", "Wix", "PrestaShop"],
    ),
    (
        "analytics",
        &["Google Analytics", "GA4", "Hotjar", "Mixpanel", "Segment", "Plausible"],
    ),
    (
        "email_provider",
        &["Klaviyo", "Mailchimp", "Omnisend", "Drip", "ActiveCampaign"],
    ),
    ("live_chat", &["Zendesk", "Intercom", "LiveChat", "Tidio", "Crisp"]),
    ("cdn", &["Cloudflare", "Fastly", "Akamai", "CloudFront"]),
    (
        "payment_gateway",
        &["Stripe", "PayPal", "Klarna", "Worldpay", "Checkout.com", "Braintree"],
    ),
    (
        "marketing_tools",
        &["Meta Pixel", "Google Ads", "TikTok Pixel", "Pinterest Tag"],
    ),
];

/// Shopify plan markers, checked in order.
const SHOPIFY_PLANS: &[(&str, &str)] = &[
    ("shopifycloud.com/checkout", "plus"),
    ("checkout.shopify.com", "basic"),
];

/// The value written to `technical_layer`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnicalLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_plan: Option<String>,
    pub platform_confidence: f64,
    pub technologies: Vec<String>,
    pub technology_count: usize,
    pub categories: BTreeMap<String, Vec<String>>,
    pub zero_tech_flag: bool,
    pub no_ecom_platform_flag: bool,
    pub detected_via: String,
}

pub fn category_of(name: &str) -> Option<&'static str> {
    CATEGORIES
        .iter()
        .find(|(_, members)| members.iter().any(|m| m.eq_ignore_ascii_case(name)))
        .map(|(category, _)| *category)
}

pub fn analyze(payload: &TechPayload) -> TechnicalLayer {
    let technologies: Vec<String> = payload
        .technologies
        .iter()
        .filter(|t| t.confidence >= MIN_CONFIDENCE)
        .map(|t| t.name.clone())
        .collect();

    let mut categories: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in &technologies {
        if let Some(category) = category_of(name) {
            categories
                .entry(category.to_string())
                .or_default()
                .push(name.clone());
        }
    }

    let platform = payload.platform.clone().or_else(|| {
        categories
            .get("ecommerce_platform")
            .and_then(|p| p.first().cloned())
    });

    let platform_plan = match platform.as_deref() {
        Some(p) if p.eq_ignore_ascii_case("shopify") => SHOPIFY_PLANS
            .iter()
            .find(|(marker, _)| {
                technologies
                    .iter()
                    .any(|t| t.to_lowercase().contains(marker))
            })
            .map(|(_, plan)| plan.to_string()),
        _ => None,
    };

    TechnicalLayer {
        no_ecom_platform_flag: platform.is_none(),
        zero_tech_flag: technologies.is_empty(),
        technology_count: technologies.len(),
        platform,
        platform_plan,
        platform_confidence: payload.platform_confidence,
        technologies,
        categories,
        detected_via: payload.detected_via.clone(),
    }
}

pub struct TechStackRunner {
    tech: Arc<ProviderGateway>,
}

impl TechStackRunner {
    pub fn new(tech: Arc<ProviderGateway>) -> Self {
        Self { tech }
    }
}

#[async_trait]
impl AgentRunner for TechStackRunner {
    fn agent_type(&self) -> AgentType {
        AgentType::TechStack
    }

    async fn run(&self, ctx: &RunContext) -> Result<FactDelta, AgentError> {
        let request = ProviderRequest::TechFingerprint {
            domain: ctx.entity_id.to_string(),
        };
        let payload: TechPayload = decode_payload(self.tech.call(&request, &ctx.cancel).await?)?;
        let layer = analyze(&payload);

        let mut evidence = vec![format!(
            "{} technologies detected via {}",
            layer.technology_count, layer.detected_via
        )];
        let confidence = match &layer.platform {
            Some(platform) => {
                evidence.push(format!(
                    "platform {platform} ({:.2})",
                    layer.platform_confidence
                ));
                layer.platform_confidence.clamp(MIN_CONFIDENCE, 1.0)
            }
            None if layer.zero_tech_flag => {
                evidence.push("no technologies detected".into());
                0.3
            }
            None => {
                evidence.push("no ecommerce platform detected".into());
                0.6
            }
        };
        Ok(ctx.delta(AgentType::TechStack, json!(layer), confidence, evidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, gateway};
    use cartograph_providers::{DetectedTech, FixtureProvider};
    use cartograph_shared::{EntityId, FactRecord};

    fn tech(name: &str, confidence: f64) -> DetectedTech {
        DetectedTech {
            name: name.into(),
            confidence,
        }
    }

    #[test]
    fn categorizes_and_drops_weak_detections() {
        let payload = TechPayload {
            domain: "example.co.uk".into(),
            platform: None,
            platform_confidence: 0.0,
            technologies: vec![
                tech("Shopify", 0.9),
                tech("Klaviyo", 0.8),
                tech("Hotjar", 0.3),
                tech("checkout.shopify.com", 0.7),
            ],
            detected_via: "builtwith".into(),
        };
        let layer = analyze(&payload);
        assert_eq!(layer.technology_count, 3);
        assert_eq!(layer.platform.as_deref(), Some("Shopify"));
        assert_eq!(layer.platform_plan.as_deref(), Some("basic"));
        assert_eq!(layer.categories["email_provider"], vec!["Klaviyo"]);
        assert!(!layer.categories.contains_key("analytics"));
        assert!(!layer.no_ecom_platform_flag);
    }

    #[test]
    fn empty_fingerprint_sets_flags() {
        let layer = analyze(&TechPayload::default());
        assert!(layer.zero_tech_flag);
        assert!(layer.no_ecom_platform_flag);
    }

    #[tokio::test]
    async fn runner_reads_demo_fingerprint() {
        let provider = Arc::new(FixtureProvider::demo("tech"));
        let runner = TechStackRunner::new(gateway(provider));
        let entity = EntityId::new("example.co.uk");
        let delta = runner
            .run(&context(entity.clone(), FactRecord::new(entity)))
            .await
            .unwrap();

        assert_eq!(delta.group_name, "technical_layer");
        assert_eq!(delta.confidence, 0.95);
        let layer: TechnicalLayer = serde_json::from_value(delta.value).unwrap();
        assert_eq!(layer.platform.as_deref(), Some("Shopify"));
        assert_eq!(layer.categories["cdn"], vec!["Cloudflare"]);
        assert_eq!(layer.categories["payment_gateway"], vec!["Stripe"]);
    }
}
