//! Deterministic commercial-intent scoring over upstream facts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use cartograph_shared::{AgentError, AgentType, FactDelta, FactRecord, groups};

use crate::classifier::Classification;
use crate::keyword_miner::detect_modifiers;
use crate::runner::{AgentRunner, RunContext};
use crate::serp_discovery::SerpIntelligence;
use crate::tech_stack::TechnicalLayer;

/// Normalisation ceiling for the raw score.
pub const MAX_RAW: f64 = 11.0;

const SERP_WEIGHTS: &[(&str, f64)] = &[
    ("shopping_carousel", 3.0),
    ("ai_overview", 2.0),
    ("featured_snippet", 2.0),
    ("sitelinks", 1.5),
    ("people_also_ask", 1.0),
    ("local_pack", 1.0),
    ("image_pack", 0.5),
];

/// Everything the formula reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentInputs {
    pub keywords: Vec<String>,
    pub serp_features: BTreeMap<String, bool>,
    pub product_schema: bool,
    pub checkout_path: bool,
    pub paid_ads: bool,
    pub merchant_listing: bool,
}

impl IntentInputs {
    /// Gather inputs from `serp_intelligence`, `classification` and
    /// `technical_layer`. Groups that are missing or unreadable contribute nothing.
    pub fn from_record(record: &FactRecord) -> (Self, Vec<&'static str>) {
        let mut inputs = Self::default();
        let mut missing = Vec::new();

        match decode::<SerpIntelligence>(record, groups::SERP_INTELLIGENCE) {
            Some(intel) => {
                inputs.keywords = intel.keywords.into_iter().map(|k| k.query).collect();
                inputs.serp_features = intel.serp_features;
            }
            None => missing.push(groups::SERP_INTELLIGENCE),
        }
        match decode::<Classification>(record, groups::CLASSIFICATION) {
            Some(c) => {
                inputs.product_schema = c.signals.product_schema;
                inputs.checkout_path = c.signals.checkout_path;
            }
            None => missing.push(groups::CLASSIFICATION),
        }
        match decode::<TechnicalLayer>(record, groups::TECHNICAL_LAYER) {
            Some(layer) => {
                inputs.paid_ads = layer
                    .categories
                    .get("marketing_tools")
                    .is_some_and(|tools| tools.iter().any(|t| t == "Google Ads"));
            }
            None => missing.push(groups::TECHNICAL_LAYER),
        }

        inputs.paid_ads |= feature(&inputs.serp_features, "paid_ads");
        inputs.merchant_listing = feature(&inputs.serp_features, "merchant_listing");
        (inputs, missing)
    }
}

fn decode<T: serde::de::DeserializeOwned>(record: &FactRecord, group: &str) -> Option<T> {
    serde_json::from_value(record.value(group)?.clone()).ok()
}

fn feature(features: &BTreeMap<String, bool>, name: &str) -> bool {
    features.get(name).copied().unwrap_or(false)
}

/// The value written to `intent_layer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentScore {
    pub commercial_intent_score: u8,
    pub shopping_modifier_density: f64,
    pub raw_score: f64,
    pub evidence: Vec<String>,
}

pub fn score(inputs: &IntentInputs) -> IntentScore {
    let mut evidence = Vec::new();

    let total = inputs.keywords.len();
    let with_modifiers = inputs
        .keywords
        .iter()
        .filter(|k| detect_modifiers(k).iter().any(|m| m != "uk"))
        .count();
    let density = if total == 0 {
        0.0
    } else {
        (with_modifiers as f64 / total as f64).min(1.0)
    };
    evidence.push(format!("modifier density {density:.2}"));
    let mut raw = density * 3.0;

    let max_weight: f64 = SERP_WEIGHTS.iter().map(|(_, w)| w).sum();
    let present: Vec<&str> = SERP_WEIGHTS
        .iter()
        .filter(|(name, _)| feature(&inputs.serp_features, name))
        .map(|(name, _)| *name)
        .collect();
    let weight: f64 = SERP_WEIGHTS
        .iter()
        .filter(|(name, _)| present.contains(name))
        .map(|(_, w)| w)
        .sum();
    raw += weight.min(max_weight) * 2.0 / max_weight;
    if !present.is_empty() {
        evidence.push(format!("serp features {}", present.join("+")));
    }

    for (on, bonus, label) in [
        (inputs.product_schema, 1.5, "product schema detected"),
        (inputs.paid_ads, 1.0, "paid ads presence"),
        (inputs.checkout_path, 1.5, "checkout path detected"),
        (inputs.merchant_listing, 1.0, "merchant listing eligible"),
    ] {
        if on {
            raw += bonus;
            evidence.push(label.to_string());
        }
    }

    let scaled = (raw / MAX_RAW * 9.0 + 1.0).round().clamp(1.0, 10.0);
    IntentScore {
        commercial_intent_score: scaled as u8,
        shopping_modifier_density: (density * 100.0).round() / 100.0,
        raw_score: (raw * 100.0).round() / 100.0,
        evidence,
    }
}

pub struct IntentScoringRunner;

#[async_trait]
impl AgentRunner for IntentScoringRunner {
    fn agent_type(&self) -> AgentType {
        AgentType::IntentScoring
    }

    async fn run(&self, ctx: &RunContext) -> Result<FactDelta, AgentError> {
        ctx.check_cancelled()?;
        let (inputs, missing) = IntentInputs::from_record(&ctx.record);
        let result = score(&inputs);

        let mut evidence = result.evidence.clone();
        let confidence = if missing.is_empty() {
            1.0
        } else {
            evidence.push(format!("missing inputs: {}", missing.join(", ")));
            0.7
        };
        Ok(ctx.delta(AgentType::IntentScoring, json!(result), confidence, evidence))
    }
}
