//! Keyword set generation from the seed taxonomy.
//!
//! Each keyword batch entity (`kw-batch-N`) owns the categories whose index
//! is congruent to N modulo the batch count, so the batches rotate through
//! the taxonomy over a week.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use cartograph_shared::{AgentError, AgentType, FactDelta};

use crate::runner::{AgentRunner, RunContext};

/// A seed product category.
#[derive(Debug, Clone, Copy)]
pub struct Category {
    pub name: &'static str,
    pub cluster_id: &'static str,
    /// Base priority, 1 to 10.
    pub priority: u8,
}

pub const TAXONOMY: &[Category] = &[
    Category { name: "running shoes", cluster_id: "footwear_running", priority: 9 },
    Category { name: "gym wear", cluster_id: "apparel_activewear", priority: 8 },
    Category { name: "supplements", cluster_id: "health_supplements", priority: 8 },
    Category { name: "dog food", cluster_id: "pets_food", priority: 7 },
    Category { name: "laptop bags", cluster_id: "bags_laptop", priority: 7 },
    Category { name: "coffee machines", cluster_id: "appliances_coffee", priority: 8 },
    Category { name: "skincare", cluster_id: "beauty_skincare", priority: 8 },
    Category { name: "garden furniture", cluster_id: "garden_outdoor", priority: 7 },
    Category { name: "baby clothes", cluster_id: "baby_clothing", priority: 7 },
    Category { name: "yoga mats", cluster_id: "fitness_yoga", priority: 6 },
];

/// Intent class of a modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Transactional,
    Commercial,
}

/// Modifiers by intent. `{product}` marks a template.
pub const MODIFIERS: &[(IntentType, &str)] = &[
    (IntentType::Transactional, "buy"),
    (IntentType::Transactional, "shop"),
    (IntentType::Transactional, "order"),
    (IntentType::Transactional, "cheap"),
    (IntentType::Transactional, "{product} for sale"),
    (IntentType::Transactional, "{product} discount code"),
    (IntentType::Commercial, "best"),
    (IntentType::Commercial, "top rated"),
    (IntentType::Commercial, "review"),
    (IntentType::Commercial, "compare"),
];

/// One generated keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordItem {
    pub keyword: String,
    pub cluster_id: String,
    pub intent_type: IntentType,
    pub priority_score: u8,
    pub modifiers_present: Vec<String>,
    pub rationale: String,
}

/// The value written to `keyword_set`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordSet {
    pub batch_index: u32,
    #[serde(default)]
    pub keywords: Vec<KeywordItem>,
}

/// Plain (non-template) modifiers found in `keyword`, plus `uk` if present.
pub fn detect_modifiers(keyword: &str) -> Vec<String> {
    let lower = keyword.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let mut found: Vec<String> = MODIFIERS
        .iter()
        .map(|(_, m)| *m)
        .filter(|m| !m.contains("{product}"))
        .filter(|m| contains_phrase(&words, m))
        .map(String::from)
        .collect();
    if words.contains(&"uk") {
        found.push("uk".to_string());
    }
    found
}

fn contains_phrase(words: &[&str], phrase: &str) -> bool {
    let needle: Vec<&str> = phrase.split_whitespace().collect();
    !needle.is_empty() && words.windows(needle.len()).any(|w| w == needle.as_slice())
}

fn build_keyword(modifier: &str, category: &Category) -> String {
    if modifier.contains("{product}") {
        format!("{} UK", modifier.replace("{product}", category.name))
    } else {
        format!("{modifier} {} UK", category.name)
    }
}

/// Keywords for batch `index` of `batches`, at most `max_keywords`.
pub fn generate_batch(index: u32, batches: u32, max_keywords: usize) -> Vec<KeywordItem> {
    let batches = batches.max(1) as usize;
    let slot = index as usize % batches;

    TAXONOMY
        .iter()
        .enumerate()
        .filter(|(i, _)| i % batches == slot)
        .flat_map(|(_, category)| {
            MODIFIERS.iter().map(move |(intent, modifier)| {
                let keyword = build_keyword(modifier, category);
                let priority_score = match intent {
                    IntentType::Transactional => (category.priority + 1).min(10),
                    IntentType::Commercial => category.priority,
                };
                KeywordItem {
                    modifiers_present: detect_modifiers(&keyword),
                    rationale: format!(
                        "{intent:?} modifier '{modifier}' on seed category '{}'",
                        category.name
                    )
                    .to_lowercase(),
                    keyword,
                    cluster_id: category.cluster_id.to_string(),
                    intent_type: *intent,
                    priority_score,
                }
            })
        })
        .take(max_keywords)
        .collect()
}

pub struct KeywordMinerRunner {
    batches: u32,
    max_keywords: usize,
}

impl KeywordMinerRunner {
    pub fn new(batches: u32, max_keywords: usize) -> Self {
        Self {
            batches,
            max_keywords,
        }
    }
}

#[async_trait]
impl AgentRunner for KeywordMinerRunner {
    fn agent_type(&self) -> AgentType {
        AgentType::KeywordMiner
    }

    async fn run(&self, ctx: &RunContext) -> Result<FactDelta, AgentError> {
        ctx.check_cancelled()?;
        let index = ctx.entity_id.batch_index().ok_or_else(|| {
            AgentError::fatal(format!("{} is not a keyword batch entity", ctx.entity_id))
        })?;

        let keywords = generate_batch(index, self.batches, self.max_keywords);
        debug!(batch = index, count = keywords.len(), "generated keyword batch");

        let set = KeywordSet {
            batch_index: index,
            keywords,
        };
        let evidence = vec![format!(
            "{} keywords from seed taxonomy batch {index}",
            set.keywords.len()
        )];
        Ok(ctx.delta(
            AgentType::KeywordMiner,
            json!(set),
            1.0,
            evidence,
        ))
    }
}
