//! The seven enrichment agents.
//!
//! Every runner is a pure transformation from a [`RunContext`] (entity,
//! upstream facts, cancellation, clock) to an evidence-scored
//! [`FactDelta`](cartograph_shared::FactDelta). All outside calls go
//! through a [`ProviderGateway`](cartograph_providers::ProviderGateway), so
//! each runner can be exercised against a fixture provider.

pub mod change_tracking;
pub mod classifier;
pub mod intent;
pub mod keyword_miner;
pub mod runner;
pub mod seo_metrics;
pub mod serp_discovery;
pub mod tech_stack;

#[cfg(test)]
mod testing;

pub use change_tracking::{ChangeTrackingRunner, capability_flags, diff, trending_score};
pub use classifier::{Classification, DomainClassifierRunner};
pub use intent::{IntentScore, IntentScoringRunner};
pub use keyword_miner::{KeywordItem, KeywordMinerRunner, KeywordSet};
pub use runner::{AgentRunner, RunContext, RunnerSet, Snapshot};
pub use seo_metrics::{SeoMetrics, SeoMetricsRunner};
pub use serp_discovery::{
    DiscoveryResult, SerpDiscoveryRunner, SerpIntelligence, serp_intelligence_deltas,
};
pub use tech_stack::{TechStackRunner, TechnicalLayer};
