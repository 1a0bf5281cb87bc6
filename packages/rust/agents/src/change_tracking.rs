//! Snapshot diffing: numeric field deltas, capability gains and losses,
//! keyword movement, and the trending score.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::info;

use cartograph_shared::{
    AgentError, AgentType, ChangeRecord, FactDelta, FactRecord, FieldDelta, PassKind,
    TRAFFIC_FIELD, groups,
};

use crate::runner::{AgentRunner, RunContext, Snapshot};

/// Position assumed for a keyword a snapshot has no ranking for.
const UNRANKED: u32 = 100;
const NEUTRAL_SCORE: f64 = 5.0;
const TECH_PREFIX: &str = "tech:";

/// Every numeric leaf of every group, keyed `group.field[.sub]`.
pub fn numeric_fields(record: &FactRecord) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for (name, group) in &record.groups {
        collect_numbers(name, &group.value, &mut out);
    }
    out
}

fn collect_numbers(path: &str, value: &Value, out: &mut BTreeMap<String, f64>) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64().filter(|f| f.is_finite()) {
                out.insert(path.to_string(), f);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                collect_numbers(&format!("{path}.{key}"), child, out);
            }
        }
        _ => {}
    }
}

/// Capability flags that are currently on: SERP features by name, and
/// technologies as `tech:<name>`.
pub fn capability_flags(record: &FactRecord) -> BTreeSet<String> {
    let mut flags = BTreeSet::new();
    if let Some(features) = record
        .value(groups::SERP_INTELLIGENCE)
        .and_then(|v| v.get("serp_features"))
        .and_then(Value::as_object)
    {
        for (name, on) in features {
            if on.as_bool() == Some(true) {
                flags.insert(name.clone());
            }
        }
    }
    if let Some(techs) = record
        .value(groups::TECHNICAL_LAYER)
        .and_then(|v| v.get("technologies"))
        .and_then(Value::as_array)
    {
        for name in techs.iter().filter_map(Value::as_str) {
            flags.insert(format!("{TECH_PREFIX}{name}"));
        }
    }
    flags
}

fn keyword_positions(record: &FactRecord) -> BTreeMap<String, u32> {
    record
        .value(groups::SERP_INTELLIGENCE)
        .and_then(|v| v.get("keywords"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|k| {
                    let query = k.get("query")?.as_str()?.to_string();
                    let position = k
                        .get("position")
                        .and_then(Value::as_u64)
                        .map_or(UNRANKED, |p| p as u32);
                    Some((query, position))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Trending score on a 0-10 scale, 5 neutral.
pub fn trending_score(
    traffic_pct: f64,
    period_days: f64,
    keyword_net: i64,
    feature_net: i64,
    previous: Option<f64>,
) -> f64 {
    let period_days = period_days.max(1.0);
    let raw = NEUTRAL_SCORE
        + traffic_pct * 0.03 * (30.0 / period_days)
        + keyword_net as f64 * 0.1
        + feature_net as f64 * 0.5;
    let blended = match previous {
        Some(prev) if prev.is_finite() => 0.75 * raw + 0.25 * prev,
        _ => raw,
    };
    let score = if blended.is_nan() { NEUTRAL_SCORE } else { blended };
    (score.clamp(0.0, 10.0) * 100.0).round() / 100.0
}

/// Diff `prior` against the current record.
pub fn diff(
    prior: &Snapshot,
    current: &FactRecord,
    now: DateTime<Utc>,
    previous_score: Option<f64>,
    alert_threshold: f64,
    pass: PassKind,
) -> ChangeRecord {
    let before = numeric_fields(&prior.record);
    let after = numeric_fields(current);
    let field_deltas: BTreeMap<String, FieldDelta> = after
        .iter()
        .filter_map(|(path, &a)| {
            let &b = before.get(path)?;
            Some((
                path.clone(),
                FieldDelta {
                    before: b,
                    after: a,
                    absolute: a - b,
                    percent: (b != 0.0).then(|| (a - b) / b * 100.0),
                },
            ))
        })
        .collect();

    let old_flags = capability_flags(&prior.record);
    let new_flags = capability_flags(current);
    let feature_gains: Vec<String> = new_flags.difference(&old_flags).cloned().collect();
    let feature_losses: Vec<String> = old_flags.difference(&new_flags).cloned().collect();

    let old_positions = keyword_positions(&prior.record);
    let mut keyword_wins = 0u32;
    let mut keyword_losses = 0u32;
    for (query, position) in keyword_positions(current) {
        let was = old_positions.get(&query).copied().unwrap_or(UNRANKED);
        if position < was {
            keyword_wins += 1;
        } else if position > was {
            keyword_losses += 1;
        }
    }

    let traffic_pct = field_deltas
        .get(TRAFFIC_FIELD)
        .and_then(|d| d.percent)
        .unwrap_or(0.0);
    let period_days = (now - prior.taken_at).num_seconds() as f64 / 86_400.0;
    let score = trending_score(
        traffic_pct,
        period_days,
        keyword_wins as i64 - keyword_losses as i64,
        feature_gains.len() as i64 - feature_losses.len() as i64,
        previous_score,
    );

    let alert_reason = alert_reason(score, traffic_pct, &feature_gains, alert_threshold);

    ChangeRecord {
        entity_id: current.entity_id.clone(),
        period_start: prior.taken_at,
        period_end: now,
        field_deltas,
        trending_score: score,
        feature_gains,
        feature_losses,
        keyword_wins,
        keyword_losses,
        alert_reason,
        pass,
    }
}

fn alert_reason(
    score: f64,
    traffic_pct: f64,
    gains: &[String],
    threshold: f64,
) -> Option<String> {
    if score >= threshold {
        let mut reasons = Vec::new();
        if traffic_pct > 10.0 {
            reasons.push(format!("traffic_up_{traffic_pct:.0}%"));
        }
        let serp_gains: Vec<&str> = gains
            .iter()
            .filter(|g| !g.starts_with(TECH_PREFIX))
            .map(String::as_str)
            .collect();
        if !serp_gains.is_empty() {
            reasons.push(format!("new_serp_features_{}", serp_gains.join(",")));
        }
        if reasons.is_empty() {
            reasons.push("trending_score_threshold".into());
        }
        Some(reasons.join("; "))
    } else if score <= 10.0 - threshold {
        Some(format!("declining_score_{score}"))
    } else {
        None
    }
}

pub struct ChangeTrackingRunner {
    alert_threshold: f64,
}

impl ChangeTrackingRunner {
    pub fn new(alert_threshold: f64) -> Self {
        Self { alert_threshold }
    }
}

#[async_trait]
impl AgentRunner for ChangeTrackingRunner {
    fn agent_type(&self) -> AgentType {
        AgentType::ChangeTracking
    }

    async fn run(&self, ctx: &RunContext) -> Result<FactDelta, AgentError> {
        ctx.check_cancelled()?;
        let now = ctx.now();

        let Some(prior) = &ctx.prior else {
            return Ok(ctx.delta(
                AgentType::ChangeTracking,
                json!({"baseline": true, "snapshot_at": now}),
                1.0,
                vec!["first snapshot, nothing to compare".into()],
            ));
        };

        let previous_score = ctx
            .record
            .value(groups::CHANGE_TRACKING)
            .and_then(|v| v.get("trending_score"))
            .and_then(Value::as_f64);
        let record = diff(
            prior,
            &ctx.record,
            now,
            previous_score,
            self.alert_threshold,
            ctx.pass,
        );
        info!(
            entity_id = %ctx.entity_id,
            score = record.trending_score,
            alert = record.alert_reason.as_deref().unwrap_or("-"),
            "change record computed"
        );

        let evidence = vec![format!(
            "compared with snapshot from {}",
            prior.taken_at.to_rfc3339()
        )];
        let value =
            serde_json::to_value(&record).map_err(|e| AgentError::fatal(e.to_string()))?;
        Ok(ctx.delta(AgentType::ChangeTracking, value, 1.0, evidence))
    }
}
