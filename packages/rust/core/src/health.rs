//! Point-in-time view of the pipeline for operators.

use std::collections::BTreeMap;

use serde::Serialize;

use cartograph_shared::{AgentType, ProviderState};

use crate::queue::JobQueues;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentHealth {
    /// Jobs waiting, ready or backing off.
    pub queued: usize,
    pub running: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineHealth {
    pub agents: BTreeMap<String, AgentHealth>,
    pub dead_letters: usize,
    pub in_flight: usize,
    pub retired: usize,
    pub entities: usize,
    /// Breaker state per provider, including how often each has opened.
    pub providers: Vec<ProviderState>,
}

impl PipelineHealth {
    pub fn collect(queues: &JobQueues, providers: Vec<ProviderState>, entities: usize) -> Self {
        let agents = AgentType::ALL
            .into_iter()
            .map(|agent| {
                (
                    agent.as_str().to_string(),
                    AgentHealth {
                        queued: queues.depth(agent),
                        running: queues.running_for(agent),
                    },
                )
            })
            .collect();
        Self {
            agents,
            dead_letters: queues.dead_count(),
            in_flight: queues.running(),
            retired: queues.retired_count(),
            entities,
            providers,
        }
    }

    pub fn queue_depth(&self, agent: AgentType) -> usize {
        self.agents.get(agent.as_str()).map_or(0, |a| a.queued)
    }

    /// Total breaker-open events across providers.
    pub fn open_events(&self) -> u64 {
        self.providers.iter().map(|p| p.open_events).sum()
    }
}
