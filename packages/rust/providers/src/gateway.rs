//! The boundary every agent crosses to reach a provider.
//!
//! A [`ProviderGateway`] wraps one provider with its circuit breaker, a
//! per-call deadline, the poll loop, cancellation checks and rate limiting,
//! and converts whatever happens into an [`AgentError`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use cartograph_shared::{
    AgentError, AppConfig, BreakerConfig, CartographError, Clock, ProviderEntry, ProviderKind,
    ProviderState, Result,
};

use crate::breaker::{CircuitBreaker, Permit};
use crate::error::ProviderError;
use crate::fixture::FixtureProvider;
use crate::http::{HttpJsonProvider, QueuedHttpProvider};
use crate::model::{PollStatus, ProviderRequest};
use crate::page::PageFetchProvider;
use crate::provider::Provider;

/// Why an exchange stopped short of a payload.
enum Interrupted {
    Provider(ProviderError),
    Cancelled,
}

impl From<ProviderError> for Interrupted {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

pub struct ProviderGateway {
    provider: Arc<dyn Provider>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    deadline: Duration,
    poll_interval: Duration,
    max_polls: u32,
    rate_limit: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl ProviderGateway {
    pub fn new(
        provider: Arc<dyn Provider>,
        entry: &ProviderEntry,
        breaker: &BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(provider.id().to_string(), breaker.clone()),
            provider,
            clock,
            deadline: Duration::from_secs(entry.timeout_secs.max(1)),
            poll_interval: Duration::from_millis(entry.poll_interval_ms),
            max_polls: entry.max_polls.max(1),
            rate_limit: Duration::from_millis(entry.rate_limit_ms),
            last_call: Mutex::new(None),
        }
    }

    /// Build the provider variant an entry names and wrap it.
    pub fn from_entry(
        entry: &ProviderEntry,
        breaker: &BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let provider: Arc<dyn Provider> = match entry.kind {
            ProviderKind::Fixture => Arc::new(FixtureProvider::demo(entry.id.clone())),
            ProviderKind::HttpJson => Arc::new(HttpJsonProvider::from_entry(entry)?),
            ProviderKind::HttpQueued => Arc::new(QueuedHttpProvider::from_entry(entry)?),
            ProviderKind::PageFetch => {
                Arc::new(PageFetchProvider::new(entry.id.clone(), entry.timeout_secs)?)
            }
        };
        Ok(Self::new(provider, entry, breaker, clock))
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Call the provider and return its payload.
    ///
    /// An open circuit fails fast with `ProviderUnavailable` and makes no
    /// provider call. Only recoverable failures count against the breaker.
    #[instrument(skip_all, fields(provider = %self.provider.id(), kind = request.kind()))]
    pub async fn call(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let permit = self.breaker.try_acquire(self.clock.now())?;

        let outcome = match tokio::time::timeout(self.deadline, self.exchange(request, cancel)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(Interrupted::Provider(ProviderError::Timeout(format!(
                "no result within {}s",
                self.deadline.as_secs()
            )))),
        };

        match outcome {
            Ok(payload) => {
                self.breaker.record_success(permit);
                Ok(payload)
            }
            Err(Interrupted::Cancelled) => {
                self.breaker.release(permit);
                Err(AgentError::Cancelled)
            }
            Err(Interrupted::Provider(e)) => {
                if e.is_recoverable() {
                    self.breaker.record_failure(permit, self.clock.now());
                } else {
                    // The provider answered; it is healthy even if the request was bad
                    self.breaker.record_success(permit);
                }
                debug!(error = %e, "provider call failed");
                Err(e.into())
            }
        }
    }

    /// Submit, then poll until ready, failed, cancelled, or out of polls.
    async fn exchange(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, Interrupted> {
        self.pace(cancel).await?;
        let ticket = self.provider.submit(request).await?;

        for poll in 0..self.max_polls {
            let status = self.provider.poll(&ticket).await?;
            if cancel.is_cancelled() {
                return Err(Interrupted::Cancelled);
            }
            match status {
                PollStatus::Ready(payload) => return Ok(payload),
                PollStatus::Failed(reason) => {
                    return Err(ProviderError::TaskFailed(reason).into());
                }
                PollStatus::Pending => {
                    debug!(task_id = %ticket.task_id, poll, "ticket pending");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        Err(ProviderError::Timeout(format!(
            "task {} not ready after {} polls",
            ticket.task_id, self.max_polls
        ))
        .into())
    }

    /// Keep at least `rate_limit` between consecutive submits.
    async fn pace(&self, cancel: &CancellationToken) -> std::result::Result<(), Interrupted> {
        if self.rate_limit.is_zero() {
            return Ok(());
        }
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.rate_limit;
            tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                _ = tokio::time::sleep_until(ready_at) => {}
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

/// Provider id -> gateway.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    gateways: HashMap<String, Arc<ProviderGateway>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One gateway per `[[providers]]` entry.
    pub fn build_from_config(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut registry = Self::new();
        for entry in &config.providers {
            if registry.gateways.contains_key(&entry.id) {
                return Err(CartographError::config(format!(
                    "duplicate provider id '{}'",
                    entry.id
                )));
            }
            let gateway = ProviderGateway::from_entry(entry, &config.breaker, clock.clone())?;
            registry.insert(gateway);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, gateway: ProviderGateway) {
        self.gateways
            .insert(gateway.id().to_string(), Arc::new(gateway));
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<ProviderGateway>> {
        self.gateways.get(provider_id).cloned()
    }

    /// Look up a provider an agent depends on. A missing provider is Fatal.
    pub fn require(&self, provider_id: &str) -> std::result::Result<Arc<ProviderGateway>, AgentError> {
        self.get(provider_id)
            .ok_or_else(|| AgentError::fatal(format!("provider '{provider_id}' is not configured")))
    }

    /// Whether jobs gated on `provider_id` may dispatch now. Unknown ids
    /// are not gated.
    pub fn allows_dispatch(&self, provider_id: &str, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.gateways
            .get(provider_id)
            .is_none_or(|g| g.breaker().allows_dispatch(now))
    }

    /// Breaker snapshots, sorted by provider id.
    pub fn states(&self) -> Vec<ProviderState> {
        let mut states: Vec<ProviderState> = self
            .gateways
            .values()
            .map(|g| g.breaker().snapshot())
            .collect();
        states.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        states
    }

    pub fn restore(&self, states: &[ProviderState]) {
        for state in states {
            if let Some(gateway) = self.gateways.get(&state.provider_id) {
                gateway.breaker().restore(state);
            }
        }
    }
}
