//! The provider contract.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::model::{PollStatus, ProviderRequest, ProviderTicket};

/// An external data source.
///
/// Both call shapes fit this contract: a synchronous source does its work in
/// `submit` and hands back a ticket whose first poll is `Ready`; a queued
/// source returns a task ticket that is polled until ready or failed.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifier matching the `[[providers]]` config entry.
    fn id(&self) -> &str;

    async fn submit(&self, request: &ProviderRequest) -> Result<ProviderTicket, ProviderError>;

    async fn poll(&self, ticket: &ProviderTicket) -> Result<PollStatus, ProviderError>;
}

/// `poll` for synchronous providers: the ticket already holds the payload.
pub(crate) fn poll_ready_ticket(ticket: &ProviderTicket) -> PollStatus {
    match &ticket.payload {
        Some(payload) => PollStatus::Ready(payload.clone()),
        None => PollStatus::Failed(format!("ticket {} carries no payload", ticket.task_id)),
    }
}
