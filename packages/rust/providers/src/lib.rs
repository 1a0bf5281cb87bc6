//! External data providers, circuit breaking, and the call gateway.
//!
//! This crate provides:
//! - [`Provider`]: the submit/poll contract every data source satisfies
//! - Provider variants: [`FixtureProvider`], [`HttpJsonProvider`],
//!   [`QueuedHttpProvider`], [`PageFetchProvider`]
//! - [`CircuitBreaker`]: per-provider failure isolation
//! - [`ProviderGateway`]: deadline, polling, cancellation and breaker
//!   bookkeeping around one provider, and [`ProviderRegistry`] mapping
//!   provider ids to gateways

pub mod breaker;
pub mod error;
pub mod fixture;
pub mod gateway;
pub mod http;
pub mod model;
pub mod page;
pub mod provider;

pub use breaker::{CircuitBreaker, Permit};
pub use error::ProviderError;
pub use fixture::FixtureProvider;
pub use gateway::{ProviderGateway, ProviderRegistry};
pub use http::{HttpJsonProvider, QueuedHttpProvider};
pub use model::{
    BacklinkPayload, DetectedTech, PagePayload, PollStatus, ProviderRequest, ProviderTicket,
    SerpPayload, SerpResult, TechPayload, decode_payload,
};
pub use page::PageFetchProvider;
pub use provider::Provider;

/// User-Agent string for outbound provider requests.
pub(crate) const USER_AGENT: &str = concat!("Cartograph/", env!("CARGO_PKG_VERSION"));
