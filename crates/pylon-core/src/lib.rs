//! # pylon-core
//!
//! Connection admission, message dispatch, and dependency resilience for
//! the Pylon message gateway.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Rbac** - Pure role-set authorization
//! - **CircuitBreaker** - Per-dependency resilience state machine
//! - **RateLimiter** - Sliding-window rate limiting and connection admission
//! - **MessageRouter** - Write-once registry dispatching typed envelopes
//! - **ConnectionManager** - Live connection set with broadcast fan-out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Gateway   │───▶│ RateLimiter  │───▶│ SharedStore  │
//! └─────────────┘    └──────────────┘    └──────────────┘
//!        │                   │ guarded by CircuitBreaker
//!        ▼                   ▼
//! ┌─────────────┐    ┌──────────────┐
//! │MessageRouter│───▶│  Handlers    │
//! └─────────────┘    └──────────────┘
//!        │
//!        ▼
//! ┌──────────────────┐
//! │ConnectionManager │
//! └──────────────────┘
//! ```

pub mod breaker;
pub mod identity;
pub mod limiter;
pub mod manager;
pub mod rbac;
pub mod router;
pub mod store;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState};
pub use identity::{Identity, IdentityError, IdentityProvider};
pub use limiter::{FailurePolicy, LimiterConfig, Quota, RateDecision, RateLimiter};
pub use manager::{BroadcastReport, ConnectionId, ConnectionManager};
pub use router::{
    HandlerError, MessageHandler, MessageRouter, NoopValidator, Registration, RouterBuildError,
    RouterBuilder, SchemaValidator, ValidationError,
};
pub use store::{MemoryStore, SharedStore, StoreError};
