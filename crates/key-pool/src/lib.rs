//! Rate-limited API key pool and retrying generation
//!
//! `CredentialScheduler` hands out API keys round-robin while enforcing a
//! per-key quota over a rolling window (2 uses per 60 seconds by default).
//! When every key is saturated, callers wait until a window resets; acquiring
//! never fails.
//!
//! `RetryOrchestrator` runs an `AttemptPlan`: one (model, temperature) pair
//! per attempt, a freshly scheduled key for each, and a fixed backoff between
//! failed attempts. Every upstream failure is retried the same way until the
//! plan runs out.

pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod scheduler;

pub use error::{Error, Result};
pub use orchestrator::{Generation, RetryOrchestrator, RetrySettings};
pub use plan::{Attempt, AttemptPlan};
pub use scheduler::{CredentialScheduler, CredentialUsage, PoolSnapshot, QuotaPolicy};
