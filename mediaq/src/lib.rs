//! mediaq library crate.
//!
//! A media download orchestrator: jobs are submitted, queued or scheduled,
//! run through an extraction engine under a concurrency bound, retried with
//! backoff and reported to subscribers as a stream of events.

pub mod broadcast;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod history;
pub mod limiter;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod utils;
pub mod worker;

pub use broadcast::{EventBroadcaster, Subscription};
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
