//! LLM Relay Fallback Core
//!
//! The failover core of an LLM request relay: a set of upstream accounts
//! (credentials to a model provider) is fronted by handlers that route each
//! request to a healthy account, transparently retry on another account when
//! an attempt fails, and protect whole traffic groups from cascading overload.
//!
//! # Features
//!
//! - **Account selection**: priority, weighted, round-robin, least-used,
//!   hybrid, plus adaptive and load-aware decorators
//! - **Per-attempt response capture**: streaming replies pass through live,
//!   buffered replies are replayed only after the attempt succeeds
//! - **Circuit breaking**: per-group three-state breaker with probe recovery
//! - **Health tracking**: rolling per-account statistics with auto-disable
//!   and a periodic status sweep
//! - **Group partitioning**: lazily instantiated handler per traffic group
//!
//! The outer HTTP server, authentication, the account store, and the upstream
//! client are collaborators: callers supply a [`sink::ResponseSink`], an
//! [`fallback::UpstreamExecutor`], and the candidate [`account::Account`]
//! list per request.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod config;
pub mod error;
pub mod fallback;
pub mod sink;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
