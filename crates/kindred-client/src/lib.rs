//! Kindred client core.
//!
//! Coordinates chat, matching and presence for a fitness-partner app on top
//! of three collaborators: a relational store, a realtime pub/sub backend
//! and an AI text endpoint. Sends survive disconnects through a durable
//! retry queue; live views are deduplicated and registered at most once per
//! logical key.

pub mod ai;
pub mod backend;
pub mod chat;
pub mod config;
pub mod context;
pub mod dedup;
pub mod error;
pub mod events;
pub mod local_echo;
pub mod matches;
pub mod presence;
pub mod rate_limit;
pub mod registry;
pub mod retry_queue;

use tracing_subscriber::{fmt, EnvFilter};

pub use chat::{ChatCoordinator, RetryReport, SendOutcome};
pub use config::CoreConfig;
pub use context::{AppContext, Collaborators, LocalApp};
pub use error::{AiError, BackendError, CoreError, EchoError};
pub use events::{Callback, PresenceState};
pub use matches::{MatchCoordinator, MatchWithPartner, SwipeOutcome, SwipeRejection};
pub use presence::PresenceCoordinator;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::{SubscriptionHandle, SubscriptionRegistry, Teardown};
pub use retry_queue::{PendingDelivery, PersistentRetryQueue};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("kindred_client=debug,kindred_realtime=info,kindred_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
