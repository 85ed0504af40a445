//! Realtime pub/sub surface for Kindred.
//!
//! The core never talks to a concrete realtime SDK. It sees two narrow traits:
//!
//! - [`Channel`] - a named topic you can `subscribe` to, `publish` on, and
//!   `track` presence in; `unsubscribe` releases everything the handle owns.
//! - [`RealtimeBackend`] - hands out channels, filtered table change feeds
//!   and the current [`ConnectionState`](kindred_shared::ConnectionState).
//!
//! [`RealtimeHub`] is the in-process implementation used for local
//! development and tests. Each subscriber owns a bounded queue; events are
//! fanned out with `try_send` so a slow listener only loses its own events.

pub mod channel;
pub mod error;
pub mod filter;
pub mod hub;

pub use channel::{Channel, EventStream, RealtimeBackend};
pub use error::RealtimeError;
pub use filter::ChangeFilter;
pub use hub::{HubChannel, RealtimeHub};
