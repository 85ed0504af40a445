//! Types shared by every Kindred crate: identifiers, domain enums, timing
//! constants, the retry backoff formula and the realtime event protocol.

pub mod backoff;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use backoff::backoff_delay;
pub use error::SharedError;
pub use protocol::{ChangeEvent, ChangeKind, PresenceEvent, PresenceEventKind, RealtimeEvent, TypingSignal};
pub use types::*;
