use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("Realtime backend is disconnected")]
    Disconnected,

    #[error("Channel {0} is closed")]
    ChannelClosed(String),
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
