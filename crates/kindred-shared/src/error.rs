use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError {
    #[error("Unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}
