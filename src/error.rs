//! Error types for tinybureau.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Protocol conflict: {digest} is already handled in protocol '{protocol}'")]
    ProtocolConflict { protocol: String, digest: String },

    #[error("Delivery to {0} timed out")]
    DeliveryTimeout(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Routing error: no agent with address {0}")]
    Routing(String),

    #[error("Bad signature on envelope from {0}")]
    BadSignature(String),

    #[error("Envelope expired at {0}")]
    Expired(i64),

    #[error("Duplicate agent address: {0}")]
    DuplicateAgent(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Web error: {0}")]
    Web(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error only affects a single message or send call.
    pub fn is_message_level(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::DeliveryTimeout(_)
                | Error::Delivery(_)
                | Error::Routing(_)
                | Error::BadSignature(_)
                | Error::Expired(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("sqlite: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_level_classification() {
        assert!(Error::Validation("missing field".into()).is_message_level());
        assert!(Error::DeliveryTimeout("agent1".into()).is_message_level());
        assert!(!Error::Identity("bad key".into()).is_message_level());
        assert!(!Error::ProtocolConflict {
            protocol: "p".into(),
            digest: "model:00".into()
        }
        .is_message_level());
    }
}
