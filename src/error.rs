//! Typed failures the pipeline reacts to. Everything else is `anyhow`.

use thiserror::Error;

/// A live-feed frame or element that could not be turned into a payload.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown event class '{0}'")]
    UnknownClass(String),

    #[error("bad extra payload for class '{class}': {source}")]
    BadExtra {
        class: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure to deliver one push message to one recipient token.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The token is unknown or expired at the push provider
    #[error("invalid token")]
    InvalidToken,

    #[error("rejected with status {status}")]
    Rejected { status: u16 },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl DeliveryError {
    /// Permanent failures remove the subscriber; the rest are retried by the
    /// next event.
    pub fn is_permanent(&self) -> bool {
        match self {
            DeliveryError::InvalidToken => true,
            DeliveryError::Rejected { status } => {
                (400..500).contains(status) && *status != 429 && *status != 408
            }
            DeliveryError::Transport(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanence_of_delivery_errors() {
        assert!(DeliveryError::InvalidToken.is_permanent());
        assert!(DeliveryError::Rejected { status: 410 }.is_permanent());
        assert!(!DeliveryError::Rejected { status: 429 }.is_permanent());
        assert!(!DeliveryError::Rejected { status: 503 }.is_permanent());
        assert!(!DeliveryError::Transport("reset".into()).is_permanent());
    }
}
