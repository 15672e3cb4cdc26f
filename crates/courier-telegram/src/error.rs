use thiserror::Error;

use courier_agent::CompletionError;
use courier_history::StoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Telegram API error ({status}): {description}")]
    Api { status: u16, description: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
