use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error response from the API.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// The `410 Gone` response a watch returns once its resume token has been compacted away
    #[must_use]
    pub fn gone(message: impl Into<String>) -> Self {
        Self {
            status: "Failure".into(),
            message: message.into(),
            reason: "Expired".into(),
            code: 410,
        }
    }

    /// Whether the server signalled that the resume token is too old to resume from
    #[must_use]
    pub fn is_token_too_old(&self) -> bool {
        self.code == 410
    }
}

/// Possible errors when talking to the cluster API collaborator
#[derive(Error, Debug)]
pub enum Error {
    /// The API returned an error response
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// The transport failed to deliver a request or a stream
    #[error("ServiceError: {0}")]
    Service(String),

    /// A payload could not be (de)serialized
    #[error("Error deserializing response: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error carries an API response with the given `reason`
    #[must_use]
    pub fn is_api_reason(&self, reason: &str) -> bool {
        matches!(self, Error::Api(resp) if resp.reason == reason)
    }
}
