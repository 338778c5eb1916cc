use std::error::Error;
use std::fmt::{Display, Formatter};

/// Error kind that represents failures reported by the [`crate::Client`] and the [`crate::FeatureRepository`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ErrorKind {
    /// Initialization of an internal HTTP client failed.
    HttpClientInitFailure = 1,
    /// The given client key is empty or has an invalid format.
    InvalidClientKey = 10,
    /// The given API host is not a valid URL.
    InvalidApiHost = 11,
    /// No feature payload could be loaded and no previous payload is available.
    FeaturesNotAvailable = 20,
    /// Unexpected HTTP response was received (non-2xx status code).
    UnexpectedHttpResponse = 21,
    /// The HTTP request timed out.
    HttpRequestTimeout = 22,
    /// The HTTP request failed (most likely, due to a local network issue).
    HttpRequestFailure = 23,
    /// A 2xx HTTP response was received with an invalid content.
    InvalidHttpResponseContent = 24,
    /// The payload contains encrypted features but no decryption key was configured.
    DecryptionKeyMissing = 30,
    /// Decrypting the encrypted features failed (wrong key or corrupt payload).
    DecryptionFailure = 31,
    /// The streaming connection failed.
    StreamFailure = 40,
    /// The evaluated feature value couldn't be converted to the requested type.
    FeatureValueTypeMismatch = 50,
}

impl ErrorKind {
    pub(crate) fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Error struct that holds the [`ErrorKind`] and message of the reported failure.
#[derive(Debug, PartialEq)]
pub struct ClientError {
    /// Error kind that represents the failure.
    pub kind: ErrorKind,
    /// The text representation of the failure.
    pub message: String,
}

impl ClientError {
    pub(crate) fn new(kind: ErrorKind, message: String) -> Self {
        Self { message, kind }
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message.as_str())
    }
}

impl Error for ClientError {}

#[cfg(test)]
mod errors_tests {
    use crate::errors::ErrorKind::*;

    #[test]
    fn event_ids() {
        assert_eq!(HttpClientInitFailure.as_u8(), 1);
        assert_eq!(InvalidClientKey.as_u8(), 10);
        assert_eq!(StreamFailure.as_u8(), 40);
        assert_eq!(FeatureValueTypeMismatch.as_u8(), 50);
    }
}
