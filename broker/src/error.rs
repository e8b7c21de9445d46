//! Error types for the `broker` crate.
//!
//! Follows the same pattern as the other layers: a root `Error` struct holding an
//! `error_kind` and the optional original error as `source`. Most `BrokerClient`
//! operations absorb these into `false`/empty results; only `subscribe` and the
//! message streams hand them to callers.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: BrokerErrorKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerErrorKind {
    /// The broker could not be reached or a client handle could not be created.
    Unavailable,
    /// A consumer failed to bind or failed mid-stream.
    Subscription,
    /// A payload could not be encoded to or decoded from the wire.
    Codec,
    /// A topic administration call failed.
    Admin,
}

impl Error {
    pub fn new(error_kind: BrokerErrorKind) -> Self {
        Error {
            source: None,
            error_kind,
        }
    }

    pub fn with_source<E>(error_kind: BrokerErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error {
            source: Some(source.into()),
            error_kind,
        }
    }

    pub fn unavailable<E>(source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::with_source(BrokerErrorKind::Unavailable, source)
    }

    pub fn subscription<E>(source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::with_source(BrokerErrorKind::Subscription, source)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "Broker error ({:?}): {}", self.error_kind, source),
            None => write!(f, "Broker error ({:?})", self.error_kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::with_source(BrokerErrorKind::Codec, err)
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Error::with_source(BrokerErrorKind::Unavailable, err)
    }
}

#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Error::with_source(BrokerErrorKind::Unavailable, err)
    }
}
