//! Error taxonomy for the node agent.
//!
//! Module errors (`CommandError`, `SupervisorError`, `GuestError`,
//! `StoreError`) convert into [`Error`], which callers match on to decide
//! whether a failure is benign, retryable or fatal.

use stratus_networking::NetworkError;
use stratus_reconcile::PollError;
use thiserror::Error;

use crate::command::CommandError;
use crate::qemu::GuestError;
use crate::state::StoreError;
use crate::systemd::SupervisorError;

/// Node agent errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Unresolvable address block, missing adapters. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Power-on or shutdown confirmation exceeded its attempts.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Referenced disk or record vanished.
    #[error("not found: {0}")]
    NotFound(String),

    /// A mandatory address or interface never appeared.
    #[error("network error: {0}")]
    Network(String),

    /// Unreadable unit descriptor or directory.
    #[error("read error: {context}: {source}")]
    Read {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed unit descriptor or command output.
    #[error("parse error: {context}: {source}")]
    Parse {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for node agent operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error means the target is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Store(StoreError::NotFound(_))
        )
    }

    pub(crate) fn read(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Read {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Parse {
            context: context.into(),
            source,
        }
    }
}

impl From<NetworkError> for Error {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Config(msg) => Error::Configuration(msg),
            NetworkError::Parse { what, source } => Error::parse(what, source),
            other => Error::Network(other.to_string()),
        }
    }
}

impl From<PollError<Error>> for Error {
    fn from(err: PollError<Error>) -> Self {
        match err {
            PollError::Exhausted { attempts } => {
                Error::Timeout(format!("gave up after {} attempts", attempts))
            }
            PollError::Probe(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_covers_store() {
        assert!(Error::NotFound("disk".into()).is_not_found());
        assert!(Error::Store(StoreError::NotFound("vm".into())).is_not_found());
        assert!(!Error::Timeout("boot".into()).is_not_found());
    }

    #[test]
    fn test_block_config_error_maps_to_configuration() {
        let err: Error = NetworkError::Config("block public: invalid gateway".into()).into();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_exhausted_poll_maps_to_timeout() {
        let err: Error = PollError::<Error>::Exhausted { attempts: 3 }.into();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
