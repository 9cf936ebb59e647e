use thiserror::Error;

use crate::core::{LimitsError, SubjectError};
use crate::server::BrokerError;
use crate::store::StoreError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error: a thin wrapper over the module errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Subject(#[from] SubjectError),

    #[error(transparent)]
    Limits(#[from] LimitsError),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Broker(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Subject(_) => Transience::Permanent,
            Error::Limits(_) => Transience::Permanent,
            Error::Config(_) => Transience::Permanent,
        }
    }
}
