use thiserror::Error;

/// Errors raised by the measurement ledger.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("test keys already finalized")]
    AlreadyFinalized,
}

/// Errors raised while running or submitting a measurement.
#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("invalid input url: {0}")]
    InvalidInput(#[from] url::ParseError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("refusing to submit measurement: fundamental failure: {0}")]
    FundamentalFailure(String),
    #[error("cannot serialize test keys: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by resolver transports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("dns_nxdomain_error")]
    NoSuchHost,
    #[error("dns_no_answer")]
    NoAnswer,
    #[error("generic_timeout_error")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Errors returned by the persistence collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no such result: {0}")]
    NoSuchResult(i64),
    #[error("no such measurement: {0}")]
    NoSuchMeasurement(i64),
    #[error("invalid measurement json: {0}")]
    InvalidJson(String),
    #[error("store lock poisoned")]
    Poisoned,
}
