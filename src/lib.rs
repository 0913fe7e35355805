//! Measurement core for web connectivity tests.
//!
//! Probe tasks record observations into a shared [`ledger::Ledger`]. Once
//! every task has joined, the ledger is frozen and the classifier in
//! [`analysis`] decides whether the target was blocked and how.

pub mod analysis;
pub mod arbiter;
pub mod config;
pub mod error;
pub mod flags;
pub mod ledger;
pub mod measurement;
pub mod model;
pub mod stats;
pub mod store;
pub mod verdict;
pub mod whoami;


pub use error::{LedgerError, MeasurementError, ResolverError, StoreError};
pub use ledger::{Ledger, TestKeys};
pub use measurement::{submit, Measurement};
