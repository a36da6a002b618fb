//! Error handling for this crate
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Result containing a SystemError with its accompanying source
pub type TypedResult<T> = Result<T, TypedError>;

/// A semantic error kind raised by the simulator
///
/// The kinds are coarse on purpose; the interesting detail travels in the
/// anyhow source attached by [TypedError]. Arithmetic degeneracies (empty
/// series, zero-width windows in a mean) are NOT errors; they surface as NaN
/// and propagate numerically.
#[derive(Error, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    #[error("Invalid parameter")]
    Parameter,
    #[error("Malformed distribution type string")]
    DistributionSpec,
    #[error("Requested moment has no closed form")]
    Moment,
    #[error("Empty or zero-width observation window")]
    DegenerateWindow,
    #[error("Unstable system detected after run")]
    Unstable,
    #[error("Substream state table error")]
    SubstreamTable,
}

/// Combination of a SystemError with an anyhow error
#[derive(Error, Debug)]
#[error("{err:?}: {source:?}")]
pub struct TypedError {
    err: SystemError,
    source: anyhow::Error,
}

impl TypedError {
    /// Creates a new TypedError
    pub fn new(err: SystemError, source: anyhow::Error) -> Self {
        Self { err, source }
    }
    /// Returns the SystemError of this TypedError
    pub fn err(&self) -> SystemError {
        self.err
    }
    /// Returns the anyhow error of this TypedError
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Converts a Result into one of our own Result types
pub trait ResultExt<T> {
    /// Converts a Result to a TypedResult
    fn typ(self, err: SystemError) -> TypedResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn typ(self, err: SystemError) -> TypedResult<T> {
        self.map_err(|e| TypedError {
            err,
            source: e.into(),
        })
    }
}
