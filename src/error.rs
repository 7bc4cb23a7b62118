//! Error types shared by the whole crate.

use crate::batch::BatchError;
use std::io;
use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error of a benchmark run.
#[derive(Debug, Error)]
pub enum Error {
    /// The benchmark or store configuration is invalid. Nothing has been started yet.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The store failed outside of the measured workload (init, shutdown, population).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Writing result files failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The run was stopped because a worker hit a non-retryable failure. Statistics collected up
    /// to that point have been dumped.
    #[error("benchmark failed: {0}")]
    Failed(String),
}

/// Errors detected while parsing or validating configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("sum of operation percentages should be 100, got {0}")]
    MixNotHundred(u32),

    #[error("malformed distribution `{0}`, expected uniform, uniform_<lo>_<hi>, zipf_<hot>_<access> or const_<n>")]
    MalformedDistribution(String),

    #[error("distribution `{0}` has an empty range")]
    EmptyRange(String),

    #[error("malformed duration `{0}`, expected sec<N> or ops<N>")]
    MalformedDuration(String),

    #[error("unknown key type `{0}`, expected fkvb, random, sharded_fkvb or sharded_random")]
    UnknownKeyType(String),

    #[error("cannot support {num_keys} keys with a key size of {key_size} and a prefix of {prefix_len} bytes")]
    KeyTooNarrow {
        num_keys: u64,
        key_size: usize,
        prefix_len: usize,
    },

    #[error("generic operations require a constant value size, got `{0}`")]
    GenericNeedsConstantValue(String),

    #[error("value size {size} does not fit in the value pool of {pool} bytes")]
    ValueTooLarge { size: u64, pool: usize },

    #[error("{0} should be positive")]
    NotPositive(&'static str),

    #[error("{name} should be at most {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error("store `{0}` not found in registry")]
    UnknownStore(String),

    #[error("skew calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("invalid option: {0}")]
    Invalid(String),
}

/// The zipfian skew search could not hit the requested hot-set/access pair.
#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("{hot_pct}% of {num_keys} keys never received {access_pct}% of accesses after {iterations} iterations (last skew {skew:.2})")]
    NotConverged {
        access_pct: u32,
        hot_pct: u32,
        num_keys: u64,
        iterations: usize,
        skew: f64,
    },

    #[error("skew {0:.4} makes the zipfian transform degenerate")]
    DegenerateSkew(f64),

    #[error("percentages should be within (0, 100), got hot {hot_pct} access {access_pct}")]
    InvalidTarget { access_pct: u32, hot_pct: u32 },
}

/// Errors reported by a store. Stores decide for themselves what is worth an error; a missing key
/// on `get` is not one.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("{0}")]
    Failed(String),

    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),
}

impl From<BatchError> for StoreError {
    fn from(e: BatchError) -> Self {
        StoreError::Failed(e.to_string())
    }
}
