//! The closed error taxonomy that the public facade commits to (spec §7).
//!
//! Everything below the facade (providers, the coordinator's sampling loop, the sensor
//! reader) keeps using `anyhow::Result` internally, the way the teacher probes do; this type
//! only appears at the boundaries that need to be matched on by callers.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NembError {
    /// Required hardware is absent (no RAPL nodes, no GPU). Surfaced at `initialize`,
    /// never retried within the same `Meter`.
    #[error("no hardware sensors of this kind are present: {0}")]
    Unavailable(String),

    /// Hardware is present but not readable by the current process.
    #[error("insufficient permission to read {resource}: {detail}")]
    Permission { resource: String, detail: String },

    /// A single sensor read timed out or returned unparsable content. Never seen by a
    /// `Meter` caller directly, counted per-provider and reported via diagnostics.
    #[error("transient read failure on {0}")]
    TransientRead(String),

    /// A provider exceeded its failure budget and was marked `failed`.
    #[error("provider '{0}' exceeded its failure budget and was marked failed")]
    ProviderFault(String),

    /// Two or more overlapping providers disagreed beyond `cross_validation_threshold`.
    #[error("cross-validation mismatch: {0:.4} deviation exceeds threshold")]
    CrossValidationMismatch(f64),

    /// Two consecutive raw counter values differed by more than `max_raw / 2`; logged as
    /// a possible missed wraparound but never corrected for.
    #[error("counter '{0}' saturated or missed a wraparound")]
    Saturation(String),

    /// No active providers, clock init failed, or the coordinator was already running.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type NembResult<T> = Result<T, NembError>;
