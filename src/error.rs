//! The discriminated error boundary described in §7.
//!
//! The core never retries; it surfaces one of these kinds to the caller.
//! Degenerate inputs that §7 calls out as "degrade, don't fail" (a bad
//! level-policy statistic, an out-of-range probability) are handled at the
//! call site instead of reaching this type.

/// Error kinds surfaced at the core boundary (§7).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `n <= 0`, `base_depth > td`, a malformed points array, or a
    /// mismatched `levels`/`thresholds` pair in a band policy.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A requested depth exceeds [`crate::MAX_DEPTH`].
    #[error("requested depth {requested} exceeds capacity {max}")]
    CapacityExceeded { requested: u32, max: u32 },

    /// The forest backend refused allocation, refinement, or balancing.
    #[error("forest backend failure: {0}")]
    BackendFailure(String),

    /// Raised only at collaborator boundaries (CSV, PGM/SVG, CLI I/O).
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),
}
