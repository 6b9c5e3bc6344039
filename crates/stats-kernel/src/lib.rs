//! Numerical primitives shared by the planning components: sample
//! statistics, tail-risk measures and covariance matrix handling.

pub mod linalg;
pub mod random;
pub mod stats;

pub use linalg::{cholesky_with_fallback, nearest_psd, validate_symmetric, CholeskyFactor};
pub use random::{stream_rng, StreamRng};
pub use stats::*;
