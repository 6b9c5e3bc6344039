//! Shared vocabulary of the planning engine: the data model every component
//! consumes, the error taxonomy, cooperative cancellation and boundary
//! validation helpers.

pub mod cancel;
pub mod error;
pub mod types;
pub mod validation;

pub use cancel::CancellationToken;
pub use error::*;
pub use types::*;
