//! # gf-core
//!
//! Shared building blocks for gammafit: the error type, fit results and
//! handles to externally owned free parameters.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error type and `Result` alias.
pub mod error;
/// Tunable parameter handles.
pub mod traits;
/// Fit result containers.
pub mod types;

pub use error::{Error, Result};
pub use traits::{SharedParameters, Tunable};
pub use types::FitResult;
