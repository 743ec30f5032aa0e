//! # gf-likelihood
//!
//! Poisson likelihood of pixelized gamma-ray sky maps under a source model.
//!
//! This crate provides:
//! - [`CalcBin`]: expected counts, model maps and log-likelihoods of one analysis bin
//! - [`InternalModel`] / [`InternalModelBin`]: common norm, background norms and surfaces
//! - the internal nuisance-parameter fit (L-BFGS-B)
//! - [`LikeSession`]: all bins of a data set, evaluated in parallel, and the test statistic

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Parametric background surfaces.
pub mod background;
/// Per-bin likelihood kernel.
pub mod calc_bin;
/// Session and internal-fit settings.
pub mod config;
/// Global nuisance-parameter state.
pub mod internal_model;
/// Per-bin nuisance-parameter state.
pub mod internal_model_bin;
/// Internal nuisance-parameter fit.
pub mod minimize;
/// Generic numerical optimizer (L-BFGS-B backend).
pub mod optimizer;
/// Session orchestration over all analysis bins.
pub mod session;

pub use background::{
    BackgroundModel, BackgroundModelSpec, BackgroundSurface, BackgroundSurfaceSpec, ConstantSurface,
    PolynomialSurface, fit_surface,
};
pub use calc_bin::{CalcBin, SourceContext, WeightSums, poisson_log_likelihood};
pub use config::{InternalFitConfig, SessionConfig};
pub use internal_model::{FreeParameter, InternalModel};
pub use internal_model_bin::InternalModelBin;
pub use minimize::{Hypothesis, InternalFitStatus, Region};
pub use optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use session::{LikeSession, LikelihoodResult, NormEstimate, TsResult};
