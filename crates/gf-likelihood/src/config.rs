//! Session and internal-fit settings.

use crate::optimizer::OptimizerConfig;
use gf_core::{Error, Result};
use gf_response::ConvolutionConfig;
use gf_sky::Roi;
use serde::{Deserialize, Serialize};

/// Settings of the internal nuisance-parameter fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalFitConfig {
    /// Maximum number of L-BFGS iterations
    pub max_iter: u64,
    /// Convergence tolerance on the projected gradient norm
    pub tol: f64,
    /// Number of stored L-BFGS corrections
    pub m: usize,
    /// Estimate parameter errors from the Hessian after the fit
    pub compute_errors: bool,
}

impl Default for InternalFitConfig {
    fn default() -> Self {
        let opt = OptimizerConfig::default();
        Self { max_iter: opt.max_iter, tol: opt.tol, m: opt.m, compute_errors: true }
    }
}

impl InternalFitConfig {
    /// Optimizer settings
    pub fn optimizer(&self) -> OptimizerConfig {
        OptimizerConfig { max_iter: self.max_iter, tol: self.tol, m: self.m }
    }
}

/// Settings of a [`crate::LikeSession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Padding added around the sources when the ROI is derived from them, degrees
    pub roi_padding_deg: f64,
    /// Fixed ROI; derived from the sources when `None`
    pub fixed_roi: Option<Roi>,
    /// Internal fit settings
    pub internal_fit: InternalFitConfig,
    /// Extended-source convolution grid
    pub convolution: ConvolutionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            roi_padding_deg: 5.0,
            fixed_roi: None,
            internal_fit: InternalFitConfig::default(),
            convolution: ConvolutionConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Check settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.roi_padding_deg.is_finite() && self.roi_padding_deg >= 0.0) {
            return Err(Error::Validation(format!("invalid ROI padding {}", self.roi_padding_deg)));
        }
        let fit = &self.internal_fit;
        if fit.max_iter == 0 || fit.m == 0 || !(fit.tol.is_finite() && fit.tol > 0.0) {
            return Err(Error::Validation("invalid internal fit settings".into()));
        }
        self.convolution.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let cfg: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, SessionConfig::default());
        assert_eq!(cfg.roi_padding_deg, 5.0);
        assert_eq!(cfg.internal_fit.optimizer().max_iter, 1000);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_fixed_roi_and_validation() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"fixed_roi": {"type": "disc", "ra": 83.6, "dec": 22.0, "radius": 3.0},
                "internal_fit": {"tol": 1e-8}}"#,
        )
        .unwrap();
        assert_eq!(cfg.fixed_roi, Some(Roi::Disc { ra: 83.6, dec: 22.0, radius: 3.0 }));
        assert_eq!(cfg.internal_fit.tol, 1e-8);
        assert_eq!(cfg.internal_fit.m, 10);

        let bad = SessionConfig { roi_padding_deg: -1.0, ..SessionConfig::default() };
        assert!(bad.validate().is_err());
    }
}
