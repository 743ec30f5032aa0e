//! Result of an internal nuisance fit

use serde::{Deserialize, Serialize};

/// Best-fit values of the free parameters of one likelihood minimization.
///
/// The covariance is stored row-major and is absent when the Hessian at the
/// minimum could not be inverted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Parameter names, in minimizer order
    pub names: Vec<String>,
    /// Best-fit values
    pub parameters: Vec<f64>,
    /// One-sigma errors from the covariance diagonal
    pub uncertainties: Vec<f64>,
    /// Row-major covariance
    pub covariance: Option<Vec<f64>>,
    /// Minimized negative log-likelihood
    pub neg_log_likelihood: f64,
    /// Whether the minimizer converged
    pub converged: bool,
    /// Objective evaluations spent
    pub n_fev: usize,
}

impl FitResult {
    /// Fit without covariance
    pub fn new(
        names: Vec<String>,
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        neg_log_likelihood: f64,
        converged: bool,
        n_fev: usize,
    ) -> Self {
        Self { names, parameters, uncertainties, covariance: None, neg_log_likelihood, converged, n_fev }
    }

    /// Attach a row-major covariance
    pub fn with_covariance(self, covariance: Vec<f64>) -> Self {
        Self { covariance: Some(covariance), ..self }
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Best-fit value of `name`
    pub fn value(&self, name: &str) -> Option<f64> {
        self.parameters.get(self.index(name)?).copied()
    }

    /// Error of `name`
    pub fn error(&self, name: &str) -> Option<f64> {
        self.uncertainties.get(self.index(name)?).copied()
    }

    /// Correlation coefficient between two named parameters
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        let (i, j) = (self.index(a)?, self.index(b)?);
        let n = self.parameters.len();
        let cov = self.covariance.as_ref().filter(|c| c.len() == n * n)?;
        let norm = self.uncertainties.get(i)? * self.uncertainties.get(j)?;
        (norm > 0.0).then(|| cov[i * n + j] / norm)
    }
}
