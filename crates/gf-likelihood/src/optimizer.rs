//! Bounded L-BFGS minimization and Hessian-based uncertainties.
//!
//! Box bounds are handled outside argmin: every trial point is clamped into
//! the box and gradient components pointing out through an active bound are
//! dropped, so the line search never leaves the feasible region.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use gf_core::{Error, Result};
use nalgebra::DMatrix;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Distance from a bound below which it counts as active
const ACTIVE_BOUND_EPS: f64 = 1e-12;

/// Relative step of the central-difference gradient
const GRADIENT_STEP: f64 = 1e-7;

/// Relative step of the forward-difference Hessian
const HESSIAN_STEP: f64 = 1e-4;

/// Settings of the L-BFGS-B optimizer
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Convergence tolerance on the projected gradient norm
    pub tol: f64,
    /// Number of stored corrections
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10 }
    }
}

impl OptimizerConfig {
    /// Tolerance on the change of the objective between iterations.
    ///
    /// argmin's default is machine epsilon, which summed log-likelihoods of
    /// many pixels never reach.
    fn cost_tolerance(&self) -> f64 {
        if self.tol == 0.0 { 0.0 } else { (0.1 * self.tol).max(1e-12) }
    }
}

/// Outcome of a minimization
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best parameters found, inside the bounds
    pub parameters: Vec<f64>,
    /// Objective at `parameters`
    pub fval: f64,
    /// Iterations used
    pub n_iter: u64,
    /// Objective evaluations
    pub n_fev: usize,
    /// Gradient evaluations
    pub n_gev: usize,
    /// Whether the solver reported convergence
    pub converged: bool,
    /// Termination status as text
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "f = {:.6} at {:?} after {} iterations ({} evaluations, {} gradients), {}",
            self.fval, self.parameters, self.n_iter, self.n_fev, self.n_gev, self.message
        )
    }
}

/// Function to minimize.
pub trait ObjectiveFunction: Send + Sync {
    /// Value at `params`
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at `params`; central differences unless overridden.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut probe = params.to_vec();
        params
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let h = GRADIENT_STEP * x.abs().max(1.0);
                probe[i] = x + h;
                let up = self.eval(&probe)?;
                probe[i] = x - h;
                let down = self.eval(&probe)?;
                probe[i] = x;
                Ok((up - down) / (2.0 * h))
            })
            .collect()
    }
}

fn clamp_into(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

#[derive(Default)]
struct EvalCounts {
    cost: AtomicUsize,
    gradient: AtomicUsize,
}

/// Objective restricted to a box, counting its evaluations.
struct BoxedObjective<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    counts: &'a EvalCounts,
}

impl BoxedObjective<'_> {
    /// Drop gradient components that would push `x` out through an active bound.
    fn project(&self, x: &[f64], grad: &mut [f64]) {
        for ((g, &xi), &(lo, hi)) in grad.iter_mut().zip(x).zip(self.bounds) {
            let at_lower = xi <= lo + ACTIVE_BOUND_EPS && *g > 0.0;
            let at_upper = xi >= hi - ACTIVE_BOUND_EPS && *g < 0.0;
            if at_lower || at_upper {
                *g = 0.0;
            }
        }
    }
}

fn to_argmin(e: Error) -> argmin::core::Error {
    argmin::core::Error::msg(e.to_string())
}

impl CostFunction for BoxedObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Vec<f64>) -> std::result::Result<f64, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        self.objective.eval(&clamp_into(params, self.bounds)).map_err(to_argmin)
    }
}

impl Gradient for BoxedObjective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Vec<f64>) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        self.counts.gradient.fetch_add(1, Ordering::Relaxed);
        let x = clamp_into(params, self.bounds);
        let mut grad = self.objective.gradient(&x).map_err(to_argmin)?;
        self.project(&x, &mut grad);
        Ok(grad)
    }
}

/// L-BFGS with box constraints
#[derive(Debug, Clone, Default)]
pub struct LbfgsbOptimizer {
    config: OptimizerConfig,
}

impl LbfgsbOptimizer {
    /// Optimizer with the given settings
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize `objective` from `start` within `bounds` (`(lower, upper)` per parameter).
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        start: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        if start.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "{} start values given for {} bounded parameters",
                start.len(),
                bounds.len()
            )));
        }
        if let Some((lo, hi)) = bounds.iter().find(|(lo, hi)| !(lo <= hi)) {
            return Err(Error::Validation(format!("empty parameter range [{lo}, {hi}]")));
        }

        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.config.m)
            .with_tolerance_grad(self.config.tol)
            .and_then(|s| s.with_tolerance_cost(self.config.cost_tolerance()))
            .map_err(|e| Error::Validation(format!("invalid optimizer tolerance: {e}")))?;
        let counts = EvalCounts::default();
        let problem = BoxedObjective { objective, bounds, counts: &counts };
        let start = clamp_into(start, bounds);
        let max_iter = self.config.max_iter;
        let run = Executor::new(problem, solver)
            .configure(|state| state.param(start).max_iters(max_iter))
            .run()
            .map_err(|e| Error::Computation(format!("minimization failed: {e}")))?;

        let state = run.state();
        let best = state.get_best_param().ok_or_else(|| Error::Computation("minimizer kept no best point".into()))?;
        let status = state.get_termination_status();
        let converged = matches!(
            status,
            TerminationStatus::Terminated(TerminationReason::SolverConverged | TerminationReason::TargetCostReached)
        );
        Ok(OptimizationResult {
            parameters: clamp_into(best, bounds),
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: counts.cost.load(Ordering::Relaxed),
            n_gev: counts.gradient.load(Ordering::Relaxed),
            converged,
            message: status.to_string(),
        })
    }
}

/// Symmetrised Hessian of `objective` at `params` from forward differences of its gradient.
pub fn hessian(objective: &dyn ObjectiveFunction, params: &[f64]) -> Result<DMatrix<f64>> {
    let n = params.len();
    let g0 = objective.gradient(params)?;
    let mut h = DMatrix::zeros(n, n);
    let mut probe = params.to_vec();
    for j in 0..n {
        let step = HESSIAN_STEP * params[j].abs().max(1.0);
        probe[j] = params[j] + step;
        let g = objective.gradient(&probe)?;
        probe[j] = params[j];
        for i in 0..n {
            h[(i, j)] = (g[i] - g0[i]) / step;
        }
    }
    let ht = h.transpose();
    Ok((&h + &ht) * 0.5)
}

/// Covariance from a negative-log-likelihood Hessian.
///
/// Tries Cholesky with geometrically increasing diagonal damping, then LU.
/// Returns `None` when no inverse with positive variances exists.
pub fn invert_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = hessian.nrows();
    let identity = DMatrix::identity(n, n);
    let scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(1.0_f64, f64::max);

    let mut damped = hessian.clone();
    let mut added = 0.0_f64;
    for _ in 0..10 {
        if let Some(chol) = damped.clone().cholesky() {
            return Some(chol.solve(&identity));
        }
        let next = if added == 0.0 { scale * 1e-9 } else { added * 10.0 };
        for i in 0..n {
            damped[(i, i)] += next - added;
        }
        added = next;
    }

    let cov = damped.lu().try_inverse()?;
    (0..n).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] > 0.0).then_some(cov)
}
