//! Internal nuisance-parameter fit.
//!
//! The source model is held fixed while the optimizer varies, in this
//! order: the free background-surface parameters of every bin, the extra
//! registered free parameters (model hypothesis only), one background norm
//! per bin and the common norm (model hypothesis only).
//!
//! Extra free parameters may change the source model. Parameters flagged as
//! detector-response parameters make every evaluation re-read all source
//! responses; otherwise responses are re-read only when the model's version
//! counters moved.

use crate::calc_bin::{CalcBin, SourceContext};
use crate::config::InternalFitConfig;
use crate::internal_model::{FreeParameter, InternalModel};
use crate::optimizer::{LbfgsbOptimizer, ObjectiveFunction, hessian, invert_hessian};
use gf_core::{Error, FitResult, Result, Tunable};
use gf_response::{DetectorResponse, ExtendedSourceResponse, ModelVersions, PointSourceResponse, SourceModel};
use gf_sky::SkyPos;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Smallest background norm the internal fit may reach
const MIN_BACKGROUND_NORM: f64 = 1e-6;

/// Which likelihood is maximized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypothesis {
    /// Background only
    Background,
    /// Background plus sources
    Model,
}

/// Pixels the likelihood is summed over.
#[derive(Debug, Clone, PartialEq)]
pub enum Region {
    /// Every bin's region of interest
    Roi,
    /// A disc around `center` with one radius per bin, each treated as a single pixel
    TopHat {
        /// Disc centre
        center: SkyPos,
        /// Radius per bin, degrees
        radii: Vec<f64>,
    },
}

/// Outcome of one internal fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalFitStatus {
    /// Parameters, errors and negative log-likelihood at the best point
    pub fit: FitResult,
    /// Optimizer termination message
    pub message: String,
}

impl InternalFitStatus {
    /// Whether the optimizer reported convergence
    pub fn converged(&self) -> bool {
        self.fit.converged
    }
}

/// Mutable view of the bins and source responses of a session.
pub(crate) struct BinsView<'a> {
    pub bins: &'a mut [CalcBin],
    pub response: &'a DetectorResponse,
    pub model: &'a dyn SourceModel,
    pub points: &'a mut [PointSourceResponse],
    pub extended: &'a mut [ExtendedSourceResponse],
    /// Model versions the responses were last read at
    pub seen: &'a mut ModelVersions,
}

impl BinsView<'_> {
    /// Summed log-likelihood over all bins.
    pub fn log_likelihood(&mut self, hypothesis: Hypothesis, region: &Region) -> Result<f64> {
        let ctx = SourceContext { response: self.response, points: &*self.points, extended: &*self.extended };
        let per_bin: Vec<f64> = match region {
            Region::Roi => self
                .bins
                .par_iter_mut()
                .map(|bin| match hypothesis {
                    Hypothesis::Background => bin.calc_background_log_likelihood(),
                    Hypothesis::Model => bin.calc_log_likelihood(&ctx),
                })
                .collect::<Result<_>>()?,
            Region::TopHat { center, radii } => {
                check_radii(self.bins.len(), radii)?;
                self.bins
                    .par_iter_mut()
                    .zip(radii.par_iter())
                    .map(|(bin, &radius)| match hypothesis {
                        Hypothesis::Background => bin.calc_top_hat_background_log_likelihood(center, radius),
                        Hypothesis::Model => bin.calc_top_hat_log_likelihood(&ctx, center, radius),
                    })
                    .collect::<Result<_>>()?
            }
        };
        let ll: f64 = per_bin.iter().sum();
        if !ll.is_finite() {
            return Err(Error::Numerical(format!("non-finite log-likelihood {ll}")));
        }
        Ok(ll)
    }

    /// Re-read every source response and drop the per-pixel caches.
    pub fn refresh_sources(&mut self) -> Result<()> {
        let versions = self.model.versions();
        for ps in self.points.iter_mut() {
            ps.update(self.model, self.response)?;
        }
        for ext in self.extended.iter_mut() {
            ext.update(self.model, self.response)?;
        }
        self.bins.iter_mut().for_each(CalcBin::clear_caches);
        *self.seen = versions;
        Ok(())
    }

    /// [`Self::refresh_sources`] if the model changed since the last read.
    pub fn sync_sources(&mut self) -> Result<bool> {
        if self.model.versions() == *self.seen {
            return Ok(false);
        }
        self.refresh_sources()?;
        Ok(true)
    }
}

/// When the objective re-reads source responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceRefresh {
    Never,
    OnModelChange,
    EveryStep,
}

impl SourceRefresh {
    fn for_fit(internal: &InternalModel, hypothesis: Hypothesis) -> Self {
        if hypothesis == Hypothesis::Background || internal.free_parameters().is_empty() {
            SourceRefresh::Never
        } else if internal.is_detector_response_free() {
            SourceRefresh::EveryStep
        } else {
            SourceRefresh::OnModelChange
        }
    }
}

/// One radius per bin.
pub(crate) fn check_radii(n_bins: usize, radii: &[f64]) -> Result<()> {
    if radii.len() != n_bins {
        return Err(Error::Validation(format!("{} top-hat radii given for {n_bins} analysis bins", radii.len())));
    }
    if let Some(r) = radii.iter().find(|r| !(r.is_finite() && **r >= 0.0)) {
        return Err(Error::Validation(format!("invalid top-hat radius {r}")));
    }
    Ok(())
}

/// Free parameters of one internal fit, in minimizer order.
struct Layout {
    names: Vec<String>,
    external: Vec<FreeParameter>,
    n_background_norms: usize,
    common_norm: bool,
}

impl Layout {
    fn new(bins: &[CalcBin], internal: &InternalModel, hypothesis: Hypothesis) -> Result<Self> {
        let mut external: Vec<FreeParameter> =
            bins.iter().flat_map(|b| b.internal_model_bin().free_background_parameters()).collect();
        if hypothesis == Hypothesis::Model {
            external.extend(internal.free_parameters().iter().cloned());
        }
        let mut names = external.iter().map(FreeParameter::name).collect::<Result<Vec<_>>>()?;
        let n_background_norms = if internal.is_background_norm_free() { bins.len() } else { 0 };
        names.extend(bins[..n_background_norms].iter().map(|b| format!("background_norm_bin{}", b.bin())));
        let common_norm = hypothesis == Hypothesis::Model && internal.is_common_norm_free();
        if common_norm {
            names.push("common_norm".into());
        }
        Ok(Self { names, external, n_background_norms, common_norm })
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn initial(&self, bins: &[CalcBin], internal: &InternalModel) -> Result<Vec<f64>> {
        let mut x = self.external.iter().map(FreeParameter::value).collect::<Result<Vec<_>>>()?;
        x.extend(bins[..self.n_background_norms].iter().map(|b| b.internal_model_bin().background_norm()));
        if self.common_norm {
            x.push(internal.common_norm());
        }
        Ok(x)
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        let mut b = vec![(f64::NEG_INFINITY, f64::INFINITY); self.external.len()];
        b.extend(std::iter::repeat_n((MIN_BACKGROUND_NORM, f64::INFINITY), self.n_background_norms));
        if self.common_norm {
            b.push((0.0, f64::INFINITY));
        }
        b
    }

    fn apply(&self, bins: &mut [CalcBin], params: &[f64]) -> Result<()> {
        let (external, rest) = params.split_at(self.external.len());
        for (p, &v) in self.external.iter().zip(external) {
            p.set_value(v)?;
        }
        let (norms, rest) = rest.split_at(self.n_background_norms);
        for (bin, &bn) in bins.iter_mut().zip(norms) {
            bin.internal_model_bin_mut().set_background_norm(bn);
        }
        if let Some(&cn) = rest.first().filter(|_| self.common_norm) {
            bins.iter_mut().for_each(|b| b.internal_model_bin_mut().set_common_norm(cn));
        }
        Ok(())
    }
}

struct InternalObjective<'a, 'v> {
    view: Mutex<BinsView<'v>>,
    layout: &'a Layout,
    hypothesis: Hypothesis,
    region: &'a Region,
    refresh: SourceRefresh,
}

impl ObjectiveFunction for InternalObjective<'_, '_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let mut guard = self.view.lock().map_err(|_| Error::Computation("internal fit state poisoned".into()))?;
        let view = &mut *guard;
        self.layout.apply(&mut *view.bins, params)?;
        match self.refresh {
            SourceRefresh::Never => {}
            SourceRefresh::OnModelChange => {
                view.sync_sources()?;
            }
            SourceRefresh::EveryStep => view.refresh_sources()?,
        }
        Ok(-view.log_likelihood(self.hypothesis, self.region)?)
    }
}

/// Maximize the likelihood of `hypothesis` over the nuisance parameters.
///
/// Returns `None` when nothing is free. Fitted values are left in the bins,
/// the free parameters and `internal`; non-convergence is reported in the
/// status and logged, never raised.
pub(crate) fn fit_internal(
    view: BinsView<'_>,
    internal: &mut InternalModel,
    hypothesis: Hypothesis,
    region: &Region,
    config: &InternalFitConfig,
) -> Result<Option<InternalFitStatus>> {
    let layout = Layout::new(&*view.bins, internal, hypothesis)?;
    if layout.len() == 0 {
        log::trace!("internal fit ({hypothesis:?}): no free parameters");
        return Ok(None);
    }
    let init = layout.initial(&*view.bins, internal)?;
    let bounds = layout.bounds();
    let refresh = SourceRefresh::for_fit(internal, hypothesis);
    let level = internal.fit_log_level();
    log::log!(
        level,
        "internal fit ({hypothesis:?}) over {} parameters, source refresh {refresh:?}: {:?}",
        layout.len(),
        layout.names
    );

    let objective = InternalObjective { view: Mutex::new(view), layout: &layout, hypothesis, region, refresh };
    let result = LbfgsbOptimizer::new(config.optimizer()).minimize(&objective, &init, &bounds)?;
    log::log!(level, "internal fit ({hypothesis:?}): {result}");
    if !result.converged {
        log::warn!("internal fit ({hypothesis:?}) did not converge: {}", result.message);
    }

    let mut uncertainties = vec![0.0; layout.len()];
    let mut covariance = None;
    if config.compute_errors {
        match hessian(&objective, &result.parameters) {
            Ok(h) => match invert_hessian(&h) {
                Some(cov) => {
                    for (i, u) in uncertainties.iter_mut().enumerate() {
                        *u = cov[(i, i)].max(0.0).sqrt();
                    }
                    covariance = Some(cov.transpose().iter().copied().collect::<Vec<f64>>());
                }
                None => log::warn!("internal fit ({hypothesis:?}): Hessian not invertible, no errors"),
            },
            Err(e) => log::warn!("internal fit ({hypothesis:?}): Hessian failed: {e}"),
        }
    }
    // leave the state at the best point, also after Hessian probing
    objective.eval(&result.parameters)?;

    for (p, &e) in layout.external.iter().zip(&uncertainties) {
        p.set_error(e)?;
    }
    let mut view = objective.view.into_inner().map_err(|_| Error::Computation("internal fit state poisoned".into()))?;
    let off = layout.external.len();
    for (k, bin) in view.bins[..layout.n_background_norms].iter_mut().enumerate() {
        bin.internal_model_bin_mut().set_background_norm_error(uncertainties[off + k]);
    }
    if layout.common_norm {
        let i = layout.len() - 1;
        internal.set_common_norm(result.parameters[i]);
        internal.set_common_norm_error(uncertainties[i]);
    }

    let mut fit = FitResult::new(
        layout.names.clone(),
        result.parameters.clone(),
        uncertainties,
        result.fval,
        result.converged,
        result.n_fev,
    );
    if let Some(cov) = covariance {
        fit = fit.with_covariance(cov);
    }
    Ok(Some(InternalFitStatus { fit, message: result.message }))
}

/// Background norms and surface parameters of every bin, plus the values of
/// the external free parameters.
#[derive(Debug, Clone)]
pub(crate) struct NuisanceSnapshot {
    bins: Vec<(f64, Option<Vec<f64>>)>,
    external: Vec<(FreeParameter, f64)>,
}

impl NuisanceSnapshot {
    pub fn capture(bins: &[CalcBin], internal: &InternalModel) -> Result<Self> {
        let external = internal
            .free_parameters()
            .iter()
            .map(|p| Ok((p.clone(), p.value()?)))
            .collect::<Result<_>>()?;
        let bins = bins
            .iter()
            .map(|b| {
                let imb = b.internal_model_bin();
                let params = imb.background_parameters().map(|p| p.values()).transpose()?;
                Ok((imb.background_norm(), params))
            })
            .collect::<Result<_>>()?;
        Ok(Self { bins, external })
    }

    pub fn restore(&self, bins: &mut [CalcBin]) -> Result<()> {
        for (bin, (bn, params)) in bins.iter_mut().zip(&self.bins) {
            let imb = bin.internal_model_bin_mut();
            imb.set_background_norm(*bn);
            if let (Some(shared), Some(values)) = (imb.background_parameters(), params) {
                for (i, &v) in values.iter().enumerate() {
                    shared.set_parameter(i, v)?;
                }
            }
        }
        for (p, v) in &self.external {
            p.set_value(*v)?;
        }
        Ok(())
    }
}
