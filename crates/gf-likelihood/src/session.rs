//! Likelihood session: all analysis bins of one data set against one source model.
//!
//! A [`LikeSession`] owns a [`CalcBin`] per analysis bin plus the source
//! responses shared by all of them. Bins are evaluated in parallel and
//! their log-likelihoods summed in bin order.
//!
//! The source model is owned by the caller and may be edited between
//! calls. Every evaluation compares the model's version counters with the
//! ones the responses were read at and re-reads them when they differ.
//! Models that do not bump their versions need an explicit
//! [`LikeSession::update_sources`] (or a `*_update_sources` variant).

use crate::calc_bin::{CalcBin, SourceContext, WeightSums};
use crate::config::SessionConfig;
use crate::internal_model::InternalModel;
use crate::minimize::{BinsView, Hypothesis, InternalFitStatus, NuisanceSnapshot, Region, check_radii, fit_internal};
use gf_core::{Error, Result, Tunable};
use gf_response::{
    DetectorResponse, ExtendedSourceResponse, ExtendedUpdate, ModelVersions, PointSourceResponse, SourceModel,
};
use gf_sky::{BinList, Roi, SkyMap, SkyMapCollection, SkyPos};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Sum of weights below which the Gaussian estimate substitutes a floor
const WEIGHT_SUM_FLOOR: f64 = 0.01;

/// Log-likelihood with the status of the internal fit that preceded it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikelihoodResult {
    /// Summed log-likelihood
    pub log_likelihood: f64,
    /// Internal fit status; `None` if no fit was run or nothing was free
    pub fit: Option<InternalFitStatus>,
}

impl LikelihoodResult {
    /// False only if an internal fit ran and did not converge
    pub fn converged(&self) -> bool {
        self.fit.as_ref().is_none_or(InternalFitStatus::converged)
    }
}

/// Test statistic `2·(LL(model) − LL(background))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsResult {
    /// Test statistic
    pub ts: f64,
    /// Log-likelihood of the source model
    pub log_likelihood: f64,
    /// Log-likelihood of the background alone
    pub background_log_likelihood: f64,
    /// Common norm after the model evaluation
    pub common_norm: f64,
    /// Background-only internal fit
    pub background_fit: Option<InternalFitStatus>,
    /// Model internal fit
    pub model_fit: Option<InternalFitStatus>,
}

impl TsResult {
    /// `√TS`, zero for negative TS
    pub fn significance(&self) -> f64 {
        self.ts.max(0.0).sqrt()
    }

    /// Whether both internal fits, if run, converged
    pub fn converged(&self) -> bool {
        self.background_fit.as_ref().is_none_or(InternalFitStatus::converged)
            && self.model_fit.as_ref().is_none_or(InternalFitStatus::converged)
    }
}

/// Gaussian-weight estimate of the common norm and the source significance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormEstimate {
    /// Estimated common norm
    pub norm: f64,
    /// Estimated significance
    pub sigma: f64,
}

impl From<WeightSums> for NormEstimate {
    fn from(s: WeightSums) -> Self {
        let expected = if s.expected == 0.0 { WEIGHT_SUM_FLOOR } else { s.expected };
        let background = if s.background == 0.0 { WEIGHT_SUM_FLOOR } else { s.background };
        Self { norm: s.signal / expected, sigma: s.signal / background.sqrt() }
    }
}

/// Likelihood evaluation of a set of analysis bins against a source model.
pub struct LikeSession {
    response: DetectorResponse,
    model: Arc<dyn SourceModel>,
    internal: InternalModel,
    config: SessionConfig,
    nside: u32,
    roi: Roi,
    points: Vec<PointSourceResponse>,
    extended: Vec<ExtendedSourceResponse>,
    seen_versions: ModelVersions,
    calc_bins: Vec<CalcBin>,
}

impl fmt::Debug for LikeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LikeSession")
            .field("bins", &self.calc_bins.iter().map(CalcBin::bin).collect::<Vec<_>>())
            .field("nside", &self.nside)
            .field("roi", &self.roi)
            .field("point_sources", &self.points.len())
            .field("extended_sources", &self.extended.len())
            .finish()
    }
}

impl LikeSession {
    /// Session over `bins` of `maps`.
    ///
    /// Every bin must exist in the maps and the detector response, and all
    /// maps must share one resolution.
    pub fn new(
        response: DetectorResponse,
        maps: &SkyMapCollection,
        bins: &BinList,
        model: Arc<dyn SourceModel>,
        internal: InternalModel,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        if bins.is_empty() {
            return Err(Error::Validation("no analysis bins selected".into()));
        }
        maps.check_bins(bins)?;
        let mut nside = None;
        for bin in bins.iter() {
            response.bin_index(bin)?;
            let n = maps.bin(bin)?.on.nside();
            match nside {
                None => nside = Some(n),
                Some(first) if first != n => {
                    return Err(Error::Validation(format!(
                        "bin '{bin}' has nside {n}, other bins have nside {first}"
                    )));
                }
                Some(_) => {}
            }
        }
        let nside = nside.ok_or_else(|| Error::Validation("no analysis bins selected".into()))?;

        let mut session = Self {
            response,
            model,
            internal,
            config,
            nside,
            roi: Roi::whole_sky(),
            points: Vec::new(),
            extended: Vec::new(),
            seen_versions: ModelVersions::default(),
            calc_bins: Vec::new(),
        };
        session.build_sources()?;
        session.roi = session.wanted_roi();
        log::info!("likelihood session: {} bins at nside {nside}, ROI {:?}", bins.len(), session.roi);
        session.calc_bins = bins
            .iter()
            .map(|bin| {
                CalcBin::new(bin, maps.bin(bin)?, maps.transits(), &session.response, &session.internal, &session.roi)
            })
            .collect::<Result<_>>()?;
        Ok(session)
    }

    fn build_sources(&mut self) -> Result<()> {
        let model = self.model.as_ref();
        let versions = model.versions();
        self.points = (0..model.n_point_sources())
            .map(|id| PointSourceResponse::new(model, id, &self.response))
            .collect::<Result<_>>()?;
        self.extended = (0..model.n_extended_sources())
            .map(|id| ExtendedSourceResponse::new(model, id, &self.response, self.nside, &self.config.convolution))
            .collect::<Result<_>>()?;
        self.seen_versions = versions;
        log::debug!("built {} point and {} extended source responses", self.points.len(), self.extended.len());
        Ok(())
    }

    fn wanted_roi(&self) -> Roi {
        if let Some(roi) = &self.config.fixed_roi {
            return roi.clone();
        }
        let positions: Vec<SkyPos> = self.points.iter().map(|p| *p.position()).collect();
        let boxes: Vec<_> = self.extended.iter().map(|e| *e.boundaries()).collect();
        Roi::match_sources(&positions, &boxes, self.config.roi_padding_deg)
    }

    /// Re-derive the ROI from the current sources unless it is fixed.
    pub fn match_roi(&mut self) -> Result<()> {
        let roi = self.wanted_roi();
        if roi == self.roi {
            return Ok(());
        }
        log::debug!("ROI changed to {roi:?}");
        for bin in &mut self.calc_bins {
            bin.set_roi(&roi)?;
        }
        self.roi = roi;
        Ok(())
    }

    /// Rebuild all source responses from the model, reset the common norm to 1
    /// and drop every cache.
    pub fn reset_sources(&mut self) -> Result<()> {
        self.build_sources()?;
        self.set_common_norm(1.0);
        for bin in &mut self.calc_bins {
            bin.reset_sources();
        }
        self.match_roi()
    }

    /// Bring the source responses up to date with the model.
    ///
    /// A change in the number of sources rebuilds everything. Otherwise the
    /// responses are re-read; the ROI follows moved sources unless fixed.
    pub fn update_sources(&mut self) -> Result<()> {
        let model = self.model.as_ref();
        if model.n_point_sources() != self.points.len() || model.n_extended_sources() != self.extended.len() {
            log::debug!("number of sources changed, rebuilding source responses");
            return self.reset_sources();
        }
        let versions = model.versions();
        let mut moved = false;
        for ps in &mut self.points {
            moved |= ps.update(model, &self.response)?;
        }
        for ext in &mut self.extended {
            moved |= ext.update(model, &self.response)? == ExtendedUpdate::Morphology;
        }
        for bin in &mut self.calc_bins {
            bin.clear_caches();
        }
        self.seen_versions = versions;
        if moved || !self.extended.is_empty() {
            self.match_roi()?;
        }
        Ok(())
    }

    /// [`Self::update_sources`] if the model changed since the responses were read.
    fn sync_sources(&mut self) -> Result<()> {
        let model = self.model.as_ref();
        let stale = model.versions() != self.seen_versions
            || model.n_point_sources() != self.points.len()
            || model.n_extended_sources() != self.extended.len();
        if stale {
            log::debug!("source model changed since the last evaluation, updating responses");
            self.update_sources()?;
        }
        Ok(())
    }

    fn view(&mut self) -> (BinsView<'_>, &mut InternalModel, &SessionConfig) {
        let view = BinsView {
            bins: &mut self.calc_bins,
            response: &self.response,
            model: self.model.as_ref(),
            points: &mut self.points,
            extended: &mut self.extended,
            seen: &mut self.seen_versions,
        };
        (view, &mut self.internal, &self.config)
    }

    fn evaluate(&mut self, hypothesis: Hypothesis, region: &Region, internal_fit: bool) -> Result<LikelihoodResult> {
        self.sync_sources()?;
        let fit = if internal_fit {
            let (view, internal, config) = self.view();
            fit_internal(view, internal, hypothesis, region, &config.internal_fit)?
        } else {
            None
        };
        let log_likelihood = self.view().0.log_likelihood(hypothesis, region)?;
        Ok(LikelihoodResult { log_likelihood, fit })
    }

    fn test_statistic(&mut self, region: &Region, internal_fit: bool) -> Result<TsResult> {
        let background = self.evaluate(Hypothesis::Background, region, internal_fit)?;
        let snapshot = NuisanceSnapshot::capture(&self.calc_bins, &self.internal)?;
        let mut model = self.evaluate(Hypothesis::Model, region, internal_fit)?;
        // only a fit that varied the common norm could have reached zero signal
        let fitted_cn = model.fit.is_some() && self.internal.is_common_norm_free();
        if fitted_cn && model.log_likelihood < background.log_likelihood {
            log::warn!(
                "model fit ended below the background fit (LL {} < {}), using zero signal",
                model.log_likelihood,
                background.log_likelihood
            );
            snapshot.restore(&mut self.calc_bins)?;
            self.set_common_norm(0.0);
            let restored_external = !self.internal.free_parameters().is_empty();
            let mut view = self.view().0;
            if restored_external {
                view.refresh_sources()?;
            }
            model.log_likelihood = view.log_likelihood(Hypothesis::Model, region)?;
        }
        let ts = 2.0 * (model.log_likelihood - background.log_likelihood);
        log::debug!("TS = {ts} (LL model {}, background {})", model.log_likelihood, background.log_likelihood);
        Ok(TsResult {
            ts,
            log_likelihood: model.log_likelihood,
            background_log_likelihood: background.log_likelihood,
            common_norm: self.internal.common_norm(),
            background_fit: background.fit,
            model_fit: model.fit,
        })
    }

    /// Log-likelihood of the model over the ROI, optionally after the internal fit.
    pub fn calc_log_likelihood(&mut self, internal_fit: bool) -> Result<LikelihoodResult> {
        self.evaluate(Hypothesis::Model, &Region::Roi, internal_fit)
    }

    /// [`Self::update_sources`], then [`Self::calc_log_likelihood`].
    pub fn calc_log_likelihood_update_sources(&mut self, internal_fit: bool) -> Result<LikelihoodResult> {
        self.update_sources()?;
        self.calc_log_likelihood(internal_fit)
    }

    /// Log-likelihood of the background alone over the ROI.
    pub fn calc_background_log_likelihood(&mut self, internal_fit: bool) -> Result<LikelihoodResult> {
        self.evaluate(Hypothesis::Background, &Region::Roi, internal_fit)
    }

    /// Test statistic over the ROI.
    ///
    /// The background fit runs first so the nuisance parameters end at the
    /// model's best fit. When the internal fit varies the common norm, the
    /// model can always reproduce the background by zeroing the signal; if
    /// that fit ends below the background fit, the zero-signal point is used
    /// and TS is 0. A fixed common norm is never changed and TS may then be
    /// negative.
    pub fn calc_test_statistic(&mut self, internal_fit: bool) -> Result<TsResult> {
        self.test_statistic(&Region::Roi, internal_fit)
    }

    /// [`Self::update_sources`], then [`Self::calc_test_statistic`].
    pub fn calc_test_statistic_update_sources(&mut self, internal_fit: bool) -> Result<TsResult> {
        self.update_sources()?;
        self.calc_test_statistic(internal_fit)
    }

    /// Model log-likelihood of discs around `center`, one radius per bin.
    pub fn calc_top_hat_log_likelihood(
        &mut self,
        center: &SkyPos,
        radii: &[f64],
        internal_fit: bool,
    ) -> Result<LikelihoodResult> {
        let region = Region::TopHat { center: *center, radii: radii.to_vec() };
        self.evaluate(Hypothesis::Model, &region, internal_fit)
    }

    /// Background log-likelihood of discs around `center`, one radius per bin.
    pub fn calc_top_hat_background_log_likelihood(
        &mut self,
        center: &SkyPos,
        radii: &[f64],
        internal_fit: bool,
    ) -> Result<LikelihoodResult> {
        let region = Region::TopHat { center: *center, radii: radii.to_vec() };
        self.evaluate(Hypothesis::Background, &region, internal_fit)
    }

    /// Test statistic of discs around `center`, one radius per bin.
    pub fn calc_top_hat_test_statistic(
        &mut self,
        center: &SkyPos,
        radii: &[f64],
        internal_fit: bool,
    ) -> Result<TsResult> {
        let region = Region::TopHat { center: *center, radii: radii.to_vec() };
        self.test_statistic(&region, internal_fit)
    }

    /// Gaussian-weight estimate of the common norm over the ROI.
    ///
    /// The common norm is set to 1 first so the weights see the bare model.
    pub fn estimate_norm_and_sigma(&mut self) -> Result<NormEstimate> {
        self.sync_sources()?;
        self.set_common_norm(1.0);
        let ctx = SourceContext { response: &self.response, points: &self.points, extended: &self.extended };
        let per_bin: Vec<WeightSums> =
            self.calc_bins.par_iter_mut().map(|bin| bin.calc_weights(&ctx)).collect::<Result<_>>()?;
        let mut sums = WeightSums::default();
        per_bin.into_iter().for_each(|s| sums += s);
        Ok(sums.into())
    }

    /// [`Self::estimate_norm_and_sigma`] for discs around `center`.
    pub fn estimate_top_hat_norm_and_sigma(&mut self, center: &SkyPos, radii: &[f64]) -> Result<NormEstimate> {
        check_radii(self.calc_bins.len(), radii)?;
        self.sync_sources()?;
        self.set_common_norm(1.0);
        let ctx = SourceContext { response: &self.response, points: &self.points, extended: &self.extended };
        let mut sums = WeightSums::default();
        for (bin, &radius) in self.calc_bins.iter_mut().zip(radii) {
            sums += bin.calc_top_hat_weights(&ctx, center, radius)?;
        }
        Ok(sums.into())
    }

    /// Write the model map of every bin.
    pub fn make_model_maps(&mut self) -> Result<()> {
        log::info!("making model maps");
        self.sync_sources()?;
        let ctx = SourceContext { response: &self.response, points: &self.points, extended: &self.extended };
        self.calc_bins.par_iter_mut().try_for_each(|bin| bin.make_model_map(&ctx, false))
    }

    /// Model map of `bin`, as last written by [`Self::make_model_maps`].
    pub fn model_map(&self, bin: &str) -> Result<&SkyMap<f64>> {
        Ok(self.calc_bin(bin)?.model_map())
    }

    /// Expected excess over the ROI of every bin.
    pub fn expected_excess_maps(&mut self) -> Result<Vec<SkyMap<f64>>> {
        self.sync_sources()?;
        let ctx = SourceContext { response: &self.response, points: &self.points, extended: &self.extended };
        self.calc_bins.par_iter_mut().map(|bin| bin.expected_excess_map(&ctx)).collect()
    }

    fn per_bin_top_hat(
        &mut self,
        radius: f64,
        mut f: impl FnMut(&mut CalcBin, &SourceContext<'_>, f64) -> Result<f64>,
    ) -> Result<Vec<f64>> {
        if !(radius.is_finite() && radius >= 0.0) {
            return Err(Error::Validation(format!("invalid top-hat radius {radius}")));
        }
        self.sync_sources()?;
        let ctx = SourceContext { response: &self.response, points: &self.points, extended: &self.extended };
        self.calc_bins.iter_mut().map(|bin| f(bin, &ctx, radius)).collect()
    }

    /// Expected excess inside a disc, per bin.
    pub fn top_hat_expected_excesses(&mut self, center: &SkyPos, radius: f64) -> Result<Vec<f64>> {
        self.per_bin_top_hat(radius, |bin, ctx, r| bin.top_hat_expected_excess(ctx, center, r))
    }

    /// Observed minus background counts inside a disc, per bin.
    pub fn top_hat_excesses(&mut self, center: &SkyPos, radius: f64) -> Result<Vec<f64>> {
        self.per_bin_top_hat(radius, |bin, _, r| bin.top_hat_excess(center, r))
    }

    /// Background counts inside a disc, per bin.
    pub fn top_hat_backgrounds(&mut self, center: &SkyPos, radius: f64) -> Result<Vec<f64>> {
        self.per_bin_top_hat(radius, |bin, _, r| bin.top_hat_background(center, r))
    }

    /// Area of the map pixels inside a disc, per bin, deg².
    pub fn top_hat_areas(&mut self, center: &SkyPos, radius: f64) -> Result<Vec<f64>> {
        self.per_bin_top_hat(radius, |bin, _, r| bin.top_hat_area(center, r))
    }

    /// Common normalization
    pub fn common_norm(&self) -> f64 {
        self.internal.common_norm()
    }

    /// Set the common normalization in the model and every bin.
    pub fn set_common_norm(&mut self, value: f64) {
        self.internal.set_common_norm(value);
        for bin in &mut self.calc_bins {
            bin.internal_model_bin_mut().set_common_norm(value);
        }
    }

    /// Register an external free parameter of the internal fit.
    pub fn add_free_parameter(
        &mut self,
        function: Arc<dyn Tunable>,
        index: usize,
        detector_response_free: bool,
    ) -> Result<()> {
        self.internal.add_free_parameter(function, index, detector_response_free)
    }

    /// Drop all external free parameters.
    pub fn clear_free_parameters(&mut self) {
        self.internal.clear_free_parameters();
    }

    /// Global nuisance state
    pub fn internal_model(&self) -> &InternalModel {
        &self.internal
    }

    /// Set the log level of internal-fit progress messages.
    pub fn set_fit_log_level(&mut self, level: log::Level) {
        self.internal.set_fit_log_level(level);
    }

    /// Detector response
    pub fn response(&self) -> &DetectorResponse {
        &self.response
    }

    /// Current region of interest
    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    /// Shared map resolution
    pub fn nside(&self) -> u32 {
        self.nside
    }

    /// Per-bin kernels, in bin order
    pub fn calc_bins(&self) -> &[CalcBin] {
        &self.calc_bins
    }

    /// Kernel of `bin`
    pub fn calc_bin(&self, bin: &str) -> Result<&CalcBin> {
        self.calc_bins
            .iter()
            .find(|b| b.bin() == bin)
            .ok_or_else(|| Error::Validation(format!("analysis bin '{bin}' not in session")))
    }

    /// Background evaluations clamped to zero, summed over bins
    pub fn negative_background_count(&self) -> usize {
        self.calc_bins.iter().map(|b| b.internal_model_bin().negative_background_count()).sum()
    }
}
