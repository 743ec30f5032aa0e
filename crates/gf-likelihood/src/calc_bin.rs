//! Likelihood kernel of one analysis bin.
//!
//! A [`CalcBin`] owns the bin's on-map, model map, region of interest and
//! [`InternalModelBin`], plus every cache needed to evaluate the Poisson
//! log-likelihood quickly many times in a row:
//!
//! - expected excess per pixel, stored without the common norm;
//! - PSF smearing profiles per point source, keyed by declination band and
//!   PSF tuning version;
//! - convolved extended-source maps on the ROI, keyed by source versions,
//!   PSF tuning version and ROI generation;
//! - top-hat sums keyed by quantized centre and radius.
//!
//! Sources are not owned: they are passed in through a [`SourceContext`] on
//! every call. Per-pixel and top-hat caches must be cleared with
//! [`CalcBin::clear_caches`] whenever point sources change.

use crate::internal_model::InternalModel;
use crate::internal_model_bin::InternalModelBin;
use gf_core::{Error, Result, Tunable};
use gf_response::{
    ConvolutionWorkspace, DetectorResponse, ExtendedSourceResponse, ModelVersions, PointSourceResponse,
    SmearingProfile,
};
use gf_sky::{BinMaps, BinName, GalacticFrame, Healpix, PixelSet, Roi, SkyMap, SkyPos};
use statrs::function::gamma::ln_gamma;
use std::collections::HashMap;
use std::ops::AddAssign;

/// Reference counts at or below this force a reconvolution instead of a rescale
const MIN_REFERENCE_COUNT: f64 = 1e-30;

/// Quantum of top-hat cache keys, degrees
const TOP_HAT_KEY_QUANTUM: f64 = 1e-9;

/// Sources and detector response seen by a bin during one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    /// Detector response
    pub response: &'a DetectorResponse,
    /// Point-source responses
    pub points: &'a [PointSourceResponse],
    /// Extended-source responses
    pub extended: &'a [ExtendedSourceResponse],
}

/// Weighted sums for the Gaussian estimate of the common norm.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightSums {
    /// Σ w·s
    pub expected: f64,
    /// Σ w·(n − b)
    pub signal: f64,
    /// Σ w²·b
    pub background: f64,
}

impl AddAssign for WeightSums {
    fn add_assign(&mut self, rhs: Self) {
        self.expected += rhs.expected;
        self.signal += rhs.signal;
        self.background += rhs.background;
    }
}

impl WeightSums {
    fn accumulate(&mut self, on: f64, background: f64, expected: f64) {
        let w = expected / background;
        self.expected += w * expected;
        self.signal += w * (on - background);
        self.background += w * w * background;
    }
}

/// `n·ln μ − μ − ln Γ(n+1)`; a non-positive expectation where counts were seen is an error.
pub fn poisson_log_likelihood(n: f64, mu: f64) -> Result<f64> {
    if !mu.is_finite() || mu < 0.0 || (mu == 0.0 && n > 0.0) {
        return Err(Error::Numerical(format!("expected counts {mu} for {n} observed")));
    }
    if mu == 0.0 {
        return Ok(-ln_gamma(n + 1.0));
    }
    Ok(n * mu.ln() - mu - ln_gamma(n + 1.0))
}

#[derive(Debug)]
struct ProfileEntry {
    band: usize,
    psf_version: u64,
    profile: SmearingProfile,
}

#[derive(Debug)]
struct ExtendedEntry {
    id: usize,
    versions: ModelVersions,
    psf_version: u64,
    roi_generation: u64,
    reference: Option<(usize, f64)>,
    values: HashMap<usize, f64>,
}

#[derive(Debug, Clone, Copy)]
struct TopHatSums {
    on: f64,
    background: f64,
    n_pixels: usize,
    background_version: u64,
}

type TopHatKey = (i64, i64, i64);

fn top_hat_key(center: &SkyPos, radius: f64) -> TopHatKey {
    let q = |x: f64| (x / TOP_HAT_KEY_QUANTUM).round() as i64;
    (q(center.ra()), q(center.dec()), q(radius))
}

/// Expected counts and log-likelihood of one analysis bin over its ROI.
#[derive(Debug)]
pub struct CalcBin {
    bin: BinName,
    bin_index: usize,
    healpix: Healpix,
    pixel_area: f64,
    transits: f64,
    on: SkyMap<f64>,
    model_map: SkyMap<f64>,
    roi: Roi,
    roi_pixels: PixelSet,
    roi_centers: Vec<SkyPos>,
    roi_generation: u64,
    frame: GalacticFrame,
    imb: InternalModelBin,
    excess: HashMap<usize, f64>,
    profiles: Vec<Option<ProfileEntry>>,
    extended: Vec<Option<ExtendedEntry>>,
    psf_version: u64,
    workspace: ConvolutionWorkspace,
    top_hat_sums: HashMap<TopHatKey, TopHatSums>,
    top_hat_expected: HashMap<TopHatKey, f64>,
}

impl CalcBin {
    /// Kernel for analysis bin `bin` with data `maps` observed over `transits` transits.
    pub fn new(
        bin: &str,
        maps: &BinMaps,
        transits: f64,
        response: &DetectorResponse,
        internal: &InternalModel,
        roi: &Roi,
    ) -> Result<Self> {
        let bin_index = response.bin_index(bin)?;
        let healpix = maps.on.healpix();
        let roi_pixels = roi.calc_roi(&maps.on)?;
        let imb = InternalModelBin::new(bin, internal, maps.background.clone(), &roi_pixels)?;
        let roi_centers = roi_pixels.iter().map(|p| healpix.pix2pos(p)).collect();
        log::debug!("bin {bin}: nside {}, {} ROI pixels", healpix.nside(), roi_pixels.len());
        Ok(Self {
            bin: bin.to_string(),
            bin_index,
            healpix,
            pixel_area: healpix.pixel_area_deg2(),
            transits,
            on: maps.on.clone(),
            model_map: SkyMap::new(healpix, maps.on.pixels().clone(), 0.0),
            roi: roi.clone(),
            roi_pixels,
            roi_centers,
            roi_generation: 0,
            frame: GalacticFrame::j2000(),
            imb,
            excess: HashMap::new(),
            profiles: Vec::new(),
            extended: Vec::new(),
            psf_version: response.psf_tuning().version(),
            workspace: ConvolutionWorkspace::new(),
            top_hat_sums: HashMap::new(),
            top_hat_expected: HashMap::new(),
        })
    }

    /// Bin name
    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Position of the bin in the detector response's bin list
    pub fn bin_index(&self) -> usize {
        self.bin_index
    }

    /// Pixel area, deg²
    pub fn pixel_area(&self) -> f64 {
        self.pixel_area
    }

    /// Number of sidereal transits
    pub fn transits(&self) -> f64 {
        self.transits
    }

    /// Current region of interest
    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    /// Pixels of the current region of interest
    pub fn roi_pixels(&self) -> &PixelSet {
        &self.roi_pixels
    }

    /// Observed counts
    pub fn on_map(&self) -> &SkyMap<f64> {
        &self.on
    }

    /// Model map written by [`CalcBin::make_model_map`]
    pub fn model_map(&self) -> &SkyMap<f64> {
        &self.model_map
    }

    /// Nuisance state of this bin
    pub fn internal_model_bin(&self) -> &InternalModelBin {
        &self.imb
    }

    /// Mutable nuisance state of this bin
    pub fn internal_model_bin_mut(&mut self) -> &mut InternalModelBin {
        &mut self.imb
    }

    /// Replace the region of interest.
    pub fn set_roi(&mut self, roi: &Roi) -> Result<()> {
        let pixels = roi.calc_roi(&self.on)?;
        log::debug!("bin {}: ROI now {} pixels", self.bin, pixels.len());
        self.roi_centers = pixels.iter().map(|p| self.healpix.pix2pos(p)).collect();
        self.roi_pixels = pixels;
        self.roi = roi.clone();
        self.roi_generation += 1;
        self.clear_caches();
        Ok(())
    }

    /// Forget per-pixel, top-hat and background caches.
    ///
    /// Convolved extended-source maps survive; they are rebuilt or rescaled
    /// from source versions on the next evaluation.
    pub fn clear_caches(&mut self) {
        self.excess.clear();
        self.top_hat_sums.clear();
        self.top_hat_expected.clear();
        self.imb.clear_cache();
    }

    /// Forget everything derived from the sources, including convolved maps.
    pub fn reset_sources(&mut self) {
        self.profiles.clear();
        self.extended.clear();
        self.clear_caches();
    }

    fn sync(&mut self, ctx: &SourceContext<'_>) -> Result<()> {
        let psf_version = ctx.response.psf_tuning().version();
        let mut changed = psf_version != self.psf_version;
        self.psf_version = psf_version;
        if self.profiles.len() != ctx.points.len() {
            self.profiles.resize_with(ctx.points.len(), || None);
            changed = true;
        }
        if self.extended.len() != ctx.extended.len() {
            self.extended.resize_with(ctx.extended.len(), || None);
            changed = true;
        }
        for (k, ext) in ctx.extended.iter().enumerate() {
            changed |= self.refresh_extended(ctx.response, k, ext)?;
        }
        if changed {
            self.excess.clear();
            self.top_hat_expected.clear();
        }
        Ok(())
    }

    /// Bring the convolved map of extended source `k` up to date; returns whether it changed.
    fn refresh_extended(
        &mut self,
        response: &DetectorResponse,
        k: usize,
        ext: &ExtendedSourceResponse,
    ) -> Result<bool> {
        let versions = ext.versions();
        let reusable = self.extended[k].as_ref().filter(|e| {
            e.id == ext.id()
                && e.psf_version == self.psf_version
                && e.roi_generation == self.roi_generation
                && e.versions.morphology == versions.morphology
        });
        if let Some(entry) = reusable {
            if entry.versions.spectrum == versions.spectrum {
                return Ok(false);
            }
            if let Some((cell, prev)) = entry.reference {
                let count = ext.cell_signal(response, self.bin_index, cell)?;
                if count > MIN_REFERENCE_COUNT {
                    let scale = count / prev;
                    log::debug!("bin {}: rescaling '{}' by {scale}", self.bin, ext.name());
                    if let Some(entry) = self.extended[k].as_mut() {
                        entry.values.values_mut().for_each(|v| *v *= scale);
                        entry.reference = Some((cell, count));
                        entry.versions = versions;
                    }
                    return Ok(true);
                }
            }
        }

        let values = ext.signal_grid(response, self.bin_index)?;
        let reference = values.iter().position(|&v| v > MIN_REFERENCE_COUNT).map(|i| (i, values[i]));
        let kernel = ext.kernel(response, self.bin_index)?;
        let convolved = self.workspace.convolve_gaussians(ext.grid(), &values, &kernel)?;
        let mut map = HashMap::new();
        for (pix, pos) in self.roi_pixels.iter().zip(&self.roi_centers) {
            let v = ext.grid().sample(&convolved, pos);
            // FFT round-off leaves tiny negative values
            if v > 0.0 {
                map.insert(pix, v);
            }
        }
        log::debug!(
            "bin {}: convolved '{}' on a {}x{} grid, {} ROI pixels with signal",
            self.bin,
            ext.name(),
            ext.grid().n_ra(),
            ext.grid().n_dec(),
            map.len()
        );
        self.extended[k] = Some(ExtendedEntry {
            id: ext.id(),
            versions,
            psf_version: self.psf_version,
            roi_generation: self.roi_generation,
            reference,
            values: map,
        });
        Ok(true)
    }

    fn profile(&mut self, response: &DetectorResponse, k: usize, ps: &PointSourceResponse) -> Result<&SmearingProfile> {
        let band = ps.interpolation().band1;
        let psf_version = self.psf_version;
        let slot = self
            .profiles
            .get_mut(k)
            .ok_or_else(|| Error::Computation(format!("no profile slot for point source {k}")))?;
        let fresh = matches!(slot, Some(e) if e.band == band && e.psf_version == psf_version);
        if !fresh {
            let profile = ps.smearing_profile(response, self.bin_index, self.pixel_area)?;
            *slot = Some(ProfileEntry { band, psf_version, profile });
        }
        match slot {
            Some(e) => Ok(&e.profile),
            None => Err(Error::Computation(format!("no profile for point source {k}"))),
        }
    }

    /// Expected excess of pixel `pix` per unit common norm; callers must `sync` first.
    fn unscaled_excess(&mut self, ctx: &SourceContext<'_>, pix: usize) -> Result<f64> {
        if let Some(&v) = self.excess.get(&pix) {
            return Ok(v);
        }
        let pos = self.healpix.pix2pos(pix);
        let mut counts = 0.0;
        for (k, ps) in ctx.points.iter().enumerate() {
            let bin_index = self.bin_index;
            let profile = self.profile(ctx.response, k, ps)?;
            counts += ps.smeared_signal(pos.angle(ps.position()), bin_index, profile);
        }
        for entry in self.extended.iter().flatten() {
            counts += entry.values.get(&pix).copied().unwrap_or(0.0);
        }
        let mut value = counts * self.transits;
        if let Some(w) = self.roi.latitude_weight(&self.frame, &pos) {
            value *= w;
        }
        log::trace!("bin {}: pixel {pix} expected excess {value} / CN", self.bin);
        self.excess.insert(pix, value);
        Ok(value)
    }

    /// Expected excess counts in pixel `pix`, common norm applied.
    pub fn expected_excess(&mut self, ctx: &SourceContext<'_>, pix: usize) -> Result<f64> {
        self.sync(ctx)?;
        Ok(self.imb.common_norm() * self.unscaled_excess(ctx, pix)?)
    }

    /// Source leakage into the background estimate of pixel `pix`.
    ///
    /// Background maps are estimated with the sources masked, so no
    /// correction is applied; the hook is kept so every likelihood path
    /// subtracts the same quantity.
    pub fn expected_background_correction(&self, _pix: usize) -> f64 {
        0.0
    }

    fn corrected_background(&mut self, pix: usize) -> Result<f64> {
        let bg = self.imb.background(pix)?;
        Ok((bg - self.expected_background_correction(pix)).max(0.0))
    }

    /// Expected excess over the ROI as a map.
    pub fn expected_excess_map(&mut self, ctx: &SourceContext<'_>) -> Result<SkyMap<f64>> {
        self.sync(ctx)?;
        let cn = self.imb.common_norm();
        let mut map = SkyMap::new(self.healpix, self.roi_pixels.clone(), 0.0);
        for i in 0..self.roi_pixels.len() {
            let pix = self.roi_pixels.as_slice()[i];
            map.set(pix, cn * self.unscaled_excess(ctx, pix)?)?;
        }
        Ok(map)
    }

    /// Write `signal·CN + background·BN` into the model map over the ROI;
    /// `add` accumulates instead of overwriting. Pixels without background are set to 0.
    pub fn make_model_map(&mut self, ctx: &SourceContext<'_>, add: bool) -> Result<()> {
        self.sync(ctx)?;
        let cn = self.imb.common_norm();
        for i in 0..self.roi_pixels.len() {
            let pix = self.roi_pixels.as_slice()[i];
            if self.imb.background_map().value(pix)? < 1e-30 {
                self.model_map.set(pix, 0.0)?;
                continue;
            }
            let value = cn * self.unscaled_excess(ctx, pix)? + self.imb.background(pix)?;
            if add {
                self.model_map.add(pix, value)?;
            } else {
                self.model_map.set(pix, value)?;
            }
        }
        Ok(())
    }

    /// Poisson log-likelihood of the on-counts given background plus source model.
    pub fn calc_log_likelihood(&mut self, ctx: &SourceContext<'_>) -> Result<f64> {
        self.sync(ctx)?;
        let cn = self.imb.common_norm();
        let mut ll = 0.0;
        for i in 0..self.roi_pixels.len() {
            let pix = self.roi_pixels.as_slice()[i];
            let background = self.corrected_background(pix)?;
            if background == 0.0 {
                continue;
            }
            let n = self.on.value(pix)?.max(0.0);
            let mu = background + cn * self.unscaled_excess(ctx, pix)?;
            ll += poisson_log_likelihood(n, mu)
                .map_err(|e| Error::Numerical(format!("bin {}, pixel {pix}: {e}", self.bin)))?;
        }
        log::trace!("bin {}: LL(model) = {ll}", self.bin);
        Ok(ll)
    }

    /// Poisson log-likelihood of the on-counts given the background alone.
    pub fn calc_background_log_likelihood(&mut self) -> Result<f64> {
        let mut ll = 0.0;
        for i in 0..self.roi_pixels.len() {
            let pix = self.roi_pixels.as_slice()[i];
            let background = self.corrected_background(pix)?;
            if background == 0.0 {
                continue;
            }
            let n = self.on.value(pix)?.max(0.0);
            ll += poisson_log_likelihood(n, background)
                .map_err(|e| Error::Numerical(format!("bin {}, pixel {pix}: {e}", self.bin)))?;
        }
        log::trace!("bin {}: LL(background) = {ll}", self.bin);
        Ok(ll)
    }

    /// Weighted sums over the ROI with `w = s/b`.
    pub fn calc_weights(&mut self, ctx: &SourceContext<'_>) -> Result<WeightSums> {
        self.sync(ctx)?;
        let cn = self.imb.common_norm();
        let mut sums = WeightSums::default();
        for i in 0..self.roi_pixels.len() {
            let pix = self.roi_pixels.as_slice()[i];
            if self.imb.background(pix)? <= 0.0 {
                continue;
            }
            let background = self.corrected_background(pix)?;
            let expected = cn * self.unscaled_excess(ctx, pix)?;
            sums.accumulate(self.on.value(pix)?, background, expected);
        }
        Ok(sums)
    }

    fn top_hat_pixels(&self, center: &SkyPos, radius: f64) -> PixelSet {
        self.healpix.query_disc(center, radius).filter(|p| self.on.pixels().contains(p))
    }

    fn top_hat_sums(&mut self, center: &SkyPos, radius: f64) -> Result<TopHatSums> {
        let key = top_hat_key(center, radius);
        let version = self.imb.background_version();
        if let Some(s) = self.top_hat_sums.get(&key).filter(|s| s.background_version == version) {
            return Ok(*s);
        }
        let pixels = self.top_hat_pixels(center, radius);
        let mut sums = TopHatSums { on: 0.0, background: 0.0, n_pixels: pixels.len(), background_version: version };
        for pix in pixels.iter() {
            sums.on += self.on.value(pix)?;
            sums.background += self.imb.unscaled_background(pix)?;
        }
        self.top_hat_sums.insert(key, sums);
        Ok(sums)
    }

    fn unscaled_top_hat_expected(&mut self, ctx: &SourceContext<'_>, center: &SkyPos, radius: f64) -> Result<f64> {
        let key = top_hat_key(center, radius);
        if let Some(&v) = self.top_hat_expected.get(&key) {
            return Ok(v);
        }
        let pixels = self.top_hat_pixels(center, radius);
        let mut total = None;
        if let ([ps], []) = (ctx.points, ctx.extended) {
            if self.profile(ctx.response, 0, ps)?.is_delta() {
                let inside = pixels.contains(self.healpix.ang2pix(ps.position()));
                total = Some(if inside { ps.expected_signal(self.bin_index) * self.transits } else { 0.0 });
            }
        }
        let total = match total {
            Some(t) => t,
            None => {
                let mut sum = 0.0;
                for pix in pixels.iter() {
                    sum += self.unscaled_excess(ctx, pix)?;
                }
                sum
            }
        };
        self.top_hat_expected.insert(key, total);
        Ok(total)
    }

    /// Expected excess inside a disc, common norm applied.
    pub fn top_hat_expected_excess(&mut self, ctx: &SourceContext<'_>, center: &SkyPos, radius: f64) -> Result<f64> {
        self.sync(ctx)?;
        Ok(self.imb.common_norm() * self.unscaled_top_hat_expected(ctx, center, radius)?)
    }

    /// Observed minus background counts inside a disc.
    pub fn top_hat_excess(&mut self, center: &SkyPos, radius: f64) -> Result<f64> {
        let s = self.top_hat_sums(center, radius)?;
        Ok(s.on - self.imb.background_norm() * s.background)
    }

    /// Background counts inside a disc.
    pub fn top_hat_background(&mut self, center: &SkyPos, radius: f64) -> Result<f64> {
        let s = self.top_hat_sums(center, radius)?;
        Ok(self.imb.background_norm() * s.background)
    }

    /// Area of the map pixels inside a disc, deg².
    pub fn top_hat_area(&mut self, center: &SkyPos, radius: f64) -> Result<f64> {
        Ok(self.top_hat_sums(center, radius)?.n_pixels as f64 * self.pixel_area)
    }

    fn top_hat_counts(&mut self, center: &SkyPos, radius: f64) -> Result<(f64, f64)> {
        let s = self.top_hat_sums(center, radius)?;
        let background = self.imb.background_norm() * s.background;
        if s.on < 0.0 {
            log::warn!("bin {}: negative top-hat on-count {} set to 0", self.bin, s.on);
        }
        Ok((s.on.max(0.0), background))
    }

    /// Single-bin Poisson log-likelihood of a disc, background plus model.
    pub fn calc_top_hat_log_likelihood(
        &mut self,
        ctx: &SourceContext<'_>,
        center: &SkyPos,
        radius: f64,
    ) -> Result<f64> {
        let (on, background) = self.top_hat_counts(center, radius)?;
        if background == 0.0 {
            return Ok(0.0);
        }
        let expected = self.top_hat_expected_excess(ctx, center, radius)?;
        poisson_log_likelihood(on, background + expected)
            .map_err(|e| Error::Numerical(format!("bin {}, top hat: {e}", self.bin)))
    }

    /// Single-bin Poisson log-likelihood of a disc, background only.
    pub fn calc_top_hat_background_log_likelihood(&mut self, center: &SkyPos, radius: f64) -> Result<f64> {
        let (on, background) = self.top_hat_counts(center, radius)?;
        if background == 0.0 {
            return Ok(0.0);
        }
        poisson_log_likelihood(on, background).map_err(|e| Error::Numerical(format!("bin {}, top hat: {e}", self.bin)))
    }

    /// [`CalcBin::calc_weights`] with the disc as a single pixel.
    pub fn calc_top_hat_weights(
        &mut self,
        ctx: &SourceContext<'_>,
        center: &SkyPos,
        radius: f64,
    ) -> Result<WeightSums> {
        let s = self.top_hat_sums(center, radius)?;
        let background = self.imb.background_norm() * s.background;
        let mut sums = WeightSums::default();
        if background > 0.0 {
            let expected = self.top_hat_expected_excess(ctx, center, radius)?;
            sums.accumulate(s.on, background, expected);
        }
        Ok(sums)
    }
}
