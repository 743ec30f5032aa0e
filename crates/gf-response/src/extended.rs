//! Extended-source response.
//!
//! The source is rendered on a [`TangentGrid`] around its bounding box; each
//! cell holds the source flux falling into one map pixel at that position.
//! Per analysis bin the fluxes are folded with the detector response into
//! expected counts, convolved with the bin's PSF and resampled onto map
//! pixels by the caller.

use crate::convolve::{ConvolutionConfig, GaussianComponent, TangentGrid};
use crate::{DecInterpolation, DetectorResponse, ModelVersions, SourceModel};
use gf_core::{Error, Result};
use gf_sky::SkyBox;

/// Sources larger than this, or reaching beyond this |declination|, are
/// poorly described by a flat grid (degrees).
const PLANAR_LIMIT_DEG: f64 = 60.0;

/// What changed in an extended source since the last update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedUpdate {
    /// Nothing
    Unchanged,
    /// Only spectra; the shape and position are the same
    Spectrum,
    /// Shape or position
    Morphology,
}

#[derive(Debug, Clone)]
struct CellFlux {
    interp: DecInterpolation,
    fluxes: Vec<f64>,
}

/// Expected signal of one extended source on a tangent grid.
#[derive(Debug, Clone)]
pub struct ExtendedSourceResponse {
    id: usize,
    name: String,
    nside: u32,
    config: ConvolutionConfig,
    bbox: SkyBox,
    grid: TangentGrid,
    cells: Vec<Option<CellFlux>>,
    versions: ModelVersions,
}

impl ExtendedSourceResponse {
    /// Response of extended source `id` for maps of resolution `nside`.
    pub fn new(
        model: &dyn SourceModel,
        id: usize,
        dr: &DetectorResponse,
        nside: u32,
        config: &ConvolutionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let bbox = model.extended_source_boundaries(id)?;
        let grid = TangentGrid::covering(&bbox, config.grid_step(nside), config.margin_deg);
        let mut resp = Self {
            id,
            name: model.extended_source_name(id)?,
            nside,
            config: config.clone(),
            bbox,
            grid,
            cells: Vec::new(),
            versions: model.versions(),
        };
        resp.check_planar();
        resp.fill_cells(model, dr)?;
        Ok(resp)
    }

    fn check_planar(&self) {
        let size_dec = self.bbox.max_dec - self.bbox.min_dec;
        let max_abs_dec = self.bbox.min_dec.abs().max(self.bbox.max_dec.abs());
        if size_dec > PLANAR_LIMIT_DEG || self.bbox.ra_width() > PLANAR_LIMIT_DEG || max_abs_dec > PLANAR_LIMIT_DEG {
            log::warn!(
                "extended source '{}' spans RA width {:.1}, Dec [{:.1}, {:.1}]; flat-grid convolution is approximate",
                self.name,
                self.bbox.ra_width(),
                self.bbox.min_dec,
                self.bbox.max_dec
            );
        }
    }

    fn fill_cells(&mut self, model: &dyn SourceModel, dr: &DetectorResponse) -> Result<()> {
        let energies = dr.energies_mev();
        // sr⁻¹ -> per map pixel, MeV⁻¹ -> TeV⁻¹
        let scale = std::f64::consts::PI / (3.0 * (self.nside as f64).powi(2)) * 1e6;
        let mut cells = Vec::with_capacity(self.grid.len());
        let mut n_inside = 0usize;
        for j in 0..self.grid.n_dec() {
            for i in 0..self.grid.n_ra() {
                let pos = self.grid.cell_position(i, j);
                let (ra, dec) = (pos.ra(), pos.dec());
                if !(self.bbox.contains(&pos) && model.is_inside_any_extended_source(ra, dec)) {
                    cells.push(None);
                    continue;
                }
                let fluxes =
                    model.extended_source_fluxes(self.id, ra, dec, &energies)?.into_iter().map(|f| f * scale).collect();
                cells.push(Some(CellFlux { interp: dr.interpolation(dec)?, fluxes }));
                n_inside += 1;
            }
        }
        log::debug!(
            "extended source '{}': {}x{} grid, {} cells inside",
            self.name,
            self.grid.n_ra(),
            self.grid.n_dec(),
            n_inside
        );
        self.cells = cells;
        Ok(())
    }

    /// Re-read the source.
    ///
    /// A morphology change rebuilds the grid; a spectrum change only refreshes
    /// cell fluxes.
    pub fn update(&mut self, model: &dyn SourceModel, dr: &DetectorResponse) -> Result<ExtendedUpdate> {
        let versions = model.versions();
        let change = if versions.morphology != self.versions.morphology {
            ExtendedUpdate::Morphology
        } else if versions.spectrum != self.versions.spectrum {
            ExtendedUpdate::Spectrum
        } else {
            return Ok(ExtendedUpdate::Unchanged);
        };
        if change == ExtendedUpdate::Morphology {
            self.bbox = model.extended_source_boundaries(self.id)?;
            self.grid = TangentGrid::covering(&self.bbox, self.config.grid_step(self.nside), self.config.margin_deg);
            self.check_planar();
        }
        self.fill_cells(model, dr)?;
        self.versions = versions;
        Ok(change)
    }

    /// Index of the source in the model
    pub fn id(&self) -> usize {
        self.id
    }

    /// Source name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bounding box
    pub fn boundaries(&self) -> &SkyBox {
        &self.bbox
    }

    /// Grid the source is rendered on
    pub fn grid(&self) -> &TangentGrid {
        &self.grid
    }

    /// Model versions seen at the last update
    pub fn versions(&self) -> ModelVersions {
        self.versions
    }

    /// Map resolution the cell fluxes are scaled to
    pub fn nside(&self) -> u32 {
        self.nside
    }

    /// Expected signal per transit of grid cell `cell` in bin position `bin`.
    pub fn cell_signal(&self, dr: &DetectorResponse, bin: usize, cell: usize) -> Result<f64> {
        match self.cells.get(cell) {
            Some(Some(c)) => {
                let s1 = dr.response_bin_at(c.interp.band1, bin)?.reweighted_signal(&c.fluxes)?;
                let s2 = dr.response_bin_at(c.interp.band2, bin)?.reweighted_signal(&c.fluxes)?;
                Ok(c.interp.combine(s1, s2))
            }
            Some(None) => Ok(0.0),
            None => Err(Error::Validation(format!("grid cell {cell} out of range"))),
        }
    }

    /// Expected signal per transit of every grid cell in bin position `bin`.
    pub fn signal_grid(&self, dr: &DetectorResponse, bin: usize) -> Result<Vec<f64>> {
        (0..self.cells.len()).map(|k| self.cell_signal(dr, bin, k)).collect()
    }

    /// Gaussian kernel approximating the PSF of bin `bin` at the grid centre.
    ///
    /// A double Gaussian maps to two components weighted by their integrals;
    /// any other profile becomes a single Gaussian of equal second moment.
    pub fn kernel(&self, dr: &DetectorResponse, bin: usize) -> Result<Vec<GaussianComponent>> {
        let band = dr.dec_band_index(0.5 * (self.bbox.min_dec + self.bbox.max_dec))?;
        let psf = dr.psf(band, bin)?;
        match psf.as_double_gaussian() {
            Some((p1, s1, s2)) => {
                let a = p1 * s1 * s1 / (p1 * s1 * s1 + (1.0 - p1) * s2 * s2);
                Ok(vec![(a, s1), (1.0 - a, s2)])
            }
            None => {
                let sigma = psf.equivalent_sigma();
                log::warn!(
                    "PSF of bin {bin} is not a double Gaussian; convolving '{}' with a {sigma:.3} deg Gaussian",
                    self.name
                );
                Ok(vec![(1.0, sigma)])
            }
        }
    }
}
