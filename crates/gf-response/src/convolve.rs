//! Tangent-plane grids and FFT convolution with Gaussian kernels.

use gf_core::{Error, Result};
use gf_sky::{SkyBox, SkyPos};
use rustfft::{Fft, FftPlanner, num_complex::Complex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

/// Kernel widths of zero padding added around the grid before transforming
const PAD_SIGMAS: f64 = 5.0;

/// Grid settings for extended-source convolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionConfig {
    /// Fixed grid step in degrees; derived from the map resolution when `None`
    pub grid_step_deg: Option<f64>,
    /// Above this nside the step stops shrinking with resolution
    pub max_nside_for_step: u32,
    /// nside whose step is used above `max_nside_for_step`
    pub fine_step_nside: u32,
    /// Border added on each side of the source box, degrees
    pub margin_deg: f64,
}

impl Default for ConvolutionConfig {
    fn default() -> Self {
        Self { grid_step_deg: None, max_nside_for_step: 1000, fine_step_nside: 512, margin_deg: 2.0 }
    }
}

impl ConvolutionConfig {
    /// Grid step for maps of resolution `nside`: `90/nside` (the RA size of an
    /// equatorial pixel) unless fixed.
    pub fn grid_step(&self, nside: u32) -> f64 {
        if let Some(step) = self.grid_step_deg {
            return step;
        }
        let nside = if nside > self.max_nside_for_step { self.fine_step_nside } else { nside };
        90.0 / nside as f64
    }

    /// Check settings.
    pub fn validate(&self) -> Result<()> {
        if let Some(step) = self.grid_step_deg.filter(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(Error::Validation(format!("invalid convolution grid step {step}")));
        }
        if self.fine_step_nside == 0 || !(self.margin_deg.is_finite() && self.margin_deg >= 0.0) {
            return Err(Error::Validation("invalid convolution grid settings".into()));
        }
        Ok(())
    }
}

/// Regular grid in (RA·cos Dec, Dec) around a source box.
///
/// Rows are constant declination spaced by `step`; within a row cells are
/// spaced by `step / cos(dec)` so every cell spans about `step` degrees on
/// the sky. Values are stored row-major (`dec` outer, `ra` inner).
#[derive(Debug, Clone, PartialEq)]
pub struct TangentGrid {
    center_ra: f64,
    center_dec: f64,
    step: f64,
    n_ra: usize,
    n_dec: usize,
}

fn wrap_pm180(x: f64) -> f64 {
    let x = (x + 180.0).rem_euclid(360.0) - 180.0;
    if x == -180.0 { 180.0 } else { x }
}

impl TangentGrid {
    /// Grid covering `bbox` plus `margin` degrees per side; both dimensions even.
    pub fn covering(bbox: &SkyBox, step: f64, margin: f64) -> Self {
        let size_ra = bbox.ra_width();
        let size_dec = bbox.max_dec - bbox.min_dec;
        let center_ra = (bbox.min_ra + 0.5 * size_ra).rem_euclid(360.0);
        let center_dec = 0.5 * (bbox.min_dec + bbox.max_dec);
        let min_abs_dec = if bbox.min_dec <= 0.0 && bbox.max_dec >= 0.0 {
            0.0
        } else {
            bbox.min_dec.abs().min(bbox.max_dec.abs())
        };
        let n_ra = ((size_ra * min_abs_dec.to_radians().cos() + 2.0 * margin) / step / 2.0).ceil() as usize * 2;
        let n_dec = ((size_dec + 2.0 * margin) / step / 2.0).ceil() as usize * 2;
        Self { center_ra, center_dec, step, n_ra: n_ra.max(2), n_dec: n_dec.max(2) }
    }

    /// Cells along RA
    pub fn n_ra(&self) -> usize {
        self.n_ra
    }

    /// Cells along Dec
    pub fn n_dec(&self) -> usize {
        self.n_dec
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.n_ra * self.n_dec
    }

    /// Whether the grid has no cells
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grid step, degrees
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Flat index of cell `(i_ra, i_dec)`
    pub fn index(&self, i_ra: usize, i_dec: usize) -> usize {
        i_dec * self.n_ra + i_ra
    }

    fn row_dec(&self, i_dec: usize) -> f64 {
        self.center_dec + self.step * (i_dec as f64 - (self.n_dec as f64 / 2.0 - 0.5))
    }

    /// Centre of cell `(i_ra, i_dec)`
    pub fn cell_position(&self, i_ra: usize, i_dec: usize) -> SkyPos {
        let dec = self.row_dec(i_dec);
        let d_ra = self.step / dec.to_radians().cos();
        let ra = self.center_ra + d_ra * (i_ra as f64 - (self.n_ra as f64 / 2.0 - 0.5));
        SkyPos::new(ra, dec)
    }

    /// Bilinear interpolation of `values` at `pos`; zero outside the grid.
    pub fn sample(&self, values: &[f64], pos: &SkyPos) -> f64 {
        let d_ra = self.step / pos.dec().to_radians().cos();
        let half_width = d_ra * (self.n_ra as f64 / 2.0 - 0.5);
        let dra = wrap_pm180(pos.ra() - self.center_ra);
        if !d_ra.is_finite() || dra.abs() > half_width {
            return 0.0;
        }
        let fx = (dra + half_width) / d_ra;
        let fy = (pos.dec() - self.center_dec) / self.step + self.n_dec as f64 / 2.0 - 0.5;
        if fy < 0.0 {
            return 0.0;
        }
        let (i, j) = (fx as usize, fy as usize);
        if i + 1 >= self.n_ra || j + 1 >= self.n_dec {
            return 0.0;
        }
        let (tx, ty) = (fx - i as f64, fy - j as f64);
        values[self.index(i, j)] * (1.0 - tx) * (1.0 - ty)
            + values[self.index(i, j + 1)] * (1.0 - tx) * ty
            + values[self.index(i + 1, j)] * tx * (1.0 - ty)
            + values[self.index(i + 1, j + 1)] * tx * ty
    }
}

/// One Gaussian component of a convolution kernel: `(weight, sigma_deg)`.
pub type GaussianComponent = (f64, f64);

/// FFT convolution with cached plans.
///
/// Plans are keyed by transform length, so repeated convolutions on grids of
/// the same size reuse them.
pub struct ConvolutionWorkspace {
    plans: HashMap<usize, (Arc<dyn Fft<f64>>, Arc<dyn Fft<f64>>)>,
}

impl Default for ConvolutionWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConvolutionWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionWorkspace").field("cached_lengths", &self.plans.len()).finish()
    }
}

impl ConvolutionWorkspace {
    /// Empty workspace
    pub fn new() -> Self {
        Self { plans: HashMap::new() }
    }

    fn plans(&mut self, n: usize) -> (Arc<dyn Fft<f64>>, Arc<dyn Fft<f64>>) {
        self.plans
            .entry(n)
            .or_insert_with(|| {
                let mut planner = FftPlanner::new();
                (planner.plan_fft_forward(n), planner.plan_fft_inverse(n))
            })
            .clone()
    }

    /// Convolve grid `values` with a sum of Gaussians.
    ///
    /// The grid is zero-padded by five of the widest kernel widths on every
    /// side so nothing wraps around; the result has the grid's shape.
    pub fn convolve_gaussians(
        &mut self,
        grid: &TangentGrid,
        values: &[f64],
        kernel: &[GaussianComponent],
    ) -> Result<Vec<f64>> {
        if values.len() != grid.len() {
            return Err(Error::Computation(format!(
                "grid has {} cells but {} values",
                grid.len(),
                values.len()
            )));
        }
        if kernel.iter().any(|(w, s)| !w.is_finite() || !(s.is_finite() && *s >= 0.0)) {
            return Err(Error::Computation("invalid convolution kernel".into()));
        }
        let widest = kernel.iter().map(|(_, s)| *s).fold(0.0, f64::max);
        let pad = (PAD_SIGMAS * widest / grid.step()).ceil() as usize;
        let nx = grid.n_ra() + 2 * pad;
        let ny = grid.n_dec() + 2 * pad;

        let mut data = vec![Complex::new(0.0, 0.0); nx * ny];
        for j in 0..grid.n_dec() {
            for i in 0..grid.n_ra() {
                data[(j + pad) * nx + i + pad] = Complex::new(values[grid.index(i, j)], 0.0);
            }
        }

        let (fwd_x, inv_x) = self.plans(nx);
        let (fwd_y, inv_y) = self.plans(ny);
        fft_2d(&mut data, nx, ny, &fwd_x, &fwd_y);

        let step2 = grid.step() * grid.step();
        for ky in 0..ny {
            let fy = signed_frequency(ky, ny);
            for kx in 0..nx {
                let fx = signed_frequency(kx, nx);
                let f2 = fx * fx + fy * fy;
                let h: f64 = kernel
                    .iter()
                    .map(|(w, s)| w * (-2.0 * PI * PI * s * s * f2 / step2).exp())
                    .sum();
                data[ky * nx + kx] *= h;
            }
        }

        fft_2d(&mut data, nx, ny, &inv_x, &inv_y);
        let norm = 1.0 / (nx * ny) as f64;

        let mut out = vec![0.0; grid.len()];
        for j in 0..grid.n_dec() {
            for i in 0..grid.n_ra() {
                out[grid.index(i, j)] = data[(j + pad) * nx + i + pad].re * norm;
            }
        }
        Ok(out)
    }
}

fn signed_frequency(k: usize, n: usize) -> f64 {
    let k = if k > n / 2 { k as f64 - n as f64 } else { k as f64 };
    k / n as f64
}

/// In-place 2D transform by rows then columns.
fn fft_2d(data: &mut [Complex<f64>], nx: usize, ny: usize, fft_x: &Arc<dyn Fft<f64>>, fft_y: &Arc<dyn Fft<f64>>) {
    for row in data.chunks_exact_mut(nx) {
        fft_x.process(row);
    }
    let mut column = vec![Complex::new(0.0, 0.0); ny];
    for x in 0..nx {
        for y in 0..ny {
            column[y] = data[y * nx + x];
        }
        fft_y.process(&mut column);
        for y in 0..ny {
            data[y * nx + x] = column[y];
        }
    }
}
