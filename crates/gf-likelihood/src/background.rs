//! Parametric background surfaces.
//!
//! A surface gives the background density in counts per deg² as a function
//! of sky position. Surfaces that are linear in their parameters expose a
//! basis and are fit by least squares; others are fit by the optimizer.

use crate::optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizerConfig};
use gf_core::{Error, Result};
use gf_sky::SkyPos;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Background density model over the sky.
pub trait BackgroundSurface: Send + Sync + fmt::Debug {
    /// Surface name (prefix of its parameter names)
    fn name(&self) -> &str;

    /// Parameter names
    fn parameter_names(&self) -> Vec<String>;

    /// Number of parameters
    fn n_parameters(&self) -> usize {
        self.parameter_names().len()
    }

    /// Density at `pos`, counts per deg²
    fn evaluate(&self, params: &[f64], pos: &SkyPos) -> f64;

    /// Basis functions at `pos` if the surface is linear in its parameters
    fn basis(&self, _pos: &SkyPos) -> Option<Vec<f64>> {
        None
    }
}

/// Flat background.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantSurface;

impl BackgroundSurface for ConstantSurface {
    fn name(&self) -> &str {
        "constant"
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["level".into()]
    }

    fn evaluate(&self, params: &[f64], _pos: &SkyPos) -> f64 {
        params.first().copied().unwrap_or(0.0)
    }

    fn basis(&self, _pos: &SkyPos) -> Option<Vec<f64>> {
        Some(vec![1.0])
    }
}

/// Polynomial of degree ≤ 2 in (ΔRA, ΔDec) around a reference point.
///
/// Terms in order: `1, ΔRA, ΔDec, ΔRA², ΔRA·ΔDec, ΔDec²`, truncated to the
/// degree. ΔRA is wrapped to `[-180, 180)`.
#[derive(Debug, Clone, Copy)]
pub struct PolynomialSurface {
    degree: usize,
    ref_ra: f64,
    ref_dec: f64,
}

impl PolynomialSurface {
    /// Polynomial of `degree` (0, 1 or 2) centred on `(ref_ra, ref_dec)`.
    pub fn new(degree: usize, ref_ra: f64, ref_dec: f64) -> Result<Self> {
        if degree > 2 {
            return Err(Error::Validation(format!("polynomial background degree {degree} > 2")));
        }
        Ok(Self { degree, ref_ra, ref_dec })
    }

    fn terms(&self, pos: &SkyPos) -> Vec<f64> {
        let dra = (pos.ra() - self.ref_ra + 180.0).rem_euclid(360.0) - 180.0;
        let ddec = pos.dec() - self.ref_dec;
        let mut t = vec![1.0];
        if self.degree >= 1 {
            t.extend([dra, ddec]);
        }
        if self.degree >= 2 {
            t.extend([dra * dra, dra * ddec, ddec * ddec]);
        }
        t
    }
}

impl BackgroundSurface for PolynomialSurface {
    fn name(&self) -> &str {
        "polynomial"
    }

    fn parameter_names(&self) -> Vec<String> {
        ["c", "c_ra", "c_dec", "c_ra2", "c_ra_dec", "c_dec2"]
            .iter()
            .take(match self.degree {
                0 => 1,
                1 => 3,
                _ => 6,
            })
            .map(|s| (*s).to_string())
            .collect()
    }

    fn evaluate(&self, params: &[f64], pos: &SkyPos) -> f64 {
        self.terms(pos).iter().zip(params).map(|(t, p)| t * p).sum()
    }

    fn basis(&self, pos: &SkyPos) -> Option<Vec<f64>> {
        Some(self.terms(pos))
    }
}

/// Serialized surface choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackgroundSurfaceSpec {
    /// [`ConstantSurface`]
    Constant,
    /// [`PolynomialSurface`]
    Polynomial {
        /// Degree, at most 2
        degree: usize,
        /// Reference right ascension, degrees
        ref_ra: f64,
        /// Reference declination, degrees
        ref_dec: f64,
    },
}

/// Serialized background model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundModelSpec {
    /// Surface
    pub surface: BackgroundSurfaceSpec,
    /// Starting parameter values; zeros when absent
    #[serde(default)]
    pub initial: Option<Vec<f64>>,
    /// Parameters left free in the internal fit after the initial map fit
    #[serde(default)]
    pub free: Vec<usize>,
}

/// Surface prototype shared by all bins, with the parameters the internal
/// fit may vary.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    surface: Arc<dyn BackgroundSurface>,
    initial: Vec<f64>,
    free: Vec<usize>,
}

impl BackgroundModel {
    /// Model from a surface, initial values and free parameter indices.
    pub fn new(surface: Arc<dyn BackgroundSurface>, initial: Vec<f64>, free: Vec<usize>) -> Result<Self> {
        let n = surface.n_parameters();
        if initial.len() != n {
            return Err(Error::Validation(format!(
                "background surface '{}' has {n} parameters, {} initial values given",
                surface.name(),
                initial.len()
            )));
        }
        if let Some(bad) = free.iter().find(|&&i| i >= n) {
            return Err(Error::Validation(format!(
                "free background parameter {bad} out of range for '{}'",
                surface.name()
            )));
        }
        Ok(Self { surface, initial, free })
    }

    /// Model from its serialized form.
    pub fn from_spec(spec: &BackgroundModelSpec) -> Result<Self> {
        let surface: Arc<dyn BackgroundSurface> = match spec.surface {
            BackgroundSurfaceSpec::Constant => Arc::new(ConstantSurface),
            BackgroundSurfaceSpec::Polynomial { degree, ref_ra, ref_dec } => {
                Arc::new(PolynomialSurface::new(degree, ref_ra, ref_dec)?)
            }
        };
        let initial = spec.initial.clone().unwrap_or_else(|| vec![0.0; surface.n_parameters()]);
        Self::new(surface, initial, spec.free.clone())
    }

    /// Surface
    pub fn surface(&self) -> &Arc<dyn BackgroundSurface> {
        &self.surface
    }

    /// Starting parameter values
    pub fn initial(&self) -> &[f64] {
        &self.initial
    }

    /// Indices of parameters free in the internal fit
    pub fn free(&self) -> &[usize] {
        &self.free
    }
}

struct SquaredResiduals<'a> {
    surface: &'a dyn BackgroundSurface,
    samples: &'a [(SkyPos, f64)],
}

impl ObjectiveFunction for SquaredResiduals<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        Ok(self.samples.iter().map(|(pos, y)| (self.surface.evaluate(params, pos) - y).powi(2)).sum())
    }
}

/// Fit all parameters of `surface` to `(position, density)` samples.
pub fn fit_surface(surface: &dyn BackgroundSurface, samples: &[(SkyPos, f64)], initial: &[f64]) -> Result<Vec<f64>> {
    let n = surface.n_parameters();
    if samples.len() < n {
        return Err(Error::Validation(format!(
            "{} samples cannot constrain {n} background parameters",
            samples.len()
        )));
    }
    let rows: Option<Vec<Vec<f64>>> = samples.iter().map(|(pos, _)| surface.basis(pos)).collect();
    match rows {
        Some(rows) => {
            let a = DMatrix::from_fn(samples.len(), n, |i, j| rows[i][j]);
            let y = DVector::from_iterator(samples.len(), samples.iter().map(|(_, y)| *y));
            let solution = a
                .svd(true, true)
                .solve(&y, 1e-12)
                .map_err(|e| Error::Computation(format!("background least squares failed: {e}")))?;
            Ok(solution.iter().copied().collect())
        }
        None => {
            let objective = SquaredResiduals { surface, samples };
            let bounds = vec![(f64::NEG_INFINITY, f64::INFINITY); n];
            let result = LbfgsbOptimizer::new(OptimizerConfig::default()).minimize(&objective, initial, &bounds)?;
            if !result.converged {
                log::warn!("background surface fit did not converge: {}", result.message);
            }
            Ok(result.parameters)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid_samples(f: impl Fn(f64, f64) -> f64) -> Vec<(SkyPos, f64)> {
        let mut out = Vec::new();
        for i in 0..11 {
            for j in 0..11 {
                let (ra, dec) = (95.0 + i as f64, 15.0 + j as f64);
                out.push((SkyPos::new(ra, dec), f(ra, dec)));
            }
        }
        out
    }

    #[test]
    fn test_polynomial_least_squares_recovers_plane() {
        let surface = PolynomialSurface::new(1, 100.0, 20.0).unwrap();
        let samples = grid_samples(|ra, dec| 50.0 + 2.0 * (ra - 100.0) - 0.5 * (dec - 20.0));
        let p = fit_surface(&surface, &samples, &[0.0; 3]).unwrap();
        assert_relative_eq!(p[0], 50.0, epsilon = 1e-6);
        assert_relative_eq!(p[1], 2.0, epsilon = 1e-6);
        assert_relative_eq!(p[2], -0.5, epsilon = 1e-6);
        assert_eq!(surface.parameter_names().len(), 3);
    }

    #[derive(Debug)]
    struct ExpDec;

    impl BackgroundSurface for ExpDec {
        fn name(&self) -> &str {
            "exp_dec"
        }

        fn parameter_names(&self) -> Vec<String> {
            vec!["a".into(), "k".into()]
        }

        fn evaluate(&self, p: &[f64], pos: &SkyPos) -> f64 {
            p[0] * (p[1] * (pos.dec() - 20.0)).exp()
        }
    }

    #[test]
    fn test_nonlinear_surface_fit_by_optimizer() {
        let samples = grid_samples(|_, dec| 10.0 * (0.05 * (dec - 20.0)).exp());
        let p = fit_surface(&ExpDec, &samples, &[5.0, 0.0]).unwrap();
        assert_relative_eq!(p[0], 10.0, max_relative = 1e-3);
        assert_relative_eq!(p[1], 0.05, max_relative = 1e-2);
    }

    #[test]
    fn test_model_spec_validation() {
        let json = r#"{"surface": {"type": "polynomial", "degree": 2, "ref_ra": 0, "ref_dec": 0}, "free": [0, 5]}"#;
        let spec: BackgroundModelSpec = serde_json::from_str(json).unwrap();
        let model = BackgroundModel::from_spec(&spec).unwrap();
        assert_eq!(model.initial().len(), 6);
        let bad = BackgroundModelSpec { free: vec![6], ..spec };
        assert!(BackgroundModel::from_spec(&bad).is_err());
        assert!(PolynomialSurface::new(3, 0.0, 0.0).is_err());
    }
}
