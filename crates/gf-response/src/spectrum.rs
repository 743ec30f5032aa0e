//! Log-log power-law spectra.

use serde::{Deserialize, Serialize};
use std::f64::consts::LOG10_E;

/// Power law with optional exponential cutoff, evaluated in log10 space.
///
/// `dN/dE = norm · E^-index · exp(-E/cutoff)` with `E` in TeV and `norm` in
/// TeV⁻¹ cm⁻² s⁻¹ at 1 TeV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogLogSpectrum {
    /// Differential flux at 1 TeV
    pub norm: f64,
    /// Spectral index (positive for falling spectra)
    pub index: f64,
    /// Cutoff energy in TeV
    #[serde(default)]
    pub cutoff: Option<f64>,
}

impl Default for LogLogSpectrum {
    fn default() -> Self {
        Self { norm: 3.5e-11, index: 2.63, cutoff: None }
    }
}

impl LogLogSpectrum {
    /// Pure power law.
    pub fn power_law(norm: f64, index: f64) -> Self {
        Self { norm, index, cutoff: None }
    }

    /// Power law with exponential cutoff at `cutoff` TeV.
    pub fn with_cutoff(norm: f64, index: f64, cutoff: f64) -> Self {
        Self { norm, index, cutoff: Some(cutoff) }
    }

    /// `log10(dN/dE)` at `log10(E/TeV)`.
    pub fn log_flux(&self, log_e: f64) -> f64 {
        let mut y = self.norm.log10() - self.index * log_e;
        if let Some(cutoff) = self.cutoff {
            y -= LOG10_E * 10f64.powf(log_e - cutoff.log10());
        }
        y
    }

    /// `dN/dE` at `log10(E/TeV)`.
    pub fn flux_at_log_energy(&self, log_e: f64) -> f64 {
        10f64.powf(self.log_flux(log_e))
    }

    /// `dN/dE` at `energy_tev`.
    pub fn flux(&self, energy_tev: f64) -> f64 {
        self.flux_at_log_energy(energy_tev.log10())
    }
}
