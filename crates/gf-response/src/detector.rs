//! Detector response tables.
//!
//! The table is a grid of [`ResponseBin`]s indexed by declination band and
//! analysis bin. Each entry holds the signal expected from a reference
//! (simulated) spectrum, histogrammed in log-energy, so the signal of any
//! other spectrum follows by reweighting bin by bin.

use crate::{LogLogSpectrum, Psf};
use gf_core::{Error, Result, SharedParameters, Tunable};
use gf_sky::{BinList, BinName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Index of the PSF width scale inside [`DetectorResponse::psf_tuning`]
pub const PSF_WIDTH_SCALE: usize = 0;

/// Declination band of the response table, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecBand {
    /// Lower edge (inclusive)
    pub lower: f64,
    /// Upper edge (exclusive)
    pub upper: f64,
    /// Declination at which the band was simulated
    pub sim_dec: f64,
}

/// Serialized response of one (band, analysis bin) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBinSpec {
    /// Expected signal per transit of the simulated spectrum, per log-energy bin
    pub signal: Vec<f64>,
    /// Expected background per transit
    pub background: f64,
    /// Point-spread function
    pub psf: Psf,
}

/// Serialized declination band with its per-bin responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecBandSpec {
    /// Lower edge, degrees
    pub lower: f64,
    /// Upper edge, degrees
    pub upper: f64,
    /// Simulated declination, degrees
    pub sim_dec: f64,
    /// Responses by analysis-bin name
    pub bins: BTreeMap<BinName, ResponseBinSpec>,
}

/// Serialized detector response table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorResponseSpec {
    /// Spectrum the signal histograms were simulated with
    #[serde(default)]
    pub simulated_spectrum: LogLogSpectrum,
    /// Log-energy bin centres, `log10(E/TeV)`
    pub log_energy_bins: Vec<f64>,
    /// Bands in ascending declination
    pub dec_bands: Vec<DecBandSpec>,
}

/// Response of one (declination band, analysis bin) cell.
#[derive(Debug, Clone)]
pub struct ResponseBin {
    sim_signal: Vec<f64>,
    sim_flux: Vec<f64>,
    expected_signal: f64,
    expected_background: f64,
    psf: Psf,
}

impl ResponseBin {
    fn from_spec(spec: &ResponseBinSpec, sim_flux: &[f64], label: &str) -> Result<Self> {
        if spec.signal.len() != sim_flux.len() {
            return Err(Error::Validation(format!(
                "{label}: {} signal bins but {} log-energy bins",
                spec.signal.len(),
                sim_flux.len()
            )));
        }
        if spec.signal.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(Error::Validation(format!("{label}: negative or non-finite signal")));
        }
        if !spec.background.is_finite() || spec.background < 0.0 {
            return Err(Error::Validation(format!(
                "{label}: invalid expected background {}",
                spec.background
            )));
        }
        spec.psf.validate().map_err(|e| Error::Validation(format!("{label}: {e}")))?;
        Ok(Self {
            sim_signal: spec.signal.clone(),
            sim_flux: sim_flux.to_vec(),
            expected_signal: spec.signal.iter().sum(),
            expected_background: spec.background,
            psf: spec.psf.clone(),
        })
    }

    /// Signal of a spectrum given by its flux at each log-energy bin centre.
    ///
    /// `Σ_b sim_signal[b] · flux[b] / sim_flux[b]`
    pub fn reweighted_signal(&self, fluxes: &[f64]) -> Result<f64> {
        if fluxes.len() != self.sim_flux.len() {
            return Err(Error::Validation(format!(
                "got {} fluxes for {} log-energy bins",
                fluxes.len(),
                self.sim_flux.len()
            )));
        }
        Ok(self
            .sim_signal
            .iter()
            .zip(fluxes)
            .zip(&self.sim_flux)
            .map(|((s, f), sf)| s * f / sf)
            .sum())
    }

    /// Expected signal of the simulated spectrum, per transit
    pub fn expected_signal(&self) -> f64 {
        self.expected_signal
    }

    /// Expected background, per transit
    pub fn expected_background(&self) -> f64 {
        self.expected_background
    }

    /// Simulated signal per log-energy bin
    pub fn sim_signal(&self) -> &[f64] {
        &self.sim_signal
    }

    /// Unscaled point-spread function
    pub fn psf(&self) -> &Psf {
        &self.psf
    }
}

/// Linear interpolation between the two bands bracketing a declination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecInterpolation {
    /// Band containing the declination
    pub band1: usize,
    /// Neighbouring band on the side of the declination, or `band1`
    pub band2: usize,
    /// Weight of `band1`
    pub w1: f64,
    /// Weight of `band2`
    pub w2: f64,
}

impl DecInterpolation {
    /// `w1·a + w2·b`
    pub fn combine(&self, a: f64, b: f64) -> f64 {
        self.w1 * a + self.w2 * b
    }
}

/// Detector response: PSF and expected signal/background per
/// (declination band × analysis bin).
#[derive(Debug, Clone)]
pub struct DetectorResponse {
    bands: Vec<DecBand>,
    bins: BinList,
    log_energies: Vec<f64>,
    sim_spectrum: LogLogSpectrum,
    table: Vec<Vec<ResponseBin>>,
    psf_tuning: SharedParameters,
}

impl DetectorResponse {
    /// Build and validate from a serialized table.
    pub fn from_spec(spec: &DetectorResponseSpec) -> Result<Self> {
        if spec.log_energy_bins.is_empty() {
            return Err(Error::Validation("response table has no log-energy bins".into()));
        }
        if spec.dec_bands.is_empty() {
            return Err(Error::Validation("response table has no declination bands".into()));
        }
        let sim_flux: Vec<f64> = spec
            .log_energy_bins
            .iter()
            .map(|&x| spec.simulated_spectrum.flux_at_log_energy(x))
            .collect();
        if sim_flux.iter().any(|f| !f.is_finite() || *f <= 0.0) {
            return Err(Error::Validation("simulated spectrum is not positive on every energy bin".into()));
        }

        let bins = BinList::from_names(spec.dec_bands[0].bins.keys().cloned())?;
        if bins.is_empty() {
            return Err(Error::Validation("response table has no analysis bins".into()));
        }

        let mut bands = Vec::with_capacity(spec.dec_bands.len());
        let mut table = Vec::with_capacity(spec.dec_bands.len());
        for (i, band) in spec.dec_bands.iter().enumerate() {
            let width = band.upper - band.lower;
            if !(width.is_finite() && width > 0.0) || band.sim_dec < band.lower || band.sim_dec > band.upper {
                return Err(Error::Validation(format!(
                    "declination band {i}: invalid edges [{}, {}) with simulated dec {}",
                    band.lower, band.upper, band.sim_dec
                )));
            }
            if let Some(prev) = bands.last().map(|b: &DecBand| b.upper).filter(|&prev| band.lower < prev) {
                return Err(Error::Validation(format!(
                    "declination bands not sorted: band {i} starts at {} below {prev}",
                    band.lower
                )));
            }
            if band.bins.len() != bins.len() || bins.iter().any(|b| !band.bins.contains_key(b)) {
                return Err(Error::Validation(format!(
                    "declination band {i} does not define the same analysis bins as band 0"
                )));
            }
            let row = bins
                .iter()
                .map(|b| ResponseBin::from_spec(&band.bins[b], &sim_flux, &format!("band {i}, bin {b}")))
                .collect::<Result<Vec<_>>>()?;
            bands.push(DecBand { lower: band.lower, upper: band.upper, sim_dec: band.sim_dec });
            table.push(row);
        }
        log::debug!(
            "loaded detector response: {} declination bands, {} analysis bins, {} energy bins",
            bands.len(),
            bins.len(),
            spec.log_energy_bins.len()
        );

        Ok(Self {
            bands,
            bins,
            log_energies: spec.log_energy_bins.clone(),
            sim_spectrum: spec.simulated_spectrum,
            table,
            psf_tuning: SharedParameters::new("detector_response", &[("psf_width_scale", 1.0)]),
        })
    }

    /// Parse a JSON table.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let spec: DetectorResponseSpec = serde_json::from_str(json)?;
        Self::from_spec(&spec)
    }

    /// Load a JSON table from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Declination bands, ascending
    pub fn bands(&self) -> &[DecBand] {
        &self.bands
    }

    /// Analysis bins of the table
    pub fn bins(&self) -> &BinList {
        &self.bins
    }

    /// Log-energy bin centres, `log10(E/TeV)`
    pub fn log_energies(&self) -> &[f64] {
        &self.log_energies
    }

    /// Log-energy bin centres converted to MeV
    pub fn energies_mev(&self) -> Vec<f64> {
        self.log_energies.iter().map(|x| 10f64.powf(x + 6.0)).collect()
    }

    /// Spectrum the table was simulated with
    pub fn simulated_spectrum(&self) -> &LogLogSpectrum {
        &self.sim_spectrum
    }

    /// Position of `bin` in [`Self::bins`]
    pub fn bin_index(&self, bin: &str) -> Result<usize> {
        self.bins
            .iter()
            .position(|b| b == bin)
            .ok_or_else(|| Error::Validation(format!("analysis bin '{bin}' not in detector response")))
    }

    /// Response of (`band`, `bin`).
    pub fn response_bin(&self, band: usize, bin: &str) -> Result<&ResponseBin> {
        let b = self.bin_index(bin)?;
        self.response_bin_at(band, b)
    }

    /// Response of (`band`, bin position `bin`).
    pub fn response_bin_at(&self, band: usize, bin: usize) -> Result<&ResponseBin> {
        self.table
            .get(band)
            .and_then(|row| row.get(bin))
            .ok_or_else(|| Error::Validation(format!("no response for band {band}, bin index {bin}")))
    }

    /// Band whose `[lower, upper)` range contains `dec`.
    pub fn dec_band_index(&self, dec: f64) -> Result<usize> {
        self.bands.iter().position(|b| dec >= b.lower && dec < b.upper).ok_or_else(|| {
            Error::Validation(format!("declination {dec} outside the detector response bands"))
        })
    }

    /// Interpolation weights for a source at `dec`.
    ///
    /// The neighbour is the band below when `dec` is south of the band's
    /// simulated declination, the band above when north of it; at the band
    /// edge of the table there is no neighbour and the weight is 1.
    pub fn interpolation(&self, dec: f64) -> Result<DecInterpolation> {
        let band1 = self.dec_band_index(dec)?;
        let sim1 = self.bands[band1].sim_dec;
        let band2 = if dec < sim1 && band1 > 0 {
            band1 - 1
        } else if dec > sim1 && band1 + 1 < self.bands.len() {
            band1 + 1
        } else {
            band1
        };
        if band1 == band2 {
            return Ok(DecInterpolation { band1, band2, w1: 1.0, w2: 0.0 });
        }
        let sim2 = self.bands[band2].sim_dec;
        Ok(DecInterpolation {
            band1,
            band2,
            w1: (dec - sim2) / (sim1 - sim2),
            w2: (dec - sim1) / (sim2 - sim1),
        })
    }

    /// Tunable detector-response parameters (`psf_width_scale`).
    pub fn psf_tuning(&self) -> &SharedParameters {
        &self.psf_tuning
    }

    /// Current PSF width scale
    pub fn psf_width_scale(&self) -> Result<f64> {
        self.psf_tuning.parameter(PSF_WIDTH_SCALE)
    }

    /// PSF of (`band`, bin position `bin`) with the width scale applied.
    pub fn psf(&self, band: usize, bin: usize) -> Result<Psf> {
        let scale = self.psf_width_scale()?;
        if scale <= 0.0 {
            return Err(Error::Validation(format!("PSF width scale must be positive, got {scale}")));
        }
        Ok(self.response_bin_at(band, bin)?.psf().scaled(scale))
    }

    /// Expected signal of the simulated spectrum in `band`, summed over analysis bins
    pub fn total_expected_signal(&self, band: usize) -> Result<f64> {
        let row = self.row(band)?;
        Ok(row.iter().map(ResponseBin::expected_signal).sum())
    }

    /// Expected background in `band`, summed over analysis bins
    pub fn total_expected_background(&self, band: usize) -> Result<f64> {
        let row = self.row(band)?;
        Ok(row.iter().map(ResponseBin::expected_background).sum())
    }

    fn row(&self, band: usize) -> Result<&[ResponseBin]> {
        self.table
            .get(band)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Validation(format!("declination band {band} out of range")))
    }
}
