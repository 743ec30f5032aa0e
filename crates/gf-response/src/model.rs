//! Source-model query interface.
//!
//! The likelihood kernel never owns source parameters. It queries a
//! [`SourceModel`] for positions and fluxes and watches its version
//! counters to decide which caches to drop.

use crate::LogLogSpectrum;
use gf_core::{Error, Result};
use gf_sky::{SkyBox, SkyPos};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Mutation counters of a source model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelVersions {
    /// Bumped when a position or extended-source shape changes
    pub morphology: u64,
    /// Bumped when a spectrum changes
    pub spectrum: u64,
}

/// Read interface to externally owned sources.
///
/// Energies are in MeV; point-source fluxes in MeV⁻¹ cm⁻² s⁻¹, extended
/// source fluxes additionally per steradian.
pub trait SourceModel: Send + Sync {
    /// Number of point sources
    fn n_point_sources(&self) -> usize;
    /// Name of point source `id`
    fn point_source_name(&self, id: usize) -> Result<String>;
    /// Position of point source `id`
    fn point_source_position(&self, id: usize) -> Result<SkyPos>;
    /// Differential flux of point source `id` at each energy
    fn point_source_fluxes(&self, id: usize, energies_mev: &[f64]) -> Result<Vec<f64>>;

    /// Number of extended sources
    fn n_extended_sources(&self) -> usize;
    /// Name of extended source `id`
    fn extended_source_name(&self, id: usize) -> Result<String>;
    /// RA/Dec box enclosing extended source `id`
    fn extended_source_boundaries(&self, id: usize) -> Result<SkyBox>;
    /// Differential surface brightness of extended source `id` at `(ra, dec)`
    fn extended_source_fluxes(
        &self,
        id: usize,
        ra: f64,
        dec: f64,
        energies_mev: &[f64],
    ) -> Result<Vec<f64>>;
    /// Whether `(ra, dec)` lies inside any extended source
    fn is_inside_any_extended_source(&self, ra: f64, dec: f64) -> bool;

    /// Current mutation counters
    fn versions(&self) -> ModelVersions;
}

/// Point source with a power-law spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSource {
    /// Source name
    pub name: String,
    /// Right ascension, degrees
    pub ra: f64,
    /// Declination, degrees
    pub dec: f64,
    /// Spectrum
    #[serde(default)]
    pub spectrum: LogLogSpectrum,
}

/// Spatial template of an extended source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Morphology {
    /// Uniform disk
    Disk {
        /// Centre right ascension, degrees
        ra: f64,
        /// Centre declination, degrees
        dec: f64,
        /// Radius, degrees
        radius: f64,
    },
    /// Symmetric 2D Gaussian truncated at five widths
    Gaussian {
        /// Centre right ascension, degrees
        ra: f64,
        /// Centre declination, degrees
        dec: f64,
        /// Width, degrees
        sigma: f64,
    },
}

const GAUSSIAN_TRUNCATION: f64 = 5.0;

impl Morphology {
    fn centre(&self) -> SkyPos {
        match *self {
            Morphology::Disk { ra, dec, .. } | Morphology::Gaussian { ra, dec, .. } => SkyPos::new(ra, dec),
        }
    }

    /// Radius beyond which the template is zero, degrees
    pub fn extent(&self) -> f64 {
        match *self {
            Morphology::Disk { radius, .. } => radius,
            Morphology::Gaussian { sigma, .. } => GAUSSIAN_TRUNCATION * sigma,
        }
    }

    fn validate(&self) -> Result<()> {
        let size = match *self {
            Morphology::Disk { radius, .. } => radius,
            Morphology::Gaussian { sigma, .. } => sigma,
        };
        if !(size.is_finite() && size > 0.0) {
            return Err(Error::Validation(format!("extended source size must be positive, got {size}")));
        }
        Ok(())
    }

    /// Whether `pos` is inside the template
    pub fn contains(&self, pos: &SkyPos) -> bool {
        self.centre().angle(pos) <= self.extent()
    }

    /// Template value at `pos`, sr⁻¹; integrates to one over the sphere.
    pub fn density(&self, pos: &SkyPos) -> f64 {
        let theta = self.centre().angle(pos);
        match *self {
            Morphology::Disk { radius, .. } => {
                if theta > radius {
                    0.0
                } else {
                    1.0 / (std::f64::consts::TAU * (1.0 - radius.to_radians().cos()))
                }
            }
            Morphology::Gaussian { sigma, .. } => {
                if theta > GAUSSIAN_TRUNCATION * sigma {
                    return 0.0;
                }
                let s = sigma.to_radians();
                let t = theta.to_radians();
                (-t * t / (2.0 * s * s)).exp() / (std::f64::consts::TAU * s * s)
            }
        }
    }

    /// RA/Dec box enclosing the template.
    pub fn boundaries(&self) -> SkyBox {
        let c = self.centre();
        let r = self.extent();
        let min_dec = (c.dec() - r).max(-90.0);
        let max_dec = (c.dec() + r).min(90.0);
        if min_dec <= -90.0 || max_dec >= 90.0 {
            return SkyBox { min_ra: 0.0, max_ra: 360.0, min_dec, max_dec };
        }
        let widest = c.dec().abs() + r;
        let half = r / widest.to_radians().cos();
        if half >= 180.0 {
            return SkyBox { min_ra: 0.0, max_ra: 360.0, min_dec, max_dec };
        }
        SkyBox {
            min_ra: (c.ra() - half).rem_euclid(360.0),
            max_ra: (c.ra() + half).rem_euclid(360.0),
            min_dec,
            max_dec,
        }
    }
}

/// Extended source: template times spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedSource {
    /// Source name
    pub name: String,
    /// Spatial template
    pub morphology: Morphology,
    /// Spectrum of the whole source
    #[serde(default)]
    pub spectrum: LogLogSpectrum,
}

/// Serialized source list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalogSpec {
    /// Point sources
    #[serde(default)]
    pub point_sources: Vec<PointSource>,
    /// Extended sources
    #[serde(default)]
    pub extended_sources: Vec<ExtendedSource>,
}

/// In-memory [`SourceModel`] whose sources can be edited between evaluations.
#[derive(Debug, Default)]
pub struct SourceCatalog {
    sources: RwLock<SourceCatalogSpec>,
    morphology: AtomicU64,
    spectrum: AtomicU64,
}

fn tev_flux_to_mev(spectrum: &LogLogSpectrum, energies_mev: &[f64]) -> Vec<f64> {
    energies_mev.iter().map(|e| spectrum.flux(e * 1e-6) * 1e-6).collect()
}

impl SourceCatalog {
    /// Catalog with the given sources.
    pub fn new(spec: SourceCatalogSpec) -> Result<Self> {
        for e in &spec.extended_sources {
            e.morphology.validate()?;
        }
        Ok(Self { sources: RwLock::new(spec), ..Default::default() })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, SourceCatalogSpec>> {
        self.sources.read().map_err(|_| Error::Computation("source catalog lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, SourceCatalogSpec>> {
        self.sources.write().map_err(|_| Error::Computation("source catalog lock poisoned".into()))
    }

    fn bump(&self, morphology: bool, spectrum: bool) {
        if morphology {
            self.morphology.fetch_add(1, Ordering::Release);
        }
        if spectrum {
            self.spectrum.fetch_add(1, Ordering::Release);
        }
    }

    /// Snapshot of the current sources
    pub fn snapshot(&self) -> Result<SourceCatalogSpec> {
        Ok(self.read()?.clone())
    }

    /// Append a point source.
    pub fn add_point_source(&self, source: PointSource) -> Result<()> {
        self.write()?.point_sources.push(source);
        self.bump(true, true);
        Ok(())
    }

    /// Append an extended source.
    pub fn add_extended_source(&self, source: ExtendedSource) -> Result<()> {
        source.morphology.validate()?;
        self.write()?.extended_sources.push(source);
        self.bump(true, true);
        Ok(())
    }

    /// Move point source `id`.
    pub fn set_point_source_position(&self, id: usize, ra: f64, dec: f64) -> Result<()> {
        {
            let mut s = self.write()?;
            let src = point_mut(&mut s, id)?;
            src.ra = ra;
            src.dec = dec;
        }
        self.bump(true, false);
        Ok(())
    }

    /// Replace the spectrum of point source `id`.
    pub fn set_point_source_spectrum(&self, id: usize, spectrum: LogLogSpectrum) -> Result<()> {
        point_mut(&mut *self.write()?, id)?.spectrum = spectrum;
        self.bump(false, true);
        Ok(())
    }

    /// Replace the template of extended source `id`.
    pub fn set_extended_source_morphology(&self, id: usize, morphology: Morphology) -> Result<()> {
        morphology.validate()?;
        extended_mut(&mut *self.write()?, id)?.morphology = morphology;
        self.bump(true, false);
        Ok(())
    }

    /// Replace the spectrum of extended source `id`.
    pub fn set_extended_source_spectrum(&self, id: usize, spectrum: LogLogSpectrum) -> Result<()> {
        extended_mut(&mut *self.write()?, id)?.spectrum = spectrum;
        self.bump(false, true);
        Ok(())
    }

    fn point(&self, id: usize) -> Result<PointSource> {
        self.read()?
            .point_sources
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no point source with id {id}")))
    }

    fn extended(&self, id: usize) -> Result<ExtendedSource> {
        self.read()?
            .extended_sources
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no extended source with id {id}")))
    }
}

fn point_mut(s: &mut SourceCatalogSpec, id: usize) -> Result<&mut PointSource> {
    s.point_sources
        .get_mut(id)
        .ok_or_else(|| Error::Validation(format!("no point source with id {id}")))
}

fn extended_mut(s: &mut SourceCatalogSpec, id: usize) -> Result<&mut ExtendedSource> {
    s.extended_sources
        .get_mut(id)
        .ok_or_else(|| Error::Validation(format!("no extended source with id {id}")))
}

impl SourceModel for SourceCatalog {
    fn n_point_sources(&self) -> usize {
        self.read().map(|s| s.point_sources.len()).unwrap_or(0)
    }

    fn point_source_name(&self, id: usize) -> Result<String> {
        Ok(self.point(id)?.name)
    }

    fn point_source_position(&self, id: usize) -> Result<SkyPos> {
        let p = self.point(id)?;
        Ok(SkyPos::new(p.ra, p.dec))
    }

    fn point_source_fluxes(&self, id: usize, energies_mev: &[f64]) -> Result<Vec<f64>> {
        Ok(tev_flux_to_mev(&self.point(id)?.spectrum, energies_mev))
    }

    fn n_extended_sources(&self) -> usize {
        self.read().map(|s| s.extended_sources.len()).unwrap_or(0)
    }

    fn extended_source_name(&self, id: usize) -> Result<String> {
        Ok(self.extended(id)?.name)
    }

    fn extended_source_boundaries(&self, id: usize) -> Result<SkyBox> {
        Ok(self.extended(id)?.morphology.boundaries())
    }

    fn extended_source_fluxes(
        &self,
        id: usize,
        ra: f64,
        dec: f64,
        energies_mev: &[f64],
    ) -> Result<Vec<f64>> {
        let src = self.extended(id)?;
        let density = src.morphology.density(&SkyPos::new(ra, dec));
        Ok(tev_flux_to_mev(&src.spectrum, energies_mev).into_iter().map(|f| f * density).collect())
    }

    fn is_inside_any_extended_source(&self, ra: f64, dec: f64) -> bool {
        let pos = SkyPos::new(ra, dec);
        self.read().map(|s| s.extended_sources.iter().any(|e| e.morphology.contains(&pos))).unwrap_or(false)
    }

    fn versions(&self) -> ModelVersions {
        ModelVersions {
            morphology: self.morphology.load(Ordering::Acquire),
            spectrum: self.spectrum.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn catalog() -> SourceCatalog {
        SourceCatalog::new(SourceCatalogSpec {
            point_sources: vec![PointSource {
                name: "crab".into(),
                ra: 83.63,
                dec: 22.01,
                spectrum: LogLogSpectrum::power_law(2e-11, 2.5),
            }],
            extended_sources: vec![ExtendedSource {
                name: "blob".into(),
                morphology: Morphology::Disk { ra: 100.0, dec: 10.0, radius: 1.0 },
                spectrum: LogLogSpectrum::power_law(1e-11, 2.0),
            }],
        })
        .unwrap()
    }

    #[test]
    fn test_flux_units() {
        let c = catalog();
        let f = c.point_source_fluxes(0, &[1e6]).unwrap();
        assert_relative_eq!(f[0] * 1e6, 2e-11, max_relative = 1e-12);
    }

    #[test]
    fn test_versions_track_edits() {
        let c = catalog();
        let v0 = c.versions();
        c.set_point_source_spectrum(0, LogLogSpectrum::power_law(1e-11, 2.0)).unwrap();
        let v1 = c.versions();
        assert_eq!(v1.morphology, v0.morphology);
        assert_eq!(v1.spectrum, v0.spectrum + 1);
        c.set_point_source_position(0, 84.0, 22.0).unwrap();
        assert_eq!(c.versions().morphology, v0.morphology + 1);
        assert!(c.set_point_source_position(3, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_disk_template() {
        let c = catalog();
        assert!(c.is_inside_any_extended_source(100.5, 10.0));
        assert!(!c.is_inside_any_extended_source(102.0, 10.0));
        let b = c.extended_source_boundaries(0).unwrap();
        assert_relative_eq!(b.min_dec, 9.0);
        assert!(b.contains(&SkyPos::new(100.9, 10.0)));
        // surface brightness times disk solid angle recovers the total flux
        let inside = c.extended_source_fluxes(0, 100.0, 10.0, &[1e6]).unwrap()[0];
        let omega = std::f64::consts::TAU * (1.0 - 1f64.to_radians().cos());
        assert_relative_eq!(inside * omega * 1e6, 1e-11, max_relative = 1e-12);
        assert_eq!(c.extended_source_fluxes(0, 110.0, 10.0, &[1e6]).unwrap()[0], 0.0);
    }

    #[test]
    fn test_gaussian_template_normalized() {
        let m = Morphology::Gaussian { ra: 0.0, dec: 0.0, sigma: 0.5 };
        // integrate over rings
        let mut total = 0.0;
        let n = 2000;
        let dr = m.extent() / n as f64;
        for i in 0..n {
            let r = (i as f64 + 0.5) * dr;
            let d = m.density(&SkyPos::new(r, 0.0));
            total += d * std::f64::consts::TAU * r.to_radians().sin() * dr.to_radians();
        }
        assert_relative_eq!(total, 1.0, max_relative = 1e-3);
    }
}
