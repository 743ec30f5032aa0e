//! Point-source response.

use crate::{DecInterpolation, DetectorResponse, SmearingProfile, SourceModel};
use gf_core::Result;
use gf_sky::SkyPos;

/// Position change below which a source is considered fixed, degrees
const MOVE_TOLERANCE: f64 = 1e-6;

/// Expected signal of one point source in every analysis bin.
#[derive(Debug, Clone)]
pub struct PointSourceResponse {
    id: usize,
    name: String,
    pos: SkyPos,
    interp: DecInterpolation,
    signals: Vec<f64>,
}

impl PointSourceResponse {
    /// Response of point source `id` of `model`.
    pub fn new(model: &dyn SourceModel, id: usize, dr: &DetectorResponse) -> Result<Self> {
        let pos = model.point_source_position(id)?;
        let interp = dr.interpolation(pos.dec())?;
        let mut resp = Self {
            id,
            name: model.point_source_name(id)?,
            pos,
            interp,
            signals: vec![0.0; dr.bins().len()],
        };
        resp.reweight(model, dr)?;
        Ok(resp)
    }

    /// Re-read position and spectrum. Returns whether the source moved.
    pub fn update(&mut self, model: &dyn SourceModel, dr: &DetectorResponse) -> Result<bool> {
        let pos = model.point_source_position(self.id)?;
        let moved = (pos.ra() - self.pos.ra()).abs() > MOVE_TOLERANCE
            || (pos.dec() - self.pos.dec()).abs() > MOVE_TOLERANCE;
        if moved {
            log::debug!("point source '{}' moved to ({:.4}, {:.4})", self.name, pos.ra(), pos.dec());
            self.interp = dr.interpolation(pos.dec())?;
            self.pos = pos;
        }
        self.reweight(model, dr)?;
        Ok(moved)
    }

    fn reweight(&mut self, model: &dyn SourceModel, dr: &DetectorResponse) -> Result<()> {
        // MeV⁻¹ -> TeV⁻¹
        let fluxes: Vec<f64> =
            model.point_source_fluxes(self.id, &dr.energies_mev())?.into_iter().map(|f| f * 1e6).collect();
        for (b, signal) in self.signals.iter_mut().enumerate() {
            let s1 = dr.response_bin_at(self.interp.band1, b)?.reweighted_signal(&fluxes)?;
            let s2 = dr.response_bin_at(self.interp.band2, b)?.reweighted_signal(&fluxes)?;
            *signal = self.interp.combine(s1, s2);
        }
        log::trace!("point source '{}' signals per transit: {:?}", self.name, self.signals);
        Ok(())
    }

    /// Index of the source in the model
    pub fn id(&self) -> usize {
        self.id
    }

    /// Source name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current position
    pub fn position(&self) -> &SkyPos {
        &self.pos
    }

    /// Declination-band interpolation at the current position
    pub fn interpolation(&self) -> &DecInterpolation {
        &self.interp
    }

    /// Expected signal per transit in analysis bin `bin` (position in the response's bin list)
    pub fn expected_signal(&self, bin: usize) -> f64 {
        self.signals.get(bin).copied().unwrap_or(0.0)
    }

    /// Smearing profile of bin `bin` for pixels of `pixel_area` deg².
    ///
    /// The PSF is taken from the band containing the source.
    pub fn smearing_profile(&self, dr: &DetectorResponse, bin: usize, pixel_area: f64) -> Result<SmearingProfile> {
        SmearingProfile::new(&dr.psf(self.interp.band1, bin)?, pixel_area)
    }

    /// Whether the PSF of bin `bin` fits inside one pixel of `pixel_area` deg².
    pub fn is_psf_delta_function(&self, dr: &DetectorResponse, bin: usize, pixel_area: f64) -> Result<bool> {
        Ok(self.smearing_profile(dr, bin, pixel_area)?.is_delta())
    }

    /// Expected signal per transit in a pixel `distance` degrees away.
    pub fn smeared_signal(&self, distance: f64, bin: usize, profile: &SmearingProfile) -> f64 {
        profile.relative_density(distance) * self.expected_signal(bin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::test_spec;
    use crate::{LogLogSpectrum, PointSource, SourceCatalog, SourceCatalogSpec};
    use approx::assert_relative_eq;
    use gf_sky::Healpix;

    fn setup(dec: f64, spectrum: LogLogSpectrum) -> (DetectorResponse, SourceCatalog) {
        let dr = DetectorResponse::from_spec(&test_spec()).unwrap();
        let cat = SourceCatalog::new(SourceCatalogSpec {
            point_sources: vec![PointSource { name: "src".into(), ra: 50.0, dec, spectrum }],
            extended_sources: vec![],
        })
        .unwrap();
        (dr, cat)
    }

    #[test]
    fn test_simulated_spectrum_reproduces_table() {
        let (dr, cat) = setup(10.0, LogLogSpectrum::default());
        let ps = PointSourceResponse::new(&cat, 0, &dr).unwrap();
        // band 1 has twice the signal of the table template
        assert_relative_eq!(ps.expected_signal(0), 2.0 * 16.1, max_relative = 1e-9);
        assert_relative_eq!(ps.expected_signal(1), 2.0 * 9.0, max_relative = 1e-9);
    }

    #[test]
    fn test_interpolated_between_bands() {
        let (dr, cat) = setup(15.0, LogLogSpectrum::default());
        let ps = PointSourceResponse::new(&cat, 0, &dr).unwrap();
        assert_relative_eq!(ps.expected_signal(0), 0.75 * 32.2 + 0.25 * 16.1, max_relative = 1e-9);
    }

    #[test]
    fn test_update_detects_moves_and_spectrum() {
        let (dr, cat) = setup(10.0, LogLogSpectrum::default());
        let mut ps = PointSourceResponse::new(&cat, 0, &dr).unwrap();
        let before = ps.expected_signal(0);
        let mut doubled = LogLogSpectrum::default();
        doubled.norm *= 2.0;
        cat.set_point_source_spectrum(0, doubled).unwrap();
        assert!(!ps.update(&cat, &dr).unwrap());
        assert_relative_eq!(ps.expected_signal(0), 2.0 * before, max_relative = 1e-9);

        cat.set_point_source_position(0, 50.0, 10.0 + 1e-8).unwrap();
        assert!(!ps.update(&cat, &dr).unwrap());
        cat.set_point_source_position(0, 51.0, 10.0).unwrap();
        assert!(ps.update(&cat, &dr).unwrap());
    }

    #[test]
    fn test_smeared_signal_sums_to_expected() {
        let (dr, cat) = setup(10.0, LogLogSpectrum::default());
        let ps = PointSourceResponse::new(&cat, 0, &dr).unwrap();
        let hp = Healpix::new(256).unwrap();
        let area = hp.pixel_area_deg2();
        let bin = 1;
        let profile = ps.smearing_profile(&dr, bin, area).unwrap();
        let total: f64 = hp
            .query_disc(ps.position(), 3.0)
            .iter()
            .map(|p| ps.smeared_signal(hp.pix2pos(p).angle(ps.position()), bin, &profile))
            .sum();
        assert_relative_eq!(total, ps.expected_signal(bin), max_relative = 0.02);
        assert_eq!(ps.smeared_signal(10.5, bin, &profile), 0.0);
    }

    #[test]
    fn test_delta_psf_on_coarse_pixels() {
        let (dr, cat) = setup(10.0, LogLogSpectrum::default());
        let ps = PointSourceResponse::new(&cat, 0, &dr).unwrap();
        let coarse = Healpix::new(1).unwrap().pixel_area_deg2();
        let fine = Healpix::new(256).unwrap().pixel_area_deg2();
        assert!(ps.is_psf_delta_function(&dr, 1, coarse).unwrap());
        assert!(!ps.is_psf_delta_function(&dr, 1, fine).unwrap());
    }
}
