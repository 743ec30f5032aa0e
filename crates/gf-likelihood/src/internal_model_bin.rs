//! Per-bin nuisance state: background lookup and normalizations.

use crate::background::{BackgroundSurface, fit_surface};
use crate::internal_model::{FreeParameter, InternalModel};
use gf_core::{Error, Result, SharedParameters, Tunable};
use gf_sky::{BinName, PixelSet, SkyMap};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum BinBackground {
    Map,
    Surface {
        surface: Arc<dyn BackgroundSurface>,
        params: SharedParameters,
        free: Vec<usize>,
        seen_version: u64,
    },
}

/// Background and normalizations of one analysis bin.
///
/// Background values are cached per pixel without the background norm,
/// which is applied on read. Negative values are clamped to zero and
/// counted.
#[derive(Debug, Clone)]
pub struct InternalModelBin {
    bin: BinName,
    map: SkyMap<f64>,
    pixel_area: f64,
    common_norm: f64,
    background_norm: f64,
    background_norm_error: f64,
    background: BinBackground,
    cache: HashMap<usize, f64>,
    negative_count: usize,
}

impl InternalModelBin {
    /// Nuisance state of `bin` with background map `map`.
    ///
    /// With a background model, every surface parameter is first fit to the
    /// map over `roi`; afterwards only the model's free parameters are varied.
    pub fn new(bin: &str, model: &InternalModel, map: SkyMap<f64>, roi: &PixelSet) -> Result<Self> {
        let pixel_area = map.healpix().pixel_area_deg2();
        let mut imb = Self {
            bin: bin.to_string(),
            map,
            pixel_area,
            common_norm: model.common_norm(),
            background_norm: 1.0,
            background_norm_error: 0.0,
            background: BinBackground::Map,
            cache: HashMap::new(),
            negative_count: 0,
        };
        if let Some(bg) = model.background_model() {
            let surface = bg.surface().clone();
            let names = surface.parameter_names();
            let pairs: Vec<(&str, f64)> = names.iter().map(String::as_str).zip(bg.initial().iter().copied()).collect();
            let params = SharedParameters::new(format!("background_bin{bin}"), &pairs);
            imb.background =
                BinBackground::Surface { surface, params, free: bg.free().to_vec(), seen_version: 0 };
            imb.fit_background_model_to_map(roi)?;
        } else {
            log::debug!("bin {bin}: background taken from the data map");
        }
        Ok(imb)
    }

    /// Fit all surface parameters to `background / pixel_area` over `roi`
    /// and reset the background norm to 1.
    pub fn fit_background_model_to_map(&mut self, roi: &PixelSet) -> Result<()> {
        let BinBackground::Surface { surface, params, .. } = &self.background else {
            return Err(Error::Validation(format!("bin {}: no background model to fit", self.bin)));
        };
        let mut samples = Vec::with_capacity(roi.len());
        for pix in roi.iter() {
            samples.push((self.map.healpix().pix2pos(pix), self.map.value(pix)? / self.pixel_area));
        }
        let fitted = fit_surface(surface.as_ref(), &samples, &params.values()?)?;
        for (i, v) in fitted.iter().enumerate() {
            params.set_parameter(i, *v)?;
        }
        log::debug!(
            "bin {}: background surface '{}' fit to {} pixels: {:?}",
            self.bin,
            surface.name(),
            samples.len(),
            fitted
        );
        self.background_norm = 1.0;
        self.cache.clear();
        Ok(())
    }

    /// Drop the background surface and read the data map directly.
    pub fn set_background_from_map(&mut self) {
        self.background = BinBackground::Map;
        self.cache.clear();
        log::debug!("bin {}: background taken from the data map", self.bin);
    }

    /// Bin name
    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Background map of the data
    pub fn background_map(&self) -> &SkyMap<f64> {
        &self.map
    }

    /// Pixel area, deg²
    pub fn pixel_area(&self) -> f64 {
        self.pixel_area
    }

    /// Common normalization as last synchronised from the [`InternalModel`]
    pub fn common_norm(&self) -> f64 {
        self.common_norm
    }

    /// Set the common normalization seen by this bin
    pub fn set_common_norm(&mut self, value: f64) {
        self.common_norm = value;
    }

    /// Background normalization
    pub fn background_norm(&self) -> f64 {
        self.background_norm
    }

    /// Set the background normalization
    pub fn set_background_norm(&mut self, value: f64) {
        self.background_norm = value;
    }

    /// Background normalization error
    pub fn background_norm_error(&self) -> f64 {
        self.background_norm_error
    }

    /// Set the background normalization error
    pub fn set_background_norm_error(&mut self, error: f64) {
        self.background_norm_error = error;
    }

    /// Number of background evaluations clamped from negative to zero
    pub fn negative_background_count(&self) -> usize {
        self.negative_count
    }

    /// Parameters of the background surface, if one is used
    pub fn background_parameters(&self) -> Option<&SharedParameters> {
        match &self.background {
            BinBackground::Surface { params, .. } => Some(params),
            BinBackground::Map => None,
        }
    }

    /// Surface parameters the internal fit varies in this bin
    pub fn free_background_parameters(&self) -> Vec<FreeParameter> {
        match &self.background {
            BinBackground::Surface { params, free, .. } => {
                let function: Arc<dyn Tunable> = Arc::new(params.clone());
                free.iter().map(|&i| FreeParameter::new(function.clone(), i)).collect()
            }
            BinBackground::Map => Vec::new(),
        }
    }

    /// Version of the background surface parameters (0 for a data map)
    pub fn background_version(&self) -> u64 {
        self.background_parameters().map_or(0, |p| p.version())
    }

    /// Forget cached background values.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Background of pixel `pix` without the background norm, never negative.
    pub fn unscaled_background(&mut self, pix: usize) -> Result<f64> {
        if let BinBackground::Surface { params, seen_version, .. } = &mut self.background {
            let version = params.version();
            if version != *seen_version {
                *seen_version = version;
                self.cache.clear();
            }
        }
        if let Some(&v) = self.cache.get(&pix) {
            return Ok(v);
        }
        let raw = match &self.background {
            BinBackground::Map => self.map.value(pix)?,
            BinBackground::Surface { surface, params, .. } => {
                let pos = self.map.healpix().pix2pos(pix);
                surface.evaluate(&params.values()?, &pos) * self.pixel_area
            }
        };
        let value = if raw < 0.0 {
            self.negative_count += 1;
            log::trace!("bin {}: negative background {raw} at pixel {pix} clamped to 0", self.bin);
            0.0
        } else {
            raw
        };
        self.cache.insert(pix, value);
        Ok(value)
    }

    /// Expected background counts in pixel `pix`.
    pub fn background(&mut self, pix: usize) -> Result<f64> {
        Ok(self.unscaled_background(pix)? * self.background_norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{BackgroundModel, PolynomialSurface};
    use approx::assert_relative_eq;
    use gf_sky::{Healpix, SkyPos};

    fn tilted_map(hp: Healpix, roi: &PixelSet) -> SkyMap<f64> {
        let area = hp.pixel_area_deg2();
        SkyMap::from_pairs(
            hp,
            roi.iter().map(|p| {
                let pos = hp.pix2pos(p);
                (p, (20.0 + 2.0 * (pos.dec() - 30.0)) * area)
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_background_from_map_and_norm() {
        let hp = Healpix::new(32).unwrap();
        let roi = hp.query_disc(&SkyPos::new(50.0, 30.0), 5.0);
        let map = tilted_map(hp, &roi);
        let pix = roi.as_slice()[0];
        let expected = map.value(pix).unwrap();
        let mut imb = InternalModelBin::new("3", &InternalModel::default(), map, &roi).unwrap();
        assert_eq!(imb.background(pix).unwrap(), expected);
        imb.set_background_norm(1.5);
        assert_eq!(imb.background(pix).unwrap(), 1.5 * expected);
        assert!(imb.free_background_parameters().is_empty());
    }

    #[test]
    fn test_surface_fit_and_negative_clamp() {
        let hp = Healpix::new(32).unwrap();
        let roi = hp.query_disc(&SkyPos::new(50.0, 30.0), 5.0);
        let map = tilted_map(hp, &roi);
        let surface = Arc::new(PolynomialSurface::new(1, 50.0, 30.0).unwrap());
        let model = InternalModel::with_background_model(
            BackgroundModel::new(surface, vec![1.0, 0.0, 0.0], vec![0]).unwrap(),
            true,
            false,
        );
        let mut imb = InternalModelBin::new("3", &model, map.clone(), &roi).unwrap();
        let params = imb.background_parameters().unwrap().values().unwrap();
        assert_relative_eq!(params[0], 20.0, epsilon = 1e-6);
        assert_relative_eq!(params[2], 2.0, epsilon = 1e-6);
        for pix in roi.iter() {
            assert_relative_eq!(imb.background(pix).unwrap(), map.value(pix).unwrap(), max_relative = 1e-9);
        }
        assert_eq!(imb.negative_background_count(), 0);

        // drop the level so the southern part of the ROI goes negative
        let free = imb.free_background_parameters();
        assert_eq!(free.len(), 1);
        free[0].set_value(-5.0).unwrap();
        let mut negatives = 0;
        for pix in roi.iter() {
            let b = imb.background(pix).unwrap();
            assert!(b >= 0.0);
            if hp.pix2pos(pix).dec() < 32.5 {
                negatives += 1;
            }
        }
        assert!(negatives > 0);
        assert_eq!(imb.negative_background_count(), negatives);
    }
}
