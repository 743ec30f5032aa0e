//! Partial HEALPix maps.

use crate::{Healpix, PixelSet, SkyPos};
use gf_core::{Error, Result};

/// Values defined on a subset of the pixels of a [`Healpix`] grid.
///
/// Pixels outside the defined set have no value; reading one is a
/// validation error rather than an implicit zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyMap<T> {
    healpix: Healpix,
    pixels: PixelSet,
    values: Vec<T>,
}

impl<T: Clone> SkyMap<T> {
    /// Map over `pixels`, every value set to `fill`.
    pub fn new(healpix: Healpix, pixels: PixelSet, fill: T) -> Self {
        let values = vec![fill; pixels.len()];
        Self { healpix, pixels, values }
    }

    /// Full-sky map.
    pub fn full(healpix: Healpix, fill: T) -> Self {
        Self::new(healpix, PixelSet::full(healpix.npix()), fill)
    }

    /// Build from `(pixel, value)` pairs. Duplicate or out-of-range pixels are rejected.
    pub fn from_pairs(healpix: Healpix, pairs: impl IntoIterator<Item = (usize, T)>) -> Result<Self> {
        let mut pairs: Vec<(usize, T)> = pairs.into_iter().collect();
        pairs.sort_by_key(|(p, _)| *p);
        let npix = healpix.npix();
        for w in pairs.windows(2) {
            if w[0].0 == w[1].0 {
                return Err(Error::Validation(format!("duplicate pixel {} in map", w[0].0)));
            }
        }
        if let Some(&(p, _)) = pairs.last().filter(|(p, _)| *p >= npix) {
            return Err(Error::Validation(format!(
                "pixel {p} out of range for nside {} ({npix} pixels)",
                healpix.nside()
            )));
        }
        let (pix, values): (Vec<usize>, Vec<T>) = pairs.into_iter().unzip();
        Ok(Self { healpix, pixels: PixelSet::from_vec(pix), values })
    }

    /// Value at `pix`, if defined
    pub fn get(&self, pix: usize) -> Option<&T> {
        self.pixels.position(pix).map(|i| &self.values[i])
    }

    /// Value at `pix`; an undefined pixel is an error.
    pub fn value(&self, pix: usize) -> Result<T> {
        self.get(pix).cloned().ok_or_else(|| {
            let pos = self.healpix.pix2pos(pix);
            Error::Validation(format!(
                "pixel {pix} (RA {:.3}, Dec {:.3}) is not defined in the map",
                pos.ra(),
                pos.dec()
            ))
        })
    }

    /// Overwrite the value at a defined pixel.
    pub fn set(&mut self, pix: usize, value: T) -> Result<()> {
        match self.pixels.position(pix) {
            Some(i) => {
                self.values[i] = value;
                Ok(())
            }
            None => Err(Error::Validation(format!("pixel {pix} is not defined in the map"))),
        }
    }

    /// Value at the pixel containing `pos`
    pub fn value_at(&self, pos: &SkyPos) -> Option<&T> {
        self.get(self.healpix.ang2pix(pos))
    }

    /// `(pixel, value)` pairs in ascending pixel order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.pixels.iter().zip(self.values.iter())
    }

    /// Underlying grid
    pub fn healpix(&self) -> Healpix {
        self.healpix
    }

    /// Grid resolution
    pub fn nside(&self) -> u32 {
        self.healpix.nside()
    }

    /// Defined pixels
    pub fn pixels(&self) -> &PixelSet {
        &self.pixels
    }

    /// Whether every pixel of `set` is defined
    pub fn contains_all(&self, set: &PixelSet) -> bool {
        set.is_subset(&self.pixels)
    }

    /// Number of defined pixels
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no pixel is defined
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SkyMap<f64> {
    /// Add `value` at a defined pixel.
    pub fn add(&mut self, pix: usize, value: f64) -> Result<()> {
        match self.pixels.position(pix) {
            Some(i) => {
                self.values[i] += value;
                Ok(())
            }
            None => Err(Error::Validation(format!("pixel {pix} is not defined in the map"))),
        }
    }

    /// Sum over the pixels of `set`; pixels missing from the map are an error.
    pub fn sum_over(&self, set: &PixelSet) -> Result<f64> {
        set.iter().map(|p| self.value(p)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_map_access() {
        let hp = Healpix::new(4).unwrap();
        let mut map = SkyMap::from_pairs(hp, vec![(10, 1.0), (3, 2.0), (7, 0.5)]).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(3), Some(&2.0));
        assert!(map.get(4).is_none());
        assert!(map.value(4).is_err());
        map.add(10, 1.5).unwrap();
        assert_eq!(map.value(10).unwrap(), 2.5);
        assert!(map.set(11, 1.0).is_err());
        let all = map.pixels().clone();
        assert_eq!(map.sum_over(&all).unwrap(), 5.0);
        assert!(map.contains_all(&PixelSet::from_vec(vec![3, 10])));
        assert!(!map.contains_all(&PixelSet::from_vec(vec![3, 4])));
    }

    #[test]
    fn test_from_pairs_rejects_bad_input() {
        let hp = Healpix::new(1).unwrap();
        assert!(SkyMap::from_pairs(hp, vec![(1, 1.0), (1, 2.0)]).is_err());
        assert!(SkyMap::from_pairs(hp, vec![(12, 1.0)]).is_err());
    }

    #[test]
    fn test_full_map_lookup_by_position() {
        let hp = Healpix::new(8).unwrap();
        let mut map = SkyMap::full(hp, 0u32);
        let pos = SkyPos::new(45.0, 30.0);
        map.set(hp.ang2pix(&pos), 7).unwrap();
        assert_eq!(map.value_at(&pos), Some(&7));
    }
}
