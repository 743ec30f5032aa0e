//! Per-bin data maps.

use crate::{BinList, BinName, Healpix, PixelSet, SkyMap};
use gf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Data maps of one analysis bin. Both maps share a grid and pixel set.
#[derive(Debug, Clone)]
pub struct BinMaps {
    /// Observed counts
    pub on: SkyMap<f64>,
    /// Expected background counts
    pub background: SkyMap<f64>,
}

impl BinMaps {
    /// Pair an on-map with a background map; grids and pixel sets must match.
    pub fn new(on: SkyMap<f64>, background: SkyMap<f64>) -> Result<Self> {
        if on.nside() != background.nside() {
            return Err(Error::Validation(format!(
                "on-map nside {} differs from background nside {}",
                on.nside(),
                background.nside()
            )));
        }
        if on.pixels() != background.pixels() {
            return Err(Error::Validation(format!(
                "on-map ({} pixels) and background map ({} pixels) cover different pixels",
                on.len(),
                background.len()
            )));
        }
        Ok(Self { on, background })
    }
}

/// On/background maps for a set of analysis bins plus the exposure in transits.
#[derive(Debug, Clone)]
pub struct SkyMapCollection {
    bins: BTreeMap<BinName, BinMaps>,
    transits: f64,
}

impl SkyMapCollection {
    /// Empty collection for `transits` sidereal transits.
    pub fn new(transits: f64) -> Result<Self> {
        if !transits.is_finite() || transits <= 0.0 {
            return Err(Error::Validation(format!("invalid number of transits {transits}")));
        }
        Ok(Self { bins: BTreeMap::new(), transits })
    }

    /// Add the maps of one bin.
    pub fn insert(&mut self, bin: impl Into<BinName>, maps: BinMaps) -> Result<()> {
        let bin = bin.into();
        if self.bins.contains_key(&bin) {
            return Err(Error::Validation(format!("maps for bin '{bin}' given twice")));
        }
        self.bins.insert(bin, maps);
        Ok(())
    }

    /// Maps of `bin`
    pub fn bin(&self, bin: &str) -> Result<&BinMaps> {
        self.bins
            .get(bin)
            .ok_or_else(|| Error::Validation(format!("no sky maps for analysis bin '{bin}'")))
    }

    /// Number of sidereal transits
    pub fn transits(&self) -> f64 {
        self.transits
    }

    /// Bins present in the collection, in name order
    pub fn bin_list(&self) -> Result<BinList> {
        BinList::from_names(self.bins.keys().cloned())
    }

    /// Check that every bin of `bins` has maps.
    pub fn check_bins(&self, bins: &BinList) -> Result<()> {
        for bin in bins.iter() {
            self.bin(bin)?;
        }
        Ok(())
    }
}

fn default_transits() -> f64 {
    1.0
}

/// Serialized maps of one bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinMapsSpec {
    /// Defined pixels; absent means the full sky
    #[serde(default)]
    pub pixels: Option<Vec<usize>>,
    /// Observed counts, one per pixel
    pub on: Vec<f64>,
    /// Expected background counts, one per pixel
    pub background: Vec<f64>,
}

/// Serialized [`SkyMapCollection`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkyMapCollectionSpec {
    /// HEALPix resolution shared by every map
    pub nside: u32,
    /// Number of sidereal transits
    #[serde(default = "default_transits")]
    pub transits: f64,
    /// Maps by bin name
    pub bins: BTreeMap<BinName, BinMapsSpec>,
}

impl SkyMapCollectionSpec {
    /// Validate and build the collection.
    pub fn build(&self) -> Result<SkyMapCollection> {
        let hp = Healpix::new(self.nside)?;
        let mut out = SkyMapCollection::new(self.transits)?;
        for (name, spec) in &self.bins {
            let pixels: Vec<usize> = match &spec.pixels {
                Some(p) => p.clone(),
                None => (0..hp.npix()).collect(),
            };
            if spec.on.len() != pixels.len() || spec.background.len() != pixels.len() {
                return Err(Error::Validation(format!(
                    "bin '{name}': {} pixels but {} on-values and {} background values",
                    pixels.len(),
                    spec.on.len(),
                    spec.background.len()
                )));
            }
            let on = SkyMap::from_pairs(hp, pixels.iter().copied().zip(spec.on.iter().copied()))?;
            let background =
                SkyMap::from_pairs(hp, pixels.iter().copied().zip(spec.background.iter().copied()))?;
            out.insert(name.clone(), BinMaps::new(on, background)?)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_spec() {
        let json = r#"{
            "nside": 1,
            "transits": 2.5,
            "bins": {
                "1": {"on": [1,2,3,4,5,6,7,8,9,10,11,12], "background": [1,1,1,1,1,1,1,1,1,1,1,1]},
                "2": {"pixels": [0, 5], "on": [0, 3], "background": [0.5, 0.5]}
            }
        }"#;
        let spec: SkyMapCollectionSpec = serde_json::from_str(json).unwrap();
        let maps = spec.build().unwrap();
        assert_eq!(maps.transits(), 2.5);
        assert_eq!(maps.bin("1").unwrap().on.len(), 12);
        assert_eq!(maps.bin("2").unwrap().on.value(5).unwrap(), 3.0);
        assert!(maps.bin("3").is_err());
        assert_eq!(maps.bin_list().unwrap().len(), 2);
        assert!(maps.check_bins(&BinList::from_range(1, 3)).is_err());
    }

    #[test]
    fn test_mismatched_maps_rejected() {
        let hp = Healpix::new(2).unwrap();
        let hp4 = Healpix::new(4).unwrap();
        let on = SkyMap::new(hp, PixelSet::from_vec(vec![1, 2]), 0.0);
        assert!(BinMaps::new(on.clone(), SkyMap::new(hp4, PixelSet::from_vec(vec![1, 2]), 0.0)).is_err());
        assert!(BinMaps::new(on.clone(), SkyMap::new(hp, PixelSet::from_vec(vec![1, 3]), 0.0)).is_err());
        assert!(BinMaps::new(on.clone(), on).is_ok());
    }
}
