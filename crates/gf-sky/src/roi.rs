//! Regions of interest.
//!
//! A [`Roi`] resolves to a [`PixelSet`] against a concrete [`SkyMap`]. The
//! result is always a subset of the map's defined pixels; a geometric region
//! that reaches outside the loaded map is a configuration error.

use crate::{GalacticFrame, PixelSet, SkyMap, SkyPos};
use gf_core::{Error, Result};
use serde::{Deserialize, Serialize};

fn default_max_latitude() -> f64 {
    1.2
}

/// Region-of-interest shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Roi {
    /// Pixels within `radius` degrees of `(ra, dec)`
    Disc {
        /// Centre right ascension, degrees
        ra: f64,
        /// Centre declination, degrees
        dec: f64,
        /// Radius, degrees
        radius: f64,
    },
    /// Pixels inside a convex polygon of `[ra, dec]` vertices
    Polygon {
        /// Vertices in degrees, either winding
        vertices: Vec<[f64; 2]>,
    },
    /// Map pixels within `max_latitude` degrees of the Galactic plane
    GalacticPlaneMask {
        /// Latitude threshold, degrees
        #[serde(default = "default_max_latitude")]
        max_latitude: f64,
        /// Variance (deg²) of an optional `exp(-b²/var)` excess profile
        #[serde(default)]
        latitude_weight_var: Option<f64>,
    },
}

/// RA/Dec bounding box of a source, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyBox {
    /// Minimum right ascension
    pub min_ra: f64,
    /// Maximum right ascension
    pub max_ra: f64,
    /// Minimum declination
    pub min_dec: f64,
    /// Maximum declination
    pub max_dec: f64,
}

impl SkyBox {
    /// Degenerate box around a single position.
    pub fn point(pos: &SkyPos) -> Self {
        Self { min_ra: pos.ra(), max_ra: pos.ra(), min_dec: pos.dec(), max_dec: pos.dec() }
    }

    /// Whether `pos` lies inside; a box with `min_ra > max_ra` wraps through RA 0.
    pub fn contains(&self, pos: &SkyPos) -> bool {
        let ra = pos.ra();
        let in_ra = if self.min_ra <= self.max_ra {
            ra >= self.min_ra && ra <= self.max_ra
        } else {
            ra >= self.min_ra || ra <= self.max_ra
        };
        in_ra && pos.dec() >= self.min_dec && pos.dec() <= self.max_dec
    }

    /// RA extent in degrees, accounting for wrap.
    pub fn ra_width(&self) -> f64 {
        if self.min_ra <= self.max_ra {
            self.max_ra - self.min_ra
        } else {
            self.max_ra + 360.0 - self.min_ra
        }
    }
}

impl Roi {
    /// Disc around `center`.
    pub fn disc(center: &SkyPos, radius: f64) -> Self {
        Roi::Disc { ra: center.ra(), dec: center.dec(), radius }
    }

    /// Disc covering the whole sphere.
    pub fn whole_sky() -> Self {
        Roi::Disc { ra: 180.0, dec: 0.0, radius: 360.0 }
    }

    /// Polygon through `vertices`.
    pub fn polygon(vertices: &[SkyPos]) -> Self {
        Roi::Polygon { vertices: vertices.iter().map(|v| [v.ra(), v.dec()]).collect() }
    }

    /// Galactic-plane mask with the default 1.2° threshold and no weighting.
    pub fn galactic_plane_mask() -> Self {
        Roi::GalacticPlaneMask { max_latitude: default_max_latitude(), latitude_weight_var: None }
    }

    /// Resolve to a pixel set of `map`.
    pub fn calc_roi<T: Clone>(&self, map: &SkyMap<T>) -> Result<PixelSet> {
        let hp = map.healpix();
        let pixels = match self {
            Roi::Disc { ra, dec, radius } => {
                if !radius.is_finite() || *radius < 0.0 {
                    return Err(Error::Validation(format!("invalid disc radius {radius}")));
                }
                hp.query_disc(&SkyPos::new(*ra, *dec), *radius)
            }
            Roi::Polygon { vertices } => {
                let verts: Vec<SkyPos> = vertices.iter().map(|v| SkyPos::new(v[0], v[1])).collect();
                hp.query_polygon(&verts)?
            }
            Roi::GalacticPlaneMask { max_latitude, .. } => {
                let frame = GalacticFrame::j2000();
                map.pixels().filter(|pix| frame.latitude(&hp.pix2pos(pix)).abs() <= *max_latitude)
            }
        };
        log::debug!("ROI resolved to {} pixels", pixels.len());

        if let Some(missing) = pixels.first_missing_from(map.pixels()) {
            let pos = hp.pix2pos(missing);
            return Err(Error::Validation(format!(
                "sky map ({} pixels) does not contain the region of interest ({} pixels); \
                 first missing pixel {missing} at RA {:.3}, Dec {:.3}",
                map.len(),
                pixels.len(),
                pos.ra(),
                pos.dec()
            )));
        }
        Ok(pixels)
    }

    /// `exp(-b²/var)` at `pos` for a weighted Galactic-plane mask, else `None`.
    pub fn latitude_weight(&self, frame: &GalacticFrame, pos: &SkyPos) -> Option<f64> {
        match self {
            Roi::GalacticPlaneMask { latitude_weight_var: Some(var), .. } => {
                let b = frame.latitude(pos);
                Some((-b * b / var).exp())
            }
            _ => None,
        }
    }

    /// Region covering every source plus `padding` degrees.
    ///
    /// No sources gives the whole sky; sources that all sit at one position
    /// give a disc of radius `padding`; anything else gives a padded RA/Dec
    /// box. A box that touches a pole or spans half the sky in RA cannot be
    /// a convex polygon and becomes the smallest disc around its corners.
    pub fn match_sources(points: &[SkyPos], boxes: &[SkyBox], padding: f64) -> Self {
        if points.is_empty() && boxes.is_empty() {
            log::warn!("no sources defined, using the whole sky as region of interest");
            return Roi::whole_sky();
        }
        let mut min_ra = 360.0f64;
        let mut max_ra = 0.0f64;
        let mut min_dec = 90.0f64;
        let mut max_dec = -90.0f64;
        for p in points {
            min_ra = min_ra.min(p.ra());
            max_ra = max_ra.max(p.ra());
            min_dec = min_dec.min(p.dec());
            max_dec = max_dec.max(p.dec());
        }
        for b in boxes {
            min_ra = min_ra.min(b.min_ra);
            max_ra = max_ra.max(b.max_ra);
            min_dec = min_dec.min(b.min_dec);
            max_dec = max_dec.max(b.max_dec);
        }

        if min_ra == max_ra && min_dec == max_dec {
            log::debug!("matched ROI: disc of {padding} deg around ({min_ra}, {min_dec})");
            return Roi::Disc { ra: min_ra, dec: min_dec, radius: padding };
        }

        let width = max_ra - min_ra + 2.0 * padding;
        let min_ra = (min_ra - padding).rem_euclid(360.0);
        let max_ra = (max_ra + padding).rem_euclid(360.0);
        let min_dec = (min_dec - padding).max(-90.0);
        let max_dec = (max_dec + padding).min(90.0);
        log::debug!("matched ROI box: RA [{min_ra}, {max_ra}], Dec [{min_dec}, {max_dec}]");

        let corners = [
            SkyPos::new(min_ra, min_dec),
            SkyPos::new(max_ra, min_dec),
            SkyPos::new(max_ra, max_dec),
            SkyPos::new(min_ra, max_dec),
        ];
        if width >= 180.0 || min_dec <= -90.0 || max_dec >= 90.0 {
            let center = SkyPos::new(min_ra + 0.5 * width, 0.5 * (min_dec + max_dec));
            let radius = corners.iter().map(|c| center.angle(c)).fold(padding, f64::max);
            return Roi::Disc { ra: center.ra(), dec: center.dec(), radius };
        }
        Roi::polygon(&corners)
    }
}
