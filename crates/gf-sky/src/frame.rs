//! Equatorial <-> Galactic coordinate rotation.

use crate::SkyPos;
use gf_core::{Error, Result};
use nalgebra::{Matrix3, Vector3};

/// J2000 right ascension of the north Galactic pole, degrees
pub const NGP_RA: f64 = 192.8595;
/// J2000 declination of the north Galactic pole, degrees
pub const NGP_DEC: f64 = 27.12825;
/// J2000 right ascension of the Galactic centre, degrees
pub const GC_RA: f64 = 266.405;
/// J2000 declination of the Galactic centre, degrees
pub const GC_DEC: f64 = -28.936172;

/// Rotation between equatorial (RA/Dec) and Galactic (l/b) frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GalacticFrame {
    equ_to_gal: Matrix3<f64>,
}

impl Default for GalacticFrame {
    fn default() -> Self {
        Self::j2000()
    }
}

impl GalacticFrame {
    /// Frame defined by the J2000 pole and centre directions.
    pub fn j2000() -> Self {
        let pole = *SkyPos::new(NGP_RA, NGP_DEC).vector();
        let centre = *SkyPos::new(GC_RA, GC_DEC).vector();
        let x = (centre - pole * pole.dot(&centre)).normalize();
        let y = pole.cross(&x);
        let equ_to_gal = Matrix3::from_rows(&[x.transpose(), y.transpose(), pole.transpose()]);
        Self { equ_to_gal }
    }

    /// Frame from an explicit rotation matrix; must be orthonormal.
    pub fn from_matrix(equ_to_gal: Matrix3<f64>) -> Result<Self> {
        let err = (equ_to_gal * equ_to_gal.transpose() - Matrix3::identity()).abs().max();
        if !err.is_finite() || err > 1e-9 || equ_to_gal.determinant() < 0.0 {
            return Err(Error::Validation(format!(
                "Galactic rotation is not a proper rotation (orthogonality error {err:.3e})"
            )));
        }
        Ok(Self { equ_to_gal })
    }

    /// `(l, b)` in degrees for an equatorial position; `l` in `[0, 360)`.
    pub fn to_galactic(&self, pos: &SkyPos) -> (f64, f64) {
        let g = SkyPos::from_vector(&(self.equ_to_gal * pos.vector()));
        (g.ra(), g.dec())
    }

    /// Equatorial position of Galactic `(l, b)` in degrees.
    pub fn to_equatorial(&self, l: f64, b: f64) -> SkyPos {
        let g: Vector3<f64> = *SkyPos::new(l, b).vector();
        SkyPos::from_vector(&(self.equ_to_gal.transpose() * g))
    }

    /// Galactic latitude of `pos`, degrees
    pub fn latitude(&self, pos: &SkyPos) -> f64 {
        let z = self.equ_to_gal.row(2).transpose().dot(pos.vector());
        z.clamp(-1.0, 1.0).asin().to_degrees()
    }
}
