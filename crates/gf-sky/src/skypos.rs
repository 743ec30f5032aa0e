//! Sky positions in equatorial coordinates.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A position on the celestial sphere.
///
/// Right ascension and declination are kept in degrees, together with the
/// Cartesian unit vector (x toward RA=0/Dec=0, z toward the north pole).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RaDec", into = "RaDec")]
pub struct SkyPos {
    ra: f64,
    dec: f64,
    vec: Vector3<f64>,
}

#[derive(Serialize, Deserialize)]
struct RaDec {
    ra: f64,
    dec: f64,
}

impl From<RaDec> for SkyPos {
    fn from(p: RaDec) -> Self {
        SkyPos::new(p.ra, p.dec)
    }
}

impl From<SkyPos> for RaDec {
    fn from(p: SkyPos) -> Self {
        RaDec { ra: p.ra, dec: p.dec }
    }
}

impl SkyPos {
    /// Build from RA/Dec in degrees. RA is wrapped into `[0, 360)`, Dec clamped to `[-90, 90]`.
    pub fn new(ra: f64, dec: f64) -> Self {
        let ra = ra.rem_euclid(360.0);
        let dec = dec.clamp(-90.0, 90.0);
        let (sd, cd) = dec.to_radians().sin_cos();
        let (sr, cr) = ra.to_radians().sin_cos();
        Self { ra, dec, vec: Vector3::new(cd * cr, cd * sr, sd) }
    }

    /// Build from HEALPix-style colatitude `theta` and longitude `phi` (radians).
    pub fn from_theta_phi(theta: f64, phi: f64) -> Self {
        Self::new(phi.to_degrees(), 90.0 - theta.to_degrees())
    }

    /// Build from a (not necessarily normalized) Cartesian vector.
    pub fn from_vector(v: &Vector3<f64>) -> Self {
        let n = v.norm();
        if n == 0.0 {
            return Self::new(0.0, 0.0);
        }
        let u = v / n;
        let dec = u.z.clamp(-1.0, 1.0).asin().to_degrees();
        let ra = u.y.atan2(u.x).to_degrees();
        let mut p = Self::new(ra, dec);
        p.vec = u;
        p
    }

    /// Right ascension in degrees, `[0, 360)`
    pub fn ra(&self) -> f64 {
        self.ra
    }

    /// Declination in degrees
    pub fn dec(&self) -> f64 {
        self.dec
    }

    /// Unit vector
    pub fn vector(&self) -> &Vector3<f64> {
        &self.vec
    }

    /// Colatitude in radians
    pub fn theta(&self) -> f64 {
        (90.0 - self.dec).to_radians()
    }

    /// Longitude in radians
    pub fn phi(&self) -> f64 {
        self.ra.to_radians()
    }

    /// Great-circle distance to `other`, in degrees.
    pub fn angle(&self, other: &SkyPos) -> f64 {
        // atan2 form stays accurate for both tiny and near-antipodal separations
        let cross = self.vec.cross(&other.vec).norm();
        let dot = self.vec.dot(&other.vec);
        cross.atan2(dot).to_degrees()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unit_vector_is_normalized() {
        for &(ra, dec) in &[(0.0, 0.0), (83.63, 22.01), (359.9, -89.5), (-10.0, 45.0)] {
            let p = SkyPos::new(ra, dec);
            assert_relative_eq!(p.vector().norm(), 1.0, epsilon = 1e-14);
            assert!(p.ra() >= 0.0 && p.ra() < 360.0);
        }
    }

    #[test]
    fn test_angle() {
        let a = SkyPos::new(10.0, 0.0);
        let b = SkyPos::new(20.0, 0.0);
        assert_relative_eq!(a.angle(&b), 10.0, epsilon = 1e-12);
        let pole = SkyPos::new(123.0, 90.0);
        assert_relative_eq!(a.angle(&pole), 90.0, epsilon = 1e-12);
        assert_relative_eq!(a.angle(&a), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_vector_round_trip() {
        let p = SkyPos::new(201.5, -43.0);
        let q = SkyPos::from_vector(&(p.vector() * 3.0));
        assert_relative_eq!(q.ra(), p.ra(), epsilon = 1e-10);
        assert_relative_eq!(q.dec(), p.dec(), epsilon = 1e-10);
    }

    #[test]
    fn test_serde_as_ra_dec() {
        let p: SkyPos = serde_json::from_str(r#"{"ra": 370.0, "dec": 10.0}"#).unwrap();
        assert_relative_eq!(p.ra(), 10.0, epsilon = 1e-12);
    }
}
