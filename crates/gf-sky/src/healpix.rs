//! HEALPix pixelization in the RING scheme.
//!
//! Pixels are numbered ring by ring from the north pole. Ring indices run
//! `1..=4·nside-1`; the polar caps hold `nside-1` rings each.

use crate::{PixelSet, SkyPos};
use gf_core::{Error, Result};
use nalgebra::Vector3;
use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Largest supported resolution parameter.
pub const MAX_NSIDE: u32 = 1 << 29;

/// Geometry of one iso-latitude ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingInfo {
    /// Index of the first pixel in the ring
    pub start: usize,
    /// Number of pixels in the ring
    pub npix: usize,
    /// `cos(theta)` of the ring
    pub z: f64,
    /// Whether pixel centres are offset by half a pixel in longitude
    pub shifted: bool,
}

/// A HEALPix grid of a given `nside`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Healpix {
    nside: u64,
}

fn isqrt(x: u64) -> u64 {
    let mut r = (x as f64).sqrt() as u64;
    while r * r > x {
        r -= 1;
    }
    while (r + 1) * (r + 1) <= x {
        r += 1;
    }
    r
}

impl Healpix {
    /// Create a grid. `nside` must be in `1..=MAX_NSIDE`.
    pub fn new(nside: u32) -> Result<Self> {
        if nside == 0 || nside > MAX_NSIDE {
            return Err(Error::Validation(format!("invalid HEALPix nside {nside}")));
        }
        Ok(Self { nside: nside as u64 })
    }

    /// Resolution parameter
    pub fn nside(&self) -> u32 {
        self.nside as u32
    }

    /// Total number of pixels, `12·nside²`
    pub fn npix(&self) -> usize {
        (12 * self.nside * self.nside) as usize
    }

    /// Number of rings, `4·nside-1`
    pub fn n_rings(&self) -> usize {
        (4 * self.nside - 1) as usize
    }

    fn ncap(&self) -> u64 {
        2 * self.nside * (self.nside - 1)
    }

    /// Pixel solid angle in steradians
    pub fn pixel_area_sr(&self) -> f64 {
        4.0 * PI / self.npix() as f64
    }

    /// Pixel solid angle in square degrees
    pub fn pixel_area_deg2(&self) -> f64 {
        self.pixel_area_sr() * (180.0 / PI).powi(2)
    }

    fn pix2zphi(&self, pix: u64) -> (f64, f64) {
        let n = self.nside;
        let npix = 12 * n * n;
        let ncap = self.ncap();
        let fact2 = 4.0 / npix as f64;
        let fact1 = (2 * n) as f64 * fact2;

        if pix < ncap {
            let iring = (1 + isqrt(1 + 2 * pix)) >> 1;
            let iphi = (pix + 1) - 2 * iring * (iring - 1);
            let z = 1.0 - (iring * iring) as f64 * fact2;
            let phi = (iphi as f64 - 0.5) * FRAC_PI_2 / iring as f64;
            (z, phi)
        } else if pix < npix - ncap {
            let nl4 = 4 * n;
            let ip = pix - ncap;
            let tmp = ip / nl4;
            let iring = tmp + n;
            let iphi = ip - nl4 * tmp + 1;
            let fodd = if (iring + n) & 1 == 1 { 1.0 } else { 0.5 };
            let z = ((2 * n) as f64 - iring as f64) * fact1;
            let phi = (iphi as f64 - fodd) * PI * 0.75 * fact1;
            (z, phi)
        } else {
            let ip = npix - pix;
            let iring = (1 + isqrt(2 * ip - 1)) >> 1;
            let iphi = 4 * iring + 1 - (ip - 2 * iring * (iring - 1));
            let z = -1.0 + (iring * iring) as f64 * fact2;
            let phi = (iphi as f64 - 0.5) * FRAC_PI_2 / iring as f64;
            (z, phi)
        }
    }

    fn zphi2pix(&self, z: f64, phi: f64) -> u64 {
        let n = self.nside as i64;
        let nf = n as f64;
        let za = z.abs();
        let tt = (phi / FRAC_PI_2).rem_euclid(4.0);

        if za <= 2.0 / 3.0 {
            let nl4 = 4 * n;
            let temp1 = nf * (0.5 + tt);
            let temp2 = nf * z * 0.75;
            let jp = (temp1 - temp2) as i64;
            let jm = (temp1 + temp2) as i64;
            let ir = n + 1 + jp - jm;
            let kshift = 1 - (ir & 1);
            let t1 = jp + jm - n + kshift + 1 + nl4 + nl4;
            let ip = (t1 >> 1) % nl4;
            (self.ncap() as i64 + (ir - 1) * nl4 + ip) as u64
        } else {
            let tp = tt - tt.floor();
            let tmp = nf * (3.0 * (1.0 - za)).sqrt();
            let jp = (tp * tmp) as i64;
            let jm = ((1.0 - tp) * tmp) as i64;
            let ir = jp + jm + 1;
            let ip = ((tt * ir as f64) as i64).min(4 * ir - 1);
            if z > 0.0 {
                (2 * ir * (ir - 1) + ip) as u64
            } else {
                (12 * n * n - 2 * ir * (ir + 1) + ip) as u64
            }
        }
    }

    /// Centre of pixel `pix`.
    pub fn pix2pos(&self, pix: usize) -> SkyPos {
        let (z, phi) = self.pix2zphi(pix as u64);
        SkyPos::from_theta_phi(z.clamp(-1.0, 1.0).acos(), phi)
    }

    /// Pixel containing `pos`.
    pub fn ang2pix(&self, pos: &SkyPos) -> usize {
        let z = pos.dec().to_radians().sin();
        self.zphi2pix(z, pos.phi()) as usize
    }

    /// Geometry of ring `ring` (`1..=4·nside-1`).
    pub fn ring_info(&self, ring: usize) -> RingInfo {
        let n = self.nside;
        let ring = ring as u64;
        let npix = 12 * n * n;
        let fact2 = 4.0 / npix as f64;
        let fact1 = (2 * n) as f64 * fact2;
        let northring = if ring > 2 * n { 4 * n - ring } else { ring };

        let (mut z, ringpix, shifted, mut start) = if northring < n {
            let z = 1.0 - (northring * northring) as f64 * fact2;
            (z, 4 * northring, true, 2 * northring * (northring - 1))
        } else {
            let z = (2 * n - northring) as f64 * fact1;
            let shifted = (northring - n) & 1 == 0;
            (z, 4 * n, shifted, self.ncap() + (northring - n) * 4 * n)
        };
        if northring != ring {
            z = -z;
            start = npix - start - ringpix;
        }
        RingInfo { start: start as usize, npix: ringpix as usize, z, shifted }
    }

    /// Index of the ring at or just north of `z = cos(theta)`; 0 above the first ring.
    fn ring_above(&self, z: f64) -> i64 {
        let n = self.nside as f64;
        let az = z.abs();
        if az <= 2.0 / 3.0 {
            return (n * (2.0 - 1.5 * z)) as i64;
        }
        let iring = (n * (3.0 * (1.0 - az)).sqrt()) as i64;
        if z > 0.0 { iring } else { 4 * self.nside as i64 - iring - 1 }
    }

    /// Pixels whose centres lie within `radius_deg` of `center`.
    ///
    /// A radius of 180° or more selects the whole sphere.
    pub fn query_disc(&self, center: &SkyPos, radius_deg: f64) -> PixelSet {
        if radius_deg >= 180.0 {
            return PixelSet::full(self.npix());
        }
        if radius_deg < 0.0 {
            return PixelSet::new();
        }
        let r = radius_deg.to_radians();
        let cosr = r.cos();
        let theta0 = center.theta();
        let phi0 = center.phi();
        let (s0, z0) = theta0.sin_cos();
        let v0 = *center.vector();

        let z_top = (theta0 - r).max(0.0).cos();
        let z_bot = (theta0 + r).min(PI).cos();
        let last_ring = self.n_rings() as i64;
        let ring1 = self.ring_above(z_top).max(1);
        let ring2 = (self.ring_above(z_bot) + 1).min(last_ring);

        let mut out = Vec::new();
        for ring in ring1..=ring2 {
            let info = self.ring_info(ring as usize);
            let z = info.z;
            let s = (1.0 - z * z).max(0.0).sqrt();
            let step = TAU / info.npix as f64;
            let offset = if info.shifted { 0.5 } else { 0.0 };

            // candidate longitude window, None = whole ring
            let denom = s * s0;
            let window = if denom <= 0.0 {
                None
            } else {
                let x = (cosr - z * z0) / denom;
                if x > 1.0 {
                    continue;
                }
                if x <= -1.0 {
                    None
                } else {
                    let dphi = x.acos();
                    let lo = ((phi0 - dphi) / step - offset).floor() as i64 - 1;
                    let hi = ((phi0 + dphi) / step - offset).ceil() as i64 + 1;
                    if hi - lo + 1 >= info.npix as i64 { None } else { Some((lo, hi)) }
                }
            };
            let (lo, hi) = window.unwrap_or((0, info.npix as i64 - 1));
            for k in lo..=hi {
                let k = k.rem_euclid(info.npix as i64) as usize;
                let phi = (k as f64 + offset) * step;
                let v = Vector3::new(s * phi.cos(), s * phi.sin(), z);
                if v.dot(&v0) >= cosr {
                    out.push(info.start + k);
                }
            }
        }
        PixelSet::from_vec(out)
    }

    /// Pixels whose centres lie inside the convex spherical polygon `vertices`.
    ///
    /// Edges are great-circle arcs between consecutive vertices; either
    /// winding order is accepted.
    pub fn query_polygon(&self, vertices: &[SkyPos]) -> Result<PixelSet> {
        let nv = vertices.len();
        if nv < 3 {
            return Err(Error::Validation(format!(
                "polygon needs at least 3 vertices, got {nv}"
            )));
        }
        let centroid: Vector3<f64> = vertices.iter().map(|v| *v.vector()).sum();
        if centroid.norm() < 1e-12 {
            return Err(Error::Validation("degenerate polygon (zero centroid)".to_string()));
        }
        let centroid = centroid.normalize();

        let mut normals = Vec::with_capacity(nv);
        for i in 0..nv {
            let a = vertices[i].vector();
            let b = vertices[(i + 1) % nv].vector();
            let nrm = a.cross(b);
            if nrm.norm() < 1e-12 {
                return Err(Error::Validation(format!("degenerate polygon edge at vertex {i}")));
            }
            normals.push(nrm.normalize());
        }
        let sign = if normals[0].dot(&centroid) >= 0.0 { 1.0 } else { -1.0 };
        for nrm in normals.iter_mut() {
            *nrm *= sign;
        }
        for (i, nrm) in normals.iter().enumerate() {
            for (j, v) in vertices.iter().enumerate() {
                if j == i || j == (i + 1) % nv {
                    continue;
                }
                if nrm.dot(v.vector()) < -1e-10 {
                    return Err(Error::Validation(format!(
                        "polygon is not convex (vertex {j} outside edge {i})"
                    )));
                }
            }
        }

        let center = SkyPos::from_vector(&centroid);
        let radius = vertices.iter().map(|v| center.angle(v)).fold(0.0, f64::max);
        let candidates = self.query_disc(&center, radius + 1e-9);
        Ok(candidates.filter(|pix| {
            let p = self.pix2pos(pix);
            normals.iter().all(|nrm| nrm.dot(p.vector()) >= 0.0)
        }))
    }
}
