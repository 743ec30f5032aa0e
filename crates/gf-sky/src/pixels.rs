//! Sorted, de-duplicated sets of pixel indices.

use std::ops::BitAnd;

/// An ordered set of pixel indices.
///
/// Construction sorts and de-duplicates, so two sets built from the same
/// pixels in any order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PixelSet {
    pixels: Vec<usize>,
}

impl PixelSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from any collection of indices.
    pub fn from_vec(mut pixels: Vec<usize>) -> Self {
        pixels.sort_unstable();
        pixels.dedup();
        Self { pixels }
    }

    /// All indices `0..n`
    pub fn full(n: usize) -> Self {
        Self { pixels: (0..n).collect() }
    }

    /// Number of pixels
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Membership test
    pub fn contains(&self, pix: usize) -> bool {
        self.pixels.binary_search(&pix).is_ok()
    }

    /// Position of `pix` in ascending order, if present
    pub fn position(&self, pix: usize) -> Option<usize> {
        self.pixels.binary_search(&pix).ok()
    }

    /// Ascending iterator
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.pixels.iter().copied()
    }

    /// Sorted slice view
    pub fn as_slice(&self) -> &[usize] {
        &self.pixels
    }

    /// Whether every pixel of `self` is in `other`
    pub fn is_subset(&self, other: &PixelSet) -> bool {
        self.first_missing_from(other).is_none()
    }

    /// First pixel of `self` that is not in `other`
    pub fn first_missing_from(&self, other: &PixelSet) -> Option<usize> {
        self.iter().find(|&p| !other.contains(p))
    }

    /// Set union
    pub fn union(&self, other: &PixelSet) -> PixelSet {
        let mut out = Vec::with_capacity(self.len() + other.len());
        let (mut i, mut j) = (0, 0);
        let (a, b) = (&self.pixels, &other.pixels);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => {
                    out.push(a[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(b[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(a[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&a[i..]);
        out.extend_from_slice(&b[j..]);
        PixelSet { pixels: out }
    }

    /// Set intersection
    pub fn intersection(&self, other: &PixelSet) -> PixelSet {
        PixelSet { pixels: self.iter().filter(|&p| other.contains(p)).collect() }
    }

    /// Keep the pixels for which `keep` returns true
    pub fn filter(&self, mut keep: impl FnMut(usize) -> bool) -> PixelSet {
        PixelSet { pixels: self.iter().filter(|&p| keep(p)).collect() }
    }
}

impl FromIterator<usize> for PixelSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl BitAnd for &PixelSet {
    type Output = PixelSet;

    fn bitand(self, rhs: Self) -> PixelSet {
        self.intersection(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent() {
        let a = PixelSet::from_vec(vec![5, 1, 3, 3]);
        let b: PixelSet = [3, 5, 1].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.as_slice(), &[1, 3, 5]);
    }

    #[test]
    fn test_set_operations() {
        let a = PixelSet::from_vec(vec![1, 2, 3, 7]);
        let b = PixelSet::from_vec(vec![2, 3, 4]);
        assert_eq!(a.union(&b).as_slice(), &[1, 2, 3, 4, 7]);
        assert_eq!((&a & &b).as_slice(), &[2, 3]);
        assert!(PixelSet::from_vec(vec![2, 3]).is_subset(&a));
        assert_eq!(b.first_missing_from(&a), Some(4));
        assert_eq!(a.position(7), Some(3));
    }
}
