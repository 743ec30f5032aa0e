//! Analysis-bin enumeration.

use gf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::BitAnd;

/// Name of an analysis bin
pub type BinName = String;

/// Name of the bin with numeric index `i`.
pub fn bin_index_to_name(i: usize) -> BinName {
    i.to_string()
}

/// Zero-pad purely numeric bin names to two digits (`"3"` -> `"03"`); other names are unchanged.
pub fn pad_bin_name(name: &str) -> BinName {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) {
        format!("{name:0>2}")
    } else {
        name.to_string()
    }
}

/// Ordered list of unique analysis-bin names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<BinName>", into = "Vec<BinName>")]
pub struct BinList {
    names: Vec<BinName>,
}

impl TryFrom<Vec<BinName>> for BinList {
    type Error = Error;

    fn try_from(names: Vec<BinName>) -> Result<Self> {
        Self::from_names(names)
    }
}

impl From<BinList> for Vec<BinName> {
    fn from(list: BinList) -> Self {
        list.names
    }
}

impl BinList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Bins `start..=stop` by index; empty when `start > stop`.
    pub fn from_range(start: usize, stop: usize) -> Self {
        Self { names: (start..=stop).map(bin_index_to_name).collect() }
    }

    /// Bins with the given indices. Duplicates are rejected.
    pub fn from_indices(indices: &[usize]) -> Result<Self> {
        Self::from_names(indices.iter().map(|&i| bin_index_to_name(i)))
    }

    /// Bins with the given names. Duplicates are rejected.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<BinName>,
    {
        let mut list = Self::new();
        for name in names {
            list.append(name)?;
        }
        Ok(list)
    }

    /// Add a bin at the end.
    pub fn append(&mut self, name: impl Into<BinName>) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(Error::Validation(format!("duplicate analysis bin '{name}'")));
        }
        self.names.push(name);
        Ok(())
    }

    /// Membership test
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Bins present in both lists, in the order of `self`.
    pub fn intersection(&self, other: &BinList) -> BinList {
        BinList { names: self.names.iter().filter(|n| other.contains(n)).cloned().collect() }
    }

    /// Number of bins
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Bin names in order
    pub fn iter(&self) -> impl Iterator<Item = &BinName> + '_ {
        self.names.iter()
    }
}

impl BitAnd for &BinList {
    type Output = BinList;

    fn bitand(self, rhs: &BinList) -> BinList {
        self.intersection(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_and_indices() {
        let list = BinList::from_range(1, 9);
        assert_eq!(list.len(), 9);
        assert!(list.contains("1") && list.contains("9"));
        assert!(!list.contains("0"));
        assert!(BinList::from_range(5, 2).is_empty());
        assert!(BinList::from_indices(&[1, 2, 1]).is_err());
    }

    #[test]
    fn test_intersection_keeps_left_order() {
        let a = BinList::from_names(["3", "1", "2"]).unwrap();
        let b = BinList::from_names(["2", "3", "7"]).unwrap();
        let c = &a & &b;
        assert_eq!(c.iter().cloned().collect::<Vec<_>>(), vec!["3", "2"]);
    }

    #[test]
    fn test_bin_names() {
        assert_eq!(bin_index_to_name(4), "4");
        assert_eq!(pad_bin_name("4"), "04");
        assert_eq!(pad_bin_name("10"), "10");
        assert_eq!(pad_bin_name("1c"), "1c");
    }

    #[test]
    fn test_serde_rejects_duplicates() {
        let ok: BinList = serde_json::from_str(r#"["1","2"]"#).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(serde_json::from_str::<BinList>(r#"["1","1"]"#).is_err());
    }
}
