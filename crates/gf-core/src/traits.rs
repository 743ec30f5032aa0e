//! Handles to externally owned parameters.
//!
//! The internal nuisance fit may vary parameters that live outside the
//! likelihood kernel (a detector-response PSF width scale, a spectral
//! shape parameter). They are reached through [`Tunable`], addressed by
//! function + index, and every mutation bumps a version counter so that
//! caches depending on them can be invalidated explicitly.

use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A function with indexable, externally settable parameters.
pub trait Tunable: Send + Sync {
    /// Function name (used to build minimizer parameter names)
    fn name(&self) -> &str;

    /// Number of parameters
    fn n_parameters(&self) -> usize;

    /// Name of parameter `index`
    fn parameter_name(&self, index: usize) -> Result<String>;

    /// Current value of parameter `index`
    fn parameter(&self, index: usize) -> Result<f64>;

    /// Current error estimate of parameter `index` (0 if unknown)
    fn parameter_error(&self, index: usize) -> Result<f64>;

    /// Set parameter `index`
    fn set_parameter(&self, index: usize, value: f64) -> Result<()>;

    /// Set the error estimate of parameter `index`
    fn set_parameter_error(&self, index: usize, error: f64) -> Result<()>;

    /// Monotonic counter bumped on every value change
    fn version(&self) -> u64;
}

#[derive(Debug)]
struct Slot {
    value: f64,
    error: f64,
}

#[derive(Debug)]
struct Inner {
    name: String,
    names: Vec<String>,
    slots: RwLock<Vec<Slot>>,
    version: AtomicU64,
}

/// Thread-safe, cheaply clonable parameter block implementing [`Tunable`].
///
/// Clones share state: a value set through one clone is seen by all.
#[derive(Debug, Clone)]
pub struct SharedParameters {
    inner: Arc<Inner>,
}

impl SharedParameters {
    /// Create a block from `(name, initial value)` pairs
    pub fn new(name: impl Into<String>, params: &[(&str, f64)]) -> Self {
        let names = params.iter().map(|(n, _)| (*n).to_string()).collect();
        let slots = params.iter().map(|&(_, value)| Slot { value, error: 0.0 }).collect();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                names,
                slots: RwLock::new(slots),
                version: AtomicU64::new(0),
            }),
        }
    }

    /// Snapshot of all values
    pub fn values(&self) -> Result<Vec<f64>> {
        let slots = self.read()?;
        Ok(slots.iter().map(|s| s.value).collect())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<Slot>>> {
        self.inner
            .slots
            .read()
            .map_err(|_| Error::Computation(format!("parameter block '{}' poisoned", self.name())))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Slot>>> {
        self.inner
            .slots
            .write()
            .map_err(|_| Error::Computation(format!("parameter block '{}' poisoned", self.name())))
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.inner.names.len() {
            return Err(Error::Validation(format!(
                "parameter index {index} out of range for '{}' ({} parameters)",
                self.inner.name,
                self.inner.names.len()
            )));
        }
        Ok(())
    }
}

impl Tunable for SharedParameters {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn n_parameters(&self) -> usize {
        self.inner.names.len()
    }

    fn parameter_name(&self, index: usize) -> Result<String> {
        self.check_index(index)?;
        Ok(format!("{}.{}", self.inner.name, self.inner.names[index]))
    }

    fn parameter(&self, index: usize) -> Result<f64> {
        self.check_index(index)?;
        Ok(self.read()?[index].value)
    }

    fn parameter_error(&self, index: usize) -> Result<f64> {
        self.check_index(index)?;
        Ok(self.read()?[index].error)
    }

    fn set_parameter(&self, index: usize, value: f64) -> Result<()> {
        self.check_index(index)?;
        if !value.is_finite() {
            return Err(Error::Validation(format!(
                "non-finite value {value} for {}",
                self.parameter_name(index)?
            )));
        }
        let mut slots = self.write()?;
        if slots[index].value != value {
            slots[index].value = value;
            self.inner.version.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    fn set_parameter_error(&self, index: usize, error: f64) -> Result<()> {
        self.check_index(index)?;
        self.write()?[index].error = error;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_parameters_version_bumps_on_change_only() {
        let p = SharedParameters::new("psf", &[("width_scale", 1.0)]);
        let v0 = p.version();
        p.set_parameter(0, 1.0).unwrap();
        assert_eq!(p.version(), v0);
        p.set_parameter(0, 1.2).unwrap();
        assert_eq!(p.version(), v0 + 1);
        assert_eq!(p.parameter(0).unwrap(), 1.2);
    }

    #[test]
    fn test_shared_parameters_clones_share_state() {
        let a = SharedParameters::new("spec", &[("index", 2.6), ("norm", 1e-11)]);
        let b = a.clone();
        b.set_parameter(1, 2e-11).unwrap();
        assert_eq!(a.parameter(1).unwrap(), 2e-11);
        assert_eq!(a.parameter_name(0).unwrap(), "spec.index");
        assert_eq!(a.values().unwrap(), vec![2.6, 2e-11]);
    }

    #[test]
    fn test_shared_parameters_rejects_bad_index_and_nan() {
        let p = SharedParameters::new("f", &[("x", 0.0)]);
        assert!(p.parameter(3).is_err());
        assert!(p.set_parameter(0, f64::NAN).is_err());
        p.set_parameter_error(0, 0.5).unwrap();
        assert_eq!(p.parameter_error(0).unwrap(), 0.5);
    }
}
