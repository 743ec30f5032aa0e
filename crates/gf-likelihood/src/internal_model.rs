//! Global nuisance-parameter state shared by all bins.

use crate::background::BackgroundModel;
use gf_core::{Result, Tunable};
use std::fmt;
use std::sync::Arc;

/// One externally owned parameter varied by the internal fit.
#[derive(Clone)]
pub struct FreeParameter {
    /// Function owning the parameter
    pub function: Arc<dyn Tunable>,
    /// Parameter index within the function
    pub index: usize,
}

impl FreeParameter {
    /// Handle to parameter `index` of `function`
    pub fn new(function: Arc<dyn Tunable>, index: usize) -> Self {
        Self { function, index }
    }

    /// Full name (`function.parameter`)
    pub fn name(&self) -> Result<String> {
        self.function.parameter_name(self.index)
    }

    /// Current value
    pub fn value(&self) -> Result<f64> {
        self.function.parameter(self.index)
    }

    /// Set the value
    pub fn set_value(&self, value: f64) -> Result<()> {
        self.function.set_parameter(self.index, value)
    }

    /// Current error estimate
    pub fn error(&self) -> Result<f64> {
        self.function.parameter_error(self.index)
    }

    /// Set the error estimate
    pub fn set_error(&self, error: f64) -> Result<()> {
        self.function.set_parameter_error(self.index, error)
    }
}

impl fmt::Debug for FreeParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeParameter").field("function", &self.function.name()).field("index", &self.index).finish()
    }
}

/// Common normalization, background prototype and extra free parameters.
///
/// The source signal in every bin is `common_norm × (detector response ⊗
/// source model)`; the background is either the data's background map or
/// the background model fit per bin.
#[derive(Debug, Clone)]
pub struct InternalModel {
    common_norm: f64,
    common_norm_error: f64,
    common_norm_free: bool,
    background_norm_free: bool,
    background_model: Option<BackgroundModel>,
    free_parameters: Vec<FreeParameter>,
    detector_response_free: bool,
    fit_log_level: log::Level,
}

impl Default for InternalModel {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl InternalModel {
    /// Background from data; choose which norms the internal fit varies.
    pub fn new(common_norm_free: bool, background_norm_free: bool) -> Self {
        Self {
            common_norm: 1.0,
            common_norm_error: 1.0,
            common_norm_free,
            background_norm_free,
            background_model: None,
            free_parameters: Vec::new(),
            detector_response_free: false,
            fit_log_level: log::Level::Debug,
        }
    }

    /// Same, with a background model fit in every bin.
    pub fn with_background_model(
        background_model: BackgroundModel,
        common_norm_free: bool,
        background_norm_free: bool,
    ) -> Self {
        Self { background_model: Some(background_model), ..Self::new(common_norm_free, background_norm_free) }
    }

    /// Scale applied to all source signal
    pub fn common_norm(&self) -> f64 {
        self.common_norm
    }

    /// Set the common normalization
    pub fn set_common_norm(&mut self, value: f64) {
        self.common_norm = value;
    }

    /// Error estimate of the common normalization
    pub fn common_norm_error(&self) -> f64 {
        self.common_norm_error
    }

    /// Set the common normalization error
    pub fn set_common_norm_error(&mut self, error: f64) {
        self.common_norm_error = error;
    }

    /// Whether the internal fit varies the common normalization
    pub fn is_common_norm_free(&self) -> bool {
        self.common_norm_free
    }

    /// Switch the common-normalization fit
    pub fn set_common_norm_free(&mut self, free: bool) {
        self.common_norm_free = free;
    }

    /// Whether the internal fit varies one background norm per bin
    pub fn is_background_norm_free(&self) -> bool {
        self.background_norm_free
    }

    /// Switch the background-normalization fit
    pub fn set_background_norm_free(&mut self, free: bool) {
        self.background_norm_free = free;
    }

    /// Use each bin's background map directly.
    pub fn use_background_from_data(&mut self) {
        self.background_model = None;
    }

    /// Fit `model` to the background map of every bin.
    pub fn set_background_model(&mut self, model: BackgroundModel) {
        self.background_model = Some(model);
    }

    /// Background prototype, if any
    pub fn background_model(&self) -> Option<&BackgroundModel> {
        self.background_model.as_ref()
    }

    /// Register an external free parameter.
    ///
    /// `detector_response_free` marks parameters that change the detector
    /// response; the internal fit then re-reads every source response at each
    /// step. Other parameters only trigger a re-read when the source model's
    /// versions change.
    pub fn add_free_parameter(
        &mut self,
        function: Arc<dyn Tunable>,
        index: usize,
        detector_response_free: bool,
    ) -> Result<()> {
        let name = function.parameter_name(index)?;
        log::debug!("internal free parameter {name} (detector response: {detector_response_free})");
        self.free_parameters.push(FreeParameter::new(function, index));
        self.detector_response_free |= detector_response_free;
        Ok(())
    }

    /// Drop all external free parameters.
    pub fn clear_free_parameters(&mut self) {
        self.free_parameters.clear();
        self.detector_response_free = false;
    }

    /// External free parameters
    pub fn free_parameters(&self) -> &[FreeParameter] {
        &self.free_parameters
    }

    /// Whether any free parameter changes the detector response
    pub fn is_detector_response_free(&self) -> bool {
        self.detector_response_free
    }

    /// Log level of internal-fit progress messages
    pub fn fit_log_level(&self) -> log::Level {
        self.fit_log_level
    }

    /// Set the log level of internal-fit progress messages
    pub fn set_fit_log_level(&mut self, level: log::Level) {
        self.fit_log_level = level;
    }
}
