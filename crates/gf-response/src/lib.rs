//! # gf-response
//!
//! Detector response tables and the expected signal of point and extended
//! sources: spectra, PSFs and their smearing profiles, declination-band
//! interpolation and FFT convolution of extended templates.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Tangent grids and Gaussian FFT convolution.
pub mod convolve;
/// Detector response tables.
pub mod detector;
/// Extended-source responses.
pub mod extended;
/// Source-model interface and an in-memory catalog.
pub mod model;
/// Point-source responses.
pub mod point;
/// Point-spread functions.
pub mod psf;
/// Power-law spectra.
pub mod spectrum;

pub use convolve::{ConvolutionConfig, ConvolutionWorkspace, GaussianComponent, TangentGrid};
pub use detector::{
    DecBand, DecBandSpec, DecInterpolation, DetectorResponse, DetectorResponseSpec, PSF_WIDTH_SCALE,
    ResponseBin, ResponseBinSpec,
};
pub use extended::{ExtendedSourceResponse, ExtendedUpdate};
pub use model::{
    ExtendedSource, ModelVersions, Morphology, PointSource, SourceCatalog, SourceCatalogSpec, SourceModel,
};
pub use point::PointSourceResponse;
pub use psf::{PSF_LIMIT_DEG, Psf, SmearingProfile};
pub use spectrum::LogLogSpectrum;
