//! # gf-sky
//!
//! Sky geometry for gammafit: HEALPix RING pixelization, partial sky maps,
//! regions of interest, the Galactic frame and analysis-bin lists.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Analysis-bin names and lists.
pub mod bins;
/// Per-bin on/background maps.
pub mod collection;
/// Equatorial/Galactic rotation.
pub mod frame;
/// HEALPix RING pixelization.
pub mod healpix;
/// Pixel index sets.
pub mod pixels;
/// Regions of interest.
pub mod roi;
/// Sky positions.
pub mod skypos;
/// Partial sky maps.
pub mod skymap;

pub use bins::{BinList, BinName, bin_index_to_name, pad_bin_name};
pub use collection::{BinMaps, BinMapsSpec, SkyMapCollection, SkyMapCollectionSpec};
pub use frame::GalacticFrame;
pub use healpix::{Healpix, RingInfo};
pub use pixels::PixelSet;
pub use roi::{Roi, SkyBox};
pub use skymap::SkyMap;
pub use skypos::SkyPos;
