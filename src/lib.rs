//! grimp: assembly of GrIMP raster products into lazy multi-temporal arrays
//!
//! Velocity, SAR backscatter and image mosaics of the Greenland Ice Mapping
//! Project are published as one GeoTIFF per band per time slice. This library
//! groups those files into `(time, band, y, x)` arrays without reading pixels,
//! crops them to a region of interest, and exports the result to NetCDF.

pub mod types;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, Crs, DataType, GeoTransform, GrimpError, GrimpResult, Timestamp, CHUNK_SIZE
};

pub use core::{
    AssemblyStrategy, DataArray, GridSpec, NamingConvention, Subsetter, SubsetterConfig, SubsetterState
};
pub use io::{GdalOpener, MemoryOpener, RasterOpener, RasterSource};
