//! Raster and container I/O

pub mod memory;
pub mod netcdf_store;
pub mod raster;

pub use memory::{InMemoryRaster, MemoryOpener};
pub use netcdf_store::{export_netcdf, reload, NetcdfVariableSource};
pub use raster::{DeferredRaster, GdalOpener, GdalRaster, PixelWindow, RasterInfo, RasterOpener, RasterSource};
