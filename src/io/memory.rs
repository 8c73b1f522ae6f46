//! In-memory rasters
//!
//! Used to wrap already-materialized arrays as plane sources, and as an
//! opener over a fixed set of named rasters (staged downloads, tests).

use crate::io::raster::{BandInfo, PixelWindow, RasterInfo, RasterOpener, RasterSource};
use crate::types::{Crs, DataType, GeoTransform, GrimpError, GrimpResult};
use ndarray::{s, Array2, Array3};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Raster held as a `(band, y, x)` array
pub struct InMemoryRaster {
    name: String,
    info: RasterInfo,
    data: Array3<f64>,
}

impl InMemoryRaster {
    pub fn new(name: impl Into<String>, data: Array3<f64>, geo_transform: GeoTransform, crs: Option<Crs>, data_type: DataType) -> Self {
        let (bands, height, width) = data.dim();
        let info = RasterInfo {
            width,
            height,
            geo_transform,
            crs,
            bands: vec![
                BandInfo {
                    data_type,
                    no_data: None,
                    statistics: None,
                };
                bands
            ],
        };
        Self {
            name: name.into(),
            info,
            data,
        }
    }

    /// Single-band raster
    pub fn from_plane(name: impl Into<String>, plane: Array2<f64>, geo_transform: GeoTransform, crs: Option<Crs>, data_type: DataType) -> Self {
        let plane = plane.insert_axis(ndarray::Axis(0));
        Self::new(name, plane, geo_transform, crs, data_type)
    }

    pub fn with_no_data(mut self, no_data: f64) -> Self {
        for band in &mut self.info.bands {
            band.no_data = Some(no_data);
        }
        self
    }
}

impl RasterSource for InMemoryRaster {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_window(&self, band: usize, window: PixelWindow) -> GrimpResult<Array2<f64>> {
        if band == 0 || band > self.info.band_count() {
            return Err(GrimpError::Processing(format!(
                "{}: band {} out of range 1..={}",
                self.name,
                band,
                self.info.band_count()
            )));
        }
        if window.row + window.rows > self.info.height || window.col + window.cols > self.info.width {
            return Err(GrimpError::Processing(format!(
                "{}: window {:?} outside {}x{} raster",
                self.name, window, self.info.width, self.info.height
            )));
        }
        Ok(self
            .data
            .slice(s![
                band - 1,
                window.row..window.row + window.rows,
                window.col..window.col + window.cols
            ])
            .to_owned())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Opener over registered in-memory rasters
#[derive(Default)]
pub struct MemoryOpener {
    rasters: HashMap<String, Arc<InMemoryRaster>>,
    latency: HashMap<String, Duration>,
    opens: AtomicUsize,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, href: impl Into<String>, raster: InMemoryRaster) {
        self.rasters.insert(href.into(), Arc::new(raster));
    }

    /// Delay opens of `href`, simulating a slow remote server
    pub fn set_latency(&mut self, href: impl Into<String>, latency: Duration) {
        self.latency.insert(href.into(), latency);
    }

    /// Number of successful opens so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl RasterOpener for MemoryOpener {
    fn open(&self, href: &str) -> GrimpResult<Arc<dyn RasterSource>> {
        if let Some(latency) = self.latency.get(href) {
            std::thread::sleep(*latency);
        }
        let raster = self.rasters.get(href).ok_or_else(|| {
            GrimpError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("File not found: {}", href),
            ))
        })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(raster) as Arc<dyn RasterSource>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_read_window() {
        let data = Array::from_shape_vec((1, 3, 4), (0..12).map(|v| v as f64).collect()).unwrap();
        let raster = InMemoryRaster::new("mem", data, [0.0, 1.0, 0.0, 3.0, 0.0, -1.0], None, DataType::Float32);
        let window = raster.read_window(1, PixelWindow::new(1, 2, 2, 2)).unwrap();
        assert_eq!(window, ndarray::arr2(&[[6.0, 7.0], [10.0, 11.0]]));

        assert!(raster.read_window(2, PixelWindow::new(0, 0, 1, 1)).is_err());
        assert!(raster.read_window(1, PixelWindow::new(2, 0, 2, 1)).is_err());
    }

    #[test]
    fn test_opener_counts_opens() {
        let mut opener = MemoryOpener::new();
        opener.insert(
            "a.tif",
            InMemoryRaster::from_plane("a", Array2::zeros((2, 2)), [0.0, 1.0, 0.0, 2.0, 0.0, -1.0], None, DataType::UInt8),
        );
        assert!(opener.open("a.tif").is_ok());
        assert!(matches!(opener.open("b.tif"), Err(GrimpError::Io(_))));
        assert_eq!(opener.open_count(), 1);
    }
}
