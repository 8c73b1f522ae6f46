use crate::types::{BandStatistics, Crs, DataType, GeoTransform, GrimpError, GrimpResult};
use gdal::{Dataset, Metadata};
use ndarray::Array2;
use std::sync::{Arc, Mutex};

/// Pixel window `(row, col)` origin and `(rows, cols)` size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

impl PixelWindow {
    pub fn new(row: usize, col: usize, rows: usize, cols: usize) -> Self {
        Self { row, col, rows, cols }
    }
}

/// Per-band raster metadata
#[derive(Debug, Clone, PartialEq)]
pub struct BandInfo {
    pub data_type: DataType,
    pub no_data: Option<f64>,
    /// Statistics cached in the file, valid only for this file
    pub statistics: Option<BandStatistics>,
}

/// Grid and band metadata of an opened raster
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub geo_transform: GeoTransform,
    pub crs: Option<Crs>,
    pub bands: Vec<BandInfo>,
}

impl RasterInfo {
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Promoted data type over all bands
    pub fn data_type(&self) -> DataType {
        self.bands
            .iter()
            .map(|b| b.data_type)
            .reduce(DataType::promote)
            .unwrap_or(DataType::Float64)
    }
}

/// A raster whose pixels are read on demand
pub trait RasterSource: Send + Sync {
    fn info(&self) -> &RasterInfo;

    /// Read `window` of 1-based `band` as rows x cols
    fn read_window(&self, band: usize, window: PixelWindow) -> GrimpResult<Array2<f64>>;

    /// Identifier used in log messages
    fn describe(&self) -> String;
}

/// Opens a path or URL as a chunked raster
pub trait RasterOpener: Send + Sync {
    fn open(&self, href: &str) -> GrimpResult<Arc<dyn RasterSource>>;
}

/// Path GDAL should open for `href`: remote URLs go through `/vsicurl/` with
/// directory listing disabled
pub fn gdal_path(href: &str) -> String {
    if href.starts_with("https://") || href.starts_with("http://") {
        format!("/vsicurl/?list_dir=no&url={}", href)
    } else {
        href.to_string()
    }
}

/// GDAL-backed raster, dataset handle kept open for later reads
pub struct GdalRaster {
    href: String,
    info: RasterInfo,
    dataset: Mutex<Dataset>,
}

impl GdalRaster {
    /// Open the dataset and read its header; no pixels are read
    pub fn open(href: &str) -> GrimpResult<Self> {
        let path = gdal_path(href);
        log::debug!("Opening raster {}", path);

        let dataset = Dataset::open(&path)?;
        let info = Self::read_info(&dataset)?;

        log::debug!(
            "Raster {}: {}x{} pixels, {} band(s), {}",
            href,
            info.width,
            info.height,
            info.band_count(),
            info.data_type()
        );

        Ok(Self {
            href: href.to_string(),
            info,
            dataset: Mutex::new(dataset),
        })
    }

    fn read_info(dataset: &Dataset) -> GrimpResult<RasterInfo> {
        let (width, height) = dataset.raster_size();
        let geo_transform = dataset.geo_transform()?;

        let crs = match dataset.spatial_ref() {
            Ok(srs) => Some(Crs {
                wkt: srs.to_wkt().ok(),
                epsg: srs.auth_code().ok().map(|code| code as u32),
            }),
            Err(e) => {
                log::debug!("No spatial reference: {}", e);
                None
            }
        };

        let band_count = dataset.raster_count();
        let mut bands = Vec::with_capacity(band_count.max(0) as usize);
        for index in 1..=band_count {
            let band = dataset.rasterband(index)?;
            let type_name = format!("{:?}", band.band_type());
            let data_type = DataType::parse(&type_name).ok_or_else(|| {
                GrimpError::InvalidFormat(format!("Unsupported band type {}", type_name))
            })?;
            bands.push(BandInfo {
                data_type,
                no_data: band.no_data_value(),
                statistics: cached_statistics(&band),
            });
        }

        Ok(RasterInfo {
            width,
            height,
            geo_transform,
            crs,
            bands,
        })
    }
}

/// Statistics GDAL keeps in the band metadata, if computed by the producer
fn cached_statistics(band: &gdal::raster::RasterBand) -> Option<BandStatistics> {
    let item = |key: &str| {
        band.metadata_item(key, "")
            .and_then(|value| value.trim().parse::<f64>().ok())
    };
    Some(BandStatistics {
        minimum: item("STATISTICS_MINIMUM")?,
        maximum: item("STATISTICS_MAXIMUM")?,
        mean: item("STATISTICS_MEAN")?,
        stddev: item("STATISTICS_STDDEV")?,
        valid_percent: item("STATISTICS_VALID_PERCENT").unwrap_or(100.0),
    })
}

impl RasterSource for GdalRaster {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_window(&self, band: usize, window: PixelWindow) -> GrimpResult<Array2<f64>> {
        let dataset = self
            .dataset
            .lock()
            .map_err(|_| GrimpError::Processing(format!("Dataset lock poisoned: {}", self.href)))?;
        let rasterband = dataset.rasterband(band as isize)?;
        let buffer = rasterband.read_as::<f64>(
            (window.col as isize, window.row as isize),
            (window.cols, window.rows),
            (window.cols, window.rows),
            None,
        )?;

        Array2::from_shape_vec((window.rows, window.cols), buffer.data)
            .map_err(|e| GrimpError::Processing(format!("Failed to reshape window of {}: {}", self.href, e)))
    }

    fn describe(&self) -> String {
        self.href.clone()
    }
}

/// Opens references with GDAL
#[derive(Debug, Clone, Copy, Default)]
pub struct GdalOpener;

impl RasterOpener for GdalOpener {
    fn open(&self, href: &str) -> GrimpResult<Arc<dyn RasterSource>> {
        Ok(Arc::new(GdalRaster::open(href)?))
    }
}

/// Raster opened on first read, described until then by template metadata
pub struct DeferredRaster {
    href: String,
    info: RasterInfo,
    opener: Arc<dyn RasterOpener>,
    opened: Mutex<Option<Arc<dyn RasterSource>>>,
}

impl DeferredRaster {
    pub fn new(href: impl Into<String>, info: RasterInfo, opener: Arc<dyn RasterOpener>) -> Self {
        Self {
            href: href.into(),
            info,
            opener,
            opened: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened.lock().map(|o| o.is_some()).unwrap_or(false)
    }

    fn source(&self) -> GrimpResult<Arc<dyn RasterSource>> {
        let mut opened = self
            .opened
            .lock()
            .map_err(|_| GrimpError::Processing(format!("Deferred raster lock poisoned: {}", self.href)))?;
        if let Some(source) = opened.as_ref() {
            return Ok(Arc::clone(source));
        }

        let source = self.opener.open(&self.href)?;
        let actual = source.info();
        if actual.width != self.info.width || actual.height != self.info.height {
            return Err(GrimpError::MisalignedGrid(format!(
                "{} is {}x{}, template metadata says {}x{}",
                self.href, actual.width, actual.height, self.info.width, self.info.height
            )));
        }
        *opened = Some(Arc::clone(&source));
        Ok(source)
    }
}

impl RasterSource for DeferredRaster {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_window(&self, band: usize, window: PixelWindow) -> GrimpResult<Array2<f64>> {
        self.source()?.read_window(band, window)
    }

    fn describe(&self) -> String {
        self.href.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gdal_path_wraps_remote() {
        assert_eq!(
            gdal_path("https://n5eil01u.ecs.nsidc.org/a/b_vv.tif"),
            "/vsicurl/?list_dir=no&url=https://n5eil01u.ecs.nsidc.org/a/b_vv.tif"
        );
        assert_eq!(gdal_path("/data/b_vv.tif"), "/data/b_vv.tif");
    }

    #[test]
    fn test_missing_local_file() {
        let result = GdalRaster::open("/nonexistent/dir/A_B_C_D_01Jan21_15Jan21_vv.tif");
        assert!(matches!(result, Err(GrimpError::Gdal(_))));
    }
}
