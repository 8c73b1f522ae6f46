//! Lazily-read `(time, band, y, x)` arrays
//!
//! A `DataArray` carries its coordinates and one plane per `(time, band)`.
//! Planes point into a raster source; pixels are only read when the array is
//! loaded. Subsetting and concatenation rewrite coordinates and plane offsets
//! without touching pixel data.

use crate::io::memory::InMemoryRaster;
use crate::io::raster::{PixelWindow, RasterSource};
use crate::types::{
    BandStatistics, BoundingBox, Crs, DataType, GeoTransform, GrimpError, GrimpResult, Timestamp,
    CHUNK_SIZE,
};
use ndarray::{s, Array2, Array4};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Axis to concatenate along
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatAxis {
    Time,
    Band,
}

/// Coordinates of pixel centres along one axis
pub fn pixel_centers(origin: f64, step: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| origin + (i as f64 + 0.5) * step).collect()
}

/// One `(y, x)` plane backed by a band of a raster source.
///
/// Array row `r` maps to source row `r + row_offset`; pixels falling outside
/// the source take `fill`.
#[derive(Clone)]
pub struct Plane {
    pub source: Arc<dyn RasterSource>,
    pub band: usize,
    pub row_offset: i64,
    pub col_offset: i64,
    pub fill: f64,
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("source", &self.source.describe())
            .field("band", &self.band)
            .field("row_offset", &self.row_offset)
            .field("col_offset", &self.col_offset)
            .finish()
    }
}

impl Plane {
    pub fn new(source: Arc<dyn RasterSource>, band: usize, fill: f64) -> Self {
        Self {
            source,
            band,
            row_offset: 0,
            col_offset: 0,
            fill,
        }
    }

    /// Read `rows x cols` pixels in tiles of `chunk` pixels
    pub fn read(&self, rows: usize, cols: usize, chunk: usize) -> GrimpResult<Array2<f64>> {
        let mut out = Array2::from_elem((rows, cols), self.fill);
        let info = self.source.info();

        let r0 = self.row_offset.max(0);
        let r1 = (self.row_offset + rows as i64).min(info.height as i64);
        let c0 = self.col_offset.max(0);
        let c1 = (self.col_offset + cols as i64).min(info.width as i64);
        if r1 <= r0 || c1 <= c0 {
            return Ok(out);
        }

        let chunk = chunk.max(1) as i64;
        let mut row = r0;
        while row < r1 {
            let tile_rows = (r1 - row).min(chunk);
            let mut col = c0;
            while col < c1 {
                let tile_cols = (c1 - col).min(chunk);
                let window = PixelWindow::new(row as usize, col as usize, tile_rows as usize, tile_cols as usize);
                let tile = self.source.read_window(self.band, window)?;
                let out_row = (row - self.row_offset) as usize;
                let out_col = (col - self.col_offset) as usize;
                out.slice_mut(s![
                    out_row..out_row + tile_rows as usize,
                    out_col..out_col + tile_cols as usize
                ])
                .assign(&tile);
                col += tile_cols;
            }
            row += tile_rows;
        }

        Ok(out)
    }
}

/// Multi-band, multi-temporal raster with deferred pixel access
#[derive(Debug, Clone)]
pub struct DataArray {
    pub name: String,
    pub time: Vec<Timestamp>,
    pub time1: Vec<Option<Timestamp>>,
    pub time2: Vec<Option<Timestamp>>,
    pub band: Vec<String>,
    pub y: Vec<f64>,
    pub x: Vec<f64>,
    /// No-data sentinel per band
    pub fill_value: Vec<f64>,
    /// Source file name per time step
    pub source_names: Vec<String>,
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    pub dtype: DataType,
    pub chunk_size: usize,
    pub attrs: BTreeMap<String, String>,
    /// Planes indexed `[time][band]`
    planes: Vec<Vec<Plane>>,
}

impl DataArray {
    /// Single time-step array from one plane per band
    #[allow(clippy::too_many_arguments)]
    pub fn time_slice(
        name: impl Into<String>,
        times: (Timestamp, Option<Timestamp>, Option<Timestamp>),
        source_name: impl Into<String>,
        band: Vec<String>,
        fill_value: Vec<f64>,
        planes: Vec<Plane>,
        shape: (usize, usize),
        transform: GeoTransform,
        crs: Option<Crs>,
        dtype: DataType,
    ) -> GrimpResult<Self> {
        let (time, time1, time2) = times;
        Self::from_planes(
            name,
            vec![time],
            vec![time1],
            vec![time2],
            vec![source_name.into()],
            band,
            fill_value,
            vec![planes],
            shape,
            transform,
            crs,
            dtype,
        )
    }

    /// Array over `planes[time][band]` on the grid given by `shape = (rows, cols)`
    #[allow(clippy::too_many_arguments)]
    pub fn from_planes(
        name: impl Into<String>,
        time: Vec<Timestamp>,
        time1: Vec<Option<Timestamp>>,
        time2: Vec<Option<Timestamp>>,
        source_names: Vec<String>,
        band: Vec<String>,
        fill_value: Vec<f64>,
        planes: Vec<Vec<Plane>>,
        shape: (usize, usize),
        transform: GeoTransform,
        crs: Option<Crs>,
        dtype: DataType,
    ) -> GrimpResult<Self> {
        let (rows, cols) = shape;
        let n_time = time.len();
        if time1.len() != n_time || time2.len() != n_time || source_names.len() != n_time || planes.len() != n_time {
            return Err(GrimpError::Processing(format!(
                "Time coordinates disagree: {} times, {} planes",
                n_time,
                planes.len()
            )));
        }
        if fill_value.len() != band.len() || planes.iter().any(|p| p.len() != band.len()) {
            return Err(GrimpError::Processing(format!(
                "Band coordinates disagree: {} bands, {} fill values",
                band.len(),
                fill_value.len()
            )));
        }

        Ok(Self {
            name: name.into(),
            time,
            time1,
            time2,
            band,
            y: pixel_centers(transform[3], transform[5], rows),
            x: pixel_centers(transform[0], transform[1], cols),
            fill_value,
            source_names,
            transform,
            crs,
            dtype,
            chunk_size: CHUNK_SIZE,
            attrs: BTreeMap::new(),
            planes,
        })
    }

    /// Wrap a materialized `(time, band, y, x)` array
    pub fn from_array(name: impl Into<String>, data: Array4<f64>, template: &DataArray) -> GrimpResult<Self> {
        let (n_time, n_band, rows, cols) = data.dim();
        if n_time != template.time.len() || n_band != template.band.len() || rows != template.y.len() || cols != template.x.len() {
            return Err(GrimpError::MisalignedGrid(format!(
                "Array of shape {:?} does not match coordinates {:?}",
                data.dim(),
                template.shape()
            )));
        }

        let name = name.into();
        let mut planes = Vec::with_capacity(n_time);
        for t in 0..n_time {
            let cube = data.slice(s![t, .., .., ..]).to_owned();
            let raster = Arc::new(InMemoryRaster::new(
                format!("{}[{}]", name, t),
                cube,
                template.transform,
                template.crs.clone(),
                template.dtype,
            ));
            planes.push(
                (0..n_band)
                    .map(|b| Plane::new(raster.clone() as Arc<dyn RasterSource>, b + 1, template.fill_value[b]))
                    .collect(),
            );
        }

        Ok(Self {
            name,
            planes,
            attrs: BTreeMap::new(),
            ..template.clone()
        })
    }

    /// `(time, band, y, x)`
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.time.len(), self.band.len(), self.y.len(), self.x.len())
    }

    pub fn planes(&self) -> &[Vec<Plane>] {
        &self.planes
    }

    /// Min/max of the x and y coordinate vectors
    pub fn bounds(&self) -> GrimpResult<BoundingBox> {
        let fold = |values: &[f64]| {
            values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
        };
        if self.x.is_empty() || self.y.is_empty() {
            return Err(GrimpError::Processing(format!("Array '{}' has an empty grid", self.name)));
        }
        let (minx, maxx) = fold(&self.x);
        let (miny, maxy) = fold(&self.y);
        Ok(BoundingBox { minx, miny, maxx, maxy })
    }

    /// Keep pixels whose centres fall inside `bbox` (edges included).
    ///
    /// Deferred: only coordinates and plane offsets change.
    pub fn clip_box(&self, bbox: &BoundingBox) -> GrimpResult<DataArray> {
        let inside = |values: &[f64], lo: f64, hi: f64| -> Option<(usize, usize)> {
            let first = values.iter().position(|&v| v >= lo && v <= hi)?;
            let last = values.iter().rposition(|&v| v >= lo && v <= hi)?;
            Some((first, last + 1))
        };
        let (Some((c0, c1)), Some((r0, r1))) = (
            inside(&self.x, bbox.minx, bbox.maxx),
            inside(&self.y, bbox.miny, bbox.maxy),
        ) else {
            return Err(GrimpError::NoDataInBounds(*bbox));
        };

        let mut transform = self.transform;
        transform[0] += c0 as f64 * self.transform[1] + r0 as f64 * self.transform[2];
        transform[3] += c0 as f64 * self.transform[4] + r0 as f64 * self.transform[5];

        let planes = self
            .planes
            .iter()
            .map(|row| {
                row.iter()
                    .map(|plane| Plane {
                        row_offset: plane.row_offset + r0 as i64,
                        col_offset: plane.col_offset + c0 as i64,
                        ..plane.clone()
                    })
                    .collect()
            })
            .collect();

        log::debug!(
            "Clipped '{}' to rows {}..{} cols {}..{}",
            self.name, r0, r1, c0, c1
        );

        Ok(DataArray {
            y: self.y[r0..r1].to_vec(),
            x: self.x[c0..c1].to_vec(),
            transform,
            planes,
            ..self.clone()
        })
    }

    /// Concatenate along `axis` with an override join: grids (and the axis not
    /// joined) are taken from the first array, only their lengths must agree.
    /// Attributes are dropped.
    pub fn concat(arrays: Vec<DataArray>, axis: ConcatAxis) -> GrimpResult<DataArray> {
        let mut iter = arrays.into_iter();
        let mut merged = iter
            .next()
            .ok_or_else(|| GrimpError::Processing("Nothing to concatenate".to_string()))?;
        merged.attrs.clear();

        for (index, next) in iter.enumerate() {
            if next.y.len() != merged.y.len() || next.x.len() != merged.x.len() {
                return Err(GrimpError::MisalignedGrid(format!(
                    "Array {} ({}) is {}x{}, expected {}x{}",
                    index + 1,
                    next.source_names.first().map(String::as_str).unwrap_or(next.name.as_str()),
                    next.x.len(),
                    next.y.len(),
                    merged.x.len(),
                    merged.y.len()
                )));
            }
            merged.dtype = merged.dtype.promote(next.dtype);
            match axis {
                ConcatAxis::Time => {
                    if next.band.len() != merged.band.len() {
                        return Err(GrimpError::MisalignedGrid(format!(
                            "Array {} has {} bands, expected {}",
                            index + 1,
                            next.band.len(),
                            merged.band.len()
                        )));
                    }
                    merged.time.extend(next.time);
                    merged.time1.extend(next.time1);
                    merged.time2.extend(next.time2);
                    merged.source_names.extend(next.source_names);
                    merged.planes.extend(next.planes);
                }
                ConcatAxis::Band => {
                    if next.time.len() != merged.time.len() {
                        return Err(GrimpError::MisalignedGrid(format!(
                            "Array {} has {} time steps, expected {}",
                            index + 1,
                            next.time.len(),
                            merged.time.len()
                        )));
                    }
                    merged.band.extend(next.band);
                    merged.fill_value.extend(next.fill_value);
                    for (row, extra) in merged.planes.iter_mut().zip(next.planes) {
                        row.extend(extra);
                    }
                }
            }
        }

        Ok(merged)
    }

    /// Read every plane and return the `(time, band, y, x)` values
    pub fn load(&self) -> GrimpResult<Array4<f64>> {
        let (n_time, n_band, rows, cols) = self.shape();
        log::info!(
            "Materializing '{}': {} time steps, {} bands, {}x{} pixels",
            self.name, n_time, n_band, cols, rows
        );

        let jobs: Vec<(usize, usize, &Plane)> = self
            .planes
            .iter()
            .enumerate()
            .flat_map(|(t, row)| row.iter().enumerate().map(move |(b, plane)| (t, b, plane)))
            .collect();

        let read = |(t, b, plane): (usize, usize, &Plane)| {
            plane
                .read(rows, cols, self.chunk_size)
                .map(|values| (t, b, values))
                .map_err(|e| GrimpError::AssetLoad {
                    reference: plane.source.describe(),
                    source: Box::new(e),
                })
        };

        #[cfg(feature = "parallel")]
        let planes: GrimpResult<Vec<_>> = jobs.into_par_iter().map(read).collect();
        #[cfg(not(feature = "parallel"))]
        let planes: GrimpResult<Vec<_>> = jobs.into_iter().map(read).collect();

        let mut out = Array4::<f64>::zeros((n_time, n_band, rows, cols));
        for (t, b, values) in planes? {
            out.slice_mut(s![t, b, .., ..]).assign(&values);
        }
        Ok(out)
    }

    /// Per-band statistics over all time steps, ignoring no-data and NaN
    pub fn band_statistics(&self) -> GrimpResult<Vec<BandStatistics>> {
        let values = self.load()?;
        let mut stats = Vec::with_capacity(self.band.len());
        for (b, &fill) in self.fill_value.iter().enumerate() {
            let band = values.slice(s![.., b, .., ..]);
            let total = band.len();
            let valid: Vec<f64> = band.iter().copied().filter(|v| !v.is_nan() && *v != fill).collect();
            if valid.is_empty() {
                stats.push(BandStatistics {
                    minimum: f64::NAN,
                    maximum: f64::NAN,
                    mean: f64::NAN,
                    stddev: f64::NAN,
                    valid_percent: 0.0,
                });
                continue;
            }
            let n = valid.len() as f64;
            let mean = valid.iter().sum::<f64>() / n;
            let variance = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            stats.push(BandStatistics {
                minimum: valid.iter().copied().fold(f64::INFINITY, f64::min),
                maximum: valid.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                mean,
                stddev: variance.sqrt(),
                valid_percent: 100.0 * n / total as f64,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ndarray::Array3;

    fn day(d: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2021, 1, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn slice(name: &str, t: u32, values: Array3<f64>) -> DataArray {
        let (n_band, rows, cols) = values.dim();
        let transform = [100.0, 10.0, 0.0, 500.0, 0.0, -10.0];
        let raster: Arc<dyn RasterSource> =
            Arc::new(InMemoryRaster::new(name, values, transform, None, DataType::Float32));
        let planes = (1..=n_band).map(|b| Plane::new(raster.clone(), b, -1.0)).collect();
        DataArray::time_slice(
            "velocity",
            (day(t), Some(day(t)), None),
            name,
            (0..n_band).map(|b| format!("b{}", b)).collect(),
            vec![-1.0; n_band],
            planes,
            (rows, cols),
            transform,
            None,
            DataType::Float32,
        )
        .unwrap()
    }

    fn ramp(n_band: usize, rows: usize, cols: usize, offset: f64) -> Array3<f64> {
        Array3::from_shape_fn((n_band, rows, cols), |(b, r, c)| offset + (b * 100 + r * 10 + c) as f64)
    }

    #[test]
    fn test_coordinates_are_pixel_centres() {
        let array = slice("a", 1, ramp(1, 3, 4, 0.0));
        assert_eq!(array.x, vec![105.0, 115.0, 125.0, 135.0]);
        assert_eq!(array.y, vec![495.0, 485.0, 475.0]);
        let bounds = array.bounds().unwrap();
        assert_eq!(bounds, BoundingBox::new(105.0, 475.0, 135.0, 495.0));
    }

    #[test]
    fn test_clip_is_lazy_and_exact() {
        let array = slice("a", 1, ramp(2, 6, 6, 0.0));
        let clipped = array.clip_box(&BoundingBox::new(115.0, 455.0, 135.0, 480.0)).unwrap();
        assert_eq!(clipped.x, vec![115.0, 125.0, 135.0]);
        assert_eq!(clipped.y, vec![475.0, 465.0, 455.0]);
        assert_eq!(clipped.transform[0], 110.0);
        assert_eq!(clipped.transform[3], 480.0);

        let values = clipped.load().unwrap();
        let full = array.load().unwrap();
        assert_eq!(values.slice(s![.., .., .., ..]), full.slice(s![.., .., 2..5, 1..4]));
    }

    #[test]
    fn test_clip_outside_fails() {
        let array = slice("a", 1, ramp(1, 3, 3, 0.0));
        let err = array.clip_box(&BoundingBox::new(0.0, 0.0, 50.0, 50.0)).unwrap_err();
        assert!(matches!(err, GrimpError::NoDataInBounds(_)));
    }

    #[test]
    fn test_concat_time_override_join() {
        let a = slice("a", 1, ramp(2, 3, 3, 0.0));
        let mut b = slice("b", 3, ramp(2, 3, 3, 1000.0));
        b.x = vec![0.0, 1.0, 2.0];
        b.attrs.insert("history".to_string(), "x".to_string());

        let merged = DataArray::concat(vec![a.clone(), b], ConcatAxis::Time).unwrap();
        assert_eq!(merged.shape(), (2, 2, 3, 3));
        assert_eq!(merged.x, a.x);
        assert_eq!(merged.time, vec![day(1), day(3)]);
        assert_eq!(merged.source_names, vec!["a", "b"]);
        assert!(merged.attrs.is_empty());

        let values = merged.load().unwrap();
        assert_eq!(values[[1, 1, 2, 2]], 1000.0 + 122.0);
    }

    #[test]
    fn test_concat_misaligned_grid() {
        let a = slice("a", 1, ramp(1, 3, 3, 0.0));
        let b = slice("b", 2, ramp(1, 4, 3, 0.0));
        let err = DataArray::concat(vec![a, b], ConcatAxis::Time).unwrap_err();
        assert!(matches!(err, GrimpError::MisalignedGrid(_)));
    }

    #[test]
    fn test_concat_bands() {
        let a = slice("a", 1, ramp(1, 2, 2, 0.0));
        let mut b = slice("a", 1, ramp(1, 2, 2, 50.0));
        b.band = vec!["other".to_string()];
        b.fill_value = vec![-2.0e9];
        let merged = DataArray::concat(vec![a, b], ConcatAxis::Band).unwrap();
        assert_eq!(merged.band, vec!["b0", "other"]);
        assert_eq!(merged.fill_value, vec![-1.0, -2.0e9]);
        assert_eq!(merged.load().unwrap()[[0, 1, 0, 0]], 50.0);
    }

    #[test]
    fn test_plane_fill_outside_source() {
        let raster: Arc<dyn RasterSource> = Arc::new(InMemoryRaster::new(
            "p",
            ramp(1, 2, 2, 1.0),
            [0.0, 1.0, 0.0, 0.0, 0.0, -1.0],
            None,
            DataType::Float32,
        ));
        let plane = Plane {
            row_offset: -1,
            col_offset: 1,
            ..Plane::new(raster, 1, -9.0)
        };
        let values = plane.read(3, 2, 1).unwrap();
        assert_eq!(values, ndarray::arr2(&[[-9.0, -9.0], [2.0, -9.0], [12.0, -9.0]]));
    }

    #[test]
    fn test_statistics_skip_fill() {
        let mut values = ramp(1, 2, 2, 1.0);
        values[[0, 0, 0]] = -1.0;
        let array = slice("a", 1, values);
        let stats = array.band_statistics().unwrap();
        assert_eq!(stats[0].minimum, 2.0);
        assert_eq!(stats[0].maximum, 12.0);
        assert_eq!(stats[0].valid_percent, 75.0);
    }

    #[test]
    fn test_from_array_round_trip() {
        let array = slice("a", 1, ramp(2, 2, 3, 0.0));
        let values = array.load().unwrap();
        let wrapped = DataArray::from_array("velocity", values.clone(), &array).unwrap();
        assert_eq!(wrapped.load().unwrap(), values);
        assert_eq!(wrapped.x, array.x);
    }
}
