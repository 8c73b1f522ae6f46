//! NetCDF export and deferred reload of assembled arrays
//!
//! Layout follows the CF/rioxarray conventions: `(time, band, y, x)` data
//! variable named after the array, coordinate variables for every axis, a
//! `fill_value(band)` auxiliary coordinate and a scalar `spatial_ref` grid
//! mapping carrying the CRS and geotransform.

use crate::core::array::{DataArray, Plane};
use crate::core::scheduler::WorkerPool;
use crate::io::raster::{BandInfo, PixelWindow, RasterInfo, RasterSource};
use crate::types::{Crs, DataType, GeoTransform, GrimpError, GrimpResult, Timestamp};
use chrono::DateTime;
use ndarray::Array2;
use netcdf::AttributeValue;
use num_traits::NumCast;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SPATIAL_REF: &str = "spatial_ref";
const FILL_VALUE: &str = "fill_value";
const COORDINATE_VARIABLES: [&str; 7] = ["time", "time1", "time2", "band", "y", "x", FILL_VALUE];
const DEFLATE_LEVEL: i32 = 4;

/// `path` with the `.nc` extension enforced
pub fn nc_path(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == "nc" => path.to_path_buf(),
        _ => {
            let mut name = path.as_os_str().to_owned();
            name.push(".nc");
            PathBuf::from(name)
        }
    }
}

fn epoch_seconds(time: &Timestamp) -> f64 {
    time.and_utc().timestamp() as f64
}

fn from_epoch_seconds(seconds: f64) -> Option<Timestamp> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp(seconds.round() as i64, 0).map(|t| t.naive_utc())
}

fn cast_plane<T: NumCast + Copy + Default>(plane: &Array2<f64>, fill: f64) -> Vec<T> {
    let fallback = T::from(fill).unwrap_or_default();
    plane.iter().map(|&v| T::from(v).unwrap_or(fallback)).collect()
}

/// Type the data variable is written with: the array dtype, widened until
/// every band's fill value is representable
fn storage_dtype(array: &DataArray) -> DataType {
    let holds_fills = |dtype: DataType| array.fill_value.iter().all(|&fill| dtype.can_hold(fill));
    let dtype = [array.dtype, array.dtype.promote(DataType::Int32)]
        .into_iter()
        .find(|&dtype| holds_fills(dtype))
        .unwrap_or(DataType::Float64);
    if dtype != array.dtype {
        log::warn!(
            "Fill values of '{}' do not fit {}, writing as {}",
            array.name,
            array.dtype,
            dtype
        );
    }
    dtype
}

fn geo_transform_attr(transform: &GeoTransform) -> String {
    transform.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

/// Write `array` to `path`, materializing one time step at a time on `pool`
pub fn export_netcdf(array: &DataArray, path: &Path, pool: &WorkerPool) -> GrimpResult<()> {
    let (n_time, n_band, rows, cols) = array.shape();
    log::info!(
        "Writing '{}' ({} x {} x {} x {}) to {}",
        array.name,
        n_time,
        n_band,
        rows,
        cols,
        path.display()
    );

    let dtype = storage_dtype(array);
    let mut file = netcdf::create(path)?;
    file.add_attribute("Conventions", "CF-1.8")?;

    file.add_dimension("time", n_time)?;
    file.add_dimension("band", n_band)?;
    file.add_dimension("y", rows)?;
    file.add_dimension("x", cols)?;

    {
        let times: Vec<f64> = array.time.iter().map(epoch_seconds).collect();
        let mut var = file.add_variable::<f64>("time", &["time"])?;
        var.put_values(&times, ..)?;
        var.put_attribute("units", "seconds since 1970-01-01 00:00:00")?;
        var.put_attribute("calendar", "proleptic_gregorian")?;
    }

    for (name, values) in [("time1", &array.time1), ("time2", &array.time2)] {
        let seconds: Vec<f64> = values
            .iter()
            .map(|t| t.as_ref().map_or(f64::NAN, epoch_seconds))
            .collect();
        let mut var = file.add_variable::<f64>(name, &["time"])?;
        var.put_values(&seconds, ..)?;
        var.put_attribute("units", "seconds since 1970-01-01 00:00:00")?;
    }

    {
        let band_index: Vec<i32> = (1..=n_band as i32).collect();
        let mut var = file.add_variable::<i32>("band", &["band"])?;
        var.put_values(&band_index, ..)?;
        var.put_attribute("labels", array.band.clone())?;
    }
    {
        let mut var = file.add_variable::<f64>(FILL_VALUE, &["band"])?;
        var.put_values(&array.fill_value, ..)?;
    }

    for (name, values, standard_name) in [
        ("y", &array.y, "projection_y_coordinate"),
        ("x", &array.x, "projection_x_coordinate"),
    ] {
        let mut var = file.add_variable::<f64>(name, &[name])?;
        var.put_values(values, ..)?;
        var.put_attribute("standard_name", standard_name)?;
        var.put_attribute("units", "m")?;
    }

    {
        let mut var = file.add_variable::<i32>(SPATIAL_REF, &[])?;
        if let Some(crs) = &array.crs {
            if let Some(wkt) = &crs.wkt {
                var.put_attribute("crs_wkt", wkt.as_str())?;
                var.put_attribute("spatial_ref", wkt.as_str())?;
            }
            if let Some(epsg) = crs.epsg {
                var.put_attribute("epsg", epsg as i32)?;
            }
        }
        var.put_attribute("GeoTransform", geo_transform_attr(&array.transform))?;
    }

    macro_rules! write_data {
        ($ty:ty) => {{
            let mut var = file.add_variable::<$ty>(&array.name, &["time", "band", "y", "x"])?;
            let chunk = array.chunk_size.max(1);
            var.set_chunking(&[1, 1, rows.min(chunk), cols.min(chunk)])?;
            var.set_compression(DEFLATE_LEVEL, true)?;
            var.put_attribute("grid_mapping", SPATIAL_REF)?;
            var.put_attribute("coordinates", "time1 time2 fill_value")?;
            var.put_attribute("dtype", dtype.name())?;
            var.put_attribute("source_names", array.source_names.clone())?;

            for (t, planes) in array.planes().iter().enumerate() {
                let values = pool.run_all(planes.iter().collect(), |plane: &Plane| {
                    plane.read(rows, cols, chunk).map_err(|e| GrimpError::AssetLoad {
                        reference: plane.source.describe(),
                        source: Box::new(e),
                    })
                })?;
                for (b, plane) in values.iter().enumerate() {
                    let typed: Vec<$ty> = cast_plane(plane, array.fill_value[b]);
                    var.put_values(&typed, (t, b, .., ..))?;
                }
                log::debug!("Wrote time step {}/{}", t + 1, n_time);
            }
        }};
    }

    match dtype {
        DataType::UInt8 => write_data!(u8),
        DataType::Int16 => write_data!(i16),
        DataType::UInt16 => write_data!(u16),
        DataType::Int32 => write_data!(i32),
        DataType::UInt32 => write_data!(u32),
        DataType::Float32 => write_data!(f32),
        DataType::Float64 => write_data!(f64),
    }

    log::info!("Finished writing {}", path.display());
    Ok(())
}

fn string_attr(var: &netcdf::Variable, name: &str) -> Option<String> {
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Str(s) => Some(s),
        AttributeValue::Strs(values) => values.into_iter().next(),
        _ => None,
    }
}

fn strings_attr(var: &netcdf::Variable, name: &str) -> Option<Vec<String>> {
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Str(s) => Some(vec![s]),
        AttributeValue::Strs(values) => Some(values),
        _ => None,
    }
}

fn int_attr(var: &netcdf::Variable, name: &str) -> Option<i64> {
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Int(v) => Some(v as i64),
        AttributeValue::Uint(v) => Some(v as i64),
        AttributeValue::Longlong(v) => Some(v),
        AttributeValue::Short(v) => Some(v as i64),
        _ => None,
    }
}

fn read_coordinate(file: &netcdf::File, name: &str) -> GrimpResult<Vec<f64>> {
    let var = file
        .variable(name)
        .ok_or_else(|| GrimpError::InvalidFormat(format!("Missing coordinate variable '{}'", name)))?;
    Ok(var.get_values::<f64, _>(..)?)
}

/// Data variable of a saved array, read one hyperslab at a time.
///
/// Band `k` (1-based) addresses `(time, band) = ((k-1) / n_band, (k-1) % n_band)`.
pub struct NetcdfVariableSource {
    path: PathBuf,
    variable: String,
    n_band: usize,
    info: RasterInfo,
}

impl RasterSource for NetcdfVariableSource {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_window(&self, band: usize, window: PixelWindow) -> GrimpResult<Array2<f64>> {
        if band == 0 || band > self.info.band_count() {
            return Err(GrimpError::Processing(format!(
                "{}: band {} out of range",
                self.describe(),
                band
            )));
        }
        let t = (band - 1) / self.n_band;
        let b = (band - 1) % self.n_band;

        let file = netcdf::open(&self.path)?;
        let var = file.variable(&self.variable).ok_or_else(|| {
            GrimpError::InvalidFormat(format!("{} lost variable '{}'", self.path.display(), self.variable))
        })?;
        let values = var.get_values::<f64, _>((
            t,
            b,
            window.row..window.row + window.rows,
            window.col..window.col + window.cols,
        ))?;
        Array2::from_shape_vec((window.rows, window.cols), values)
            .map_err(|e| GrimpError::Processing(format!("Failed to reshape hyperslab: {}", e)))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.path.display(), self.variable)
    }
}

/// Reopen a saved array; pixels stay in the file until loaded.
///
/// `.nc` is appended to `path` when missing, as on export.
pub fn reload(path: &Path) -> GrimpResult<DataArray> {
    let path = nc_path(path);
    let path = path.as_path();
    log::info!("Reading {}", path.display());
    let file = netcdf::open(path)?;

    let var = file
        .variables()
        .find(|v| {
            let name = v.name();
            name != SPATIAL_REF && !COORDINATE_VARIABLES.contains(&name.as_str()) && v.dimensions().len() == 4
        })
        .ok_or_else(|| {
            GrimpError::InvalidFormat(format!("{} holds no (time, band, y, x) variable", path.display()))
        })?;
    let name = var.name();
    log::debug!("Selected data variable '{}'", name);

    let dims: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
    let (n_time, n_band, rows, cols) = (dims[0], dims[1], dims[2], dims[3]);

    let time: Vec<Timestamp> = read_coordinate(&file, "time")?
        .into_iter()
        .map(|s| {
            from_epoch_seconds(s)
                .ok_or_else(|| GrimpError::InvalidFormat(format!("Invalid time value {}", s)))
        })
        .collect::<GrimpResult<_>>()?;
    let optional_times = |name: &str| -> GrimpResult<Vec<Option<Timestamp>>> {
        match file.variable(name) {
            Some(_) => Ok(read_coordinate(&file, name)?.into_iter().map(from_epoch_seconds).collect()),
            None => Ok(vec![None; n_time]),
        }
    };
    let time1 = optional_times("time1")?;
    let time2 = optional_times("time2")?;

    let band = file
        .variable("band")
        .and_then(|v| strings_attr(&v, "labels"))
        .unwrap_or_else(|| (1..=n_band).map(|b| b.to_string()).collect());
    let fill_value = match file.variable(FILL_VALUE) {
        Some(_) => read_coordinate(&file, FILL_VALUE)?,
        None => vec![f64::NAN; n_band],
    };
    let y = read_coordinate(&file, "y")?;
    let x = read_coordinate(&file, "x")?;

    let dtype = string_attr(&var, "dtype")
        .and_then(|s| DataType::parse(&s))
        .unwrap_or(DataType::Float64);
    let source_names = strings_attr(&var, "source_names")
        .filter(|names| names.len() == n_time)
        .unwrap_or_else(|| vec![name.clone(); n_time]);

    let (crs, transform) = match file.variable(SPATIAL_REF) {
        Some(spatial_ref) => {
            let wkt = string_attr(&spatial_ref, "crs_wkt");
            let epsg = int_attr(&spatial_ref, "epsg").map(|e| e as u32);
            let crs = (wkt.is_some() || epsg.is_some()).then_some(Crs { wkt, epsg });
            let transform = string_attr(&spatial_ref, "GeoTransform").and_then(|s| {
                let values: Vec<f64> = s.split_whitespace().filter_map(|v| v.parse().ok()).collect();
                <[f64; 6]>::try_from(values).ok()
            });
            (crs, transform)
        }
        None => (None, None),
    };
    let transform = match transform {
        Some(transform) => transform,
        None => {
            log::warn!("{} has no GeoTransform, deriving it from coordinates", path.display());
            transform_from_centers(&x, &y)
        }
    };

    if time.len() != n_time || band.len() != n_band || y.len() != rows || x.len() != cols {
        return Err(GrimpError::InvalidFormat(format!(
            "Coordinates of {} do not match variable shape {:?}",
            path.display(),
            dims
        )));
    }

    let source: Arc<dyn RasterSource> = Arc::new(NetcdfVariableSource {
        path: path.to_path_buf(),
        variable: name.clone(),
        n_band,
        info: RasterInfo {
            width: cols,
            height: rows,
            geo_transform: transform,
            crs: crs.clone(),
            bands: (0..n_time * n_band)
                .map(|k| BandInfo {
                    data_type: dtype,
                    no_data: fill_value.get(k % n_band.max(1)).copied(),
                    statistics: None,
                })
                .collect(),
        },
    });
    let planes = (0..n_time)
        .map(|t| {
            (0..n_band)
                .map(|b| Plane::new(Arc::clone(&source), t * n_band + b + 1, fill_value[b]))
                .collect()
        })
        .collect();

    let mut array = DataArray::from_planes(
        name,
        time,
        time1,
        time2,
        source_names,
        band,
        fill_value,
        planes,
        (rows, cols),
        transform,
        crs,
        dtype,
    )?;
    array.y = y;
    array.x = x;
    Ok(array)
}

fn transform_from_centers(x: &[f64], y: &[f64]) -> GeoTransform {
    let dx = if x.len() > 1 { x[1] - x[0] } else { 1.0 };
    let dy = if y.len() > 1 { y[1] - y[0] } else { -1.0 };
    let x0 = x.first().copied().unwrap_or(0.0) - dx / 2.0;
    let y0 = y.first().copied().unwrap_or(0.0) - dy / 2.0;
    [x0, dx, 0.0, y0, 0.0, dy]
}
