use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamps carried on the time axis (naive UTC, as written by the producers)
pub type Timestamp = NaiveDateTime;

/// GDAL-style affine geotransform
/// `[origin_x, pixel_width, rotation_x, origin_y, rotation_y, pixel_height]`
pub type GeoTransform = [f64; 6];

/// Spatial tile edge, in pixels, for deferred reads
pub const CHUNK_SIZE: usize = 512;

/// Rectangle in the array's native projected coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BoundingBox {
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self { minx, miny, maxx, maxy }
    }

    /// Build from `[minx, miny, maxx, maxy]`
    pub fn from_array(values: [f64; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.minx, self.miny, self.maxx, self.maxy]
    }

    /// Smallest box containing both
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            minx: self.minx.min(other.minx),
            miny: self.miny.min(other.miny),
            maxx: self.maxx.max(other.maxx),
            maxy: self.maxy.max(other.maxy),
        }
    }

    /// Key/value pairs with exactly the keys `minx, miny, maxx, maxy`
    pub fn to_pairs(&self) -> [(&'static str, f64); 4] {
        [
            ("minx", self.minx),
            ("miny", self.miny),
            ("maxx", self.maxx),
            ("maxy", self.maxy),
        ]
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{minx: {}, miny: {}, maxx: {}, maxy: {}}}",
            self.minx, self.miny, self.maxx, self.maxy
        )
    }
}

/// Numeric storage type of a band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl DataType {
    /// Parse either numpy-style (`uint8`, `float32`) or GDAL-style (`Byte`, `Float32`) names
    pub fn parse(name: &str) -> Option<DataType> {
        match name.to_ascii_lowercase().as_str() {
            "uint8" | "byte" => Some(DataType::UInt8),
            "int16" => Some(DataType::Int16),
            "uint16" => Some(DataType::UInt16),
            "int32" => Some(DataType::Int32),
            "uint32" => Some(DataType::UInt32),
            "float32" => Some(DataType::Float32),
            "float64" => Some(DataType::Float64),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Whether `value` is representable without loss
    pub fn can_hold(&self, value: f64) -> bool {
        let (min, max) = match self {
            DataType::Float64 => return true,
            DataType::Float32 => return !value.is_finite() || value.abs() <= f32::MAX as f64,
            DataType::UInt8 => (u8::MIN as f64, u8::MAX as f64),
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::UInt16 => (u16::MIN as f64, u16::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::UInt32 => (u32::MIN as f64, u32::MAX as f64),
        };
        value.is_finite() && value.fract() == 0.0 && value >= min && value <= max
    }

    fn bits(&self) -> u32 {
        match self {
            DataType::UInt8 => 8,
            DataType::Int16 | DataType::UInt16 => 16,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 32,
            DataType::Float64 => 64,
        }
    }

    fn is_signed(&self) -> bool {
        !matches!(self, DataType::UInt8 | DataType::UInt16 | DataType::UInt32)
    }

    /// Smallest type able to hold values of both, numpy promotion rules
    pub fn promote(self, other: DataType) -> DataType {
        use DataType::*;
        if self == other {
            return self;
        }
        match (self.is_float(), other.is_float()) {
            (true, true) => Float64,
            (true, false) | (false, true) => {
                let (float, int) = if self.is_float() { (self, other) } else { (other, self) };
                if float == Float32 && int.bits() <= 16 {
                    Float32
                } else {
                    Float64
                }
            }
            (false, false) => {
                let bits = self.bits().max(other.bits());
                if self.is_signed() == other.is_signed() {
                    let signed = self.is_signed();
                    match (bits, signed) {
                        (8, _) => UInt8,
                        (16, true) => Int16,
                        (16, false) => UInt16,
                        (_, true) => Int32,
                        (_, false) => UInt32,
                    }
                } else {
                    let unsigned = if self.is_signed() { other } else { self };
                    match unsigned.bits() {
                        8 => if bits <= 16 { Int16 } else { Int32 },
                        16 => Int32,
                        _ => Float64,
                    }
                }
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Coordinate reference system of a grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crs {
    pub wkt: Option<String>,
    pub epsg: Option<u32>,
}

impl Crs {
    pub fn from_epsg(epsg: u32) -> Self {
        Self { wkt: None, epsg: Some(epsg) }
    }

    /// Two definitions refer to the same system when EPSG codes agree, or WKT
    /// strings agree when neither carries a code
    pub fn same_as(&self, other: &Crs) -> bool {
        match (self.epsg, other.epsg) {
            (Some(a), Some(b)) => a == b,
            _ => self.wkt == other.wkt,
        }
    }
}

/// Summary statistics of one band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStatistics {
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub stddev: f64,
    pub valid_percent: f64,
}

/// Error types for raster assembly and export
#[derive(Debug, thiserror::Error)]
pub enum GrimpError {
    #[error("Ignoring invalid band: {band}. Allowed bands: {allowed:?}")]
    InvalidBand { band: String, allowed: Vec<String> },

    #[error("Name does not follow a known naming convention ({reference}): {reason}")]
    NamingConvention { reference: String, reason: String },

    #[error("Could not build metadata template from {reference}: {source}")]
    MetadataTemplate {
        reference: String,
        source: Box<GrimpError>,
    },

    #[error("No data array assembled; call load_data_array or load_stack first")]
    NotAssembled,

    #[error("Misaligned grid: {0}")]
    MisalignedGrid(String),

    #[error("No data found in bounds {0}")]
    NoDataInBounds(BoundingBox),

    #[error("Failed to load asset {reference}: {source}")]
    AssetLoad {
        reference: String,
        source: Box<GrimpError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl GrimpError {
    pub fn naming(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        GrimpError::NamingConvention {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for raster assembly operations
pub type GrimpResult<T> = Result<T, GrimpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_promotion() {
        assert_eq!(DataType::Float32.promote(DataType::Float32), DataType::Float32);
        assert_eq!(DataType::UInt8.promote(DataType::Float32), DataType::Float32);
        assert_eq!(DataType::Int32.promote(DataType::Float32), DataType::Float64);
        assert_eq!(DataType::UInt8.promote(DataType::Int16), DataType::Int16);
        assert_eq!(DataType::UInt16.promote(DataType::Int16), DataType::Int32);
        assert_eq!(DataType::UInt32.promote(DataType::Int32), DataType::Float64);
    }

    #[test]
    fn test_dtype_names() {
        assert_eq!(DataType::parse("Byte"), Some(DataType::UInt8));
        assert_eq!(DataType::parse("float32"), Some(DataType::Float32));
        assert_eq!(DataType::parse("CFloat32"), None);
        assert_eq!(DataType::Float64.to_string(), "float64");
    }

    #[test]
    fn test_dtype_can_hold() {
        assert!(DataType::Int16.can_hold(-32768.0));
        assert!(!DataType::Int16.can_hold(-2.0e9));
        assert!(DataType::Int32.can_hold(-2.0e9));
        assert!(!DataType::UInt8.can_hold(-1.0));
        assert!(!DataType::Int32.can_hold(f64::NAN));
        assert!(!DataType::Int32.can_hold(0.5));
        assert!(DataType::Float32.can_hold(f64::NAN));
        assert!(DataType::Float64.can_hold(1.0e300));
    }

    #[test]
    fn test_bbox_union() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(-5.0, 2.0, 5.0, 20.0);
        assert_eq!(a.union(&b), BoundingBox::new(-5.0, 0.0, 10.0, 20.0));
        let keys: Vec<&str> = a.to_pairs().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["minx", "miny", "maxx", "maxy"]);
    }
}
