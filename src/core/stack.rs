//! Bulk stacking of catalog assets
//!
//! Only the first asset is opened up front. Its projection, shape, transform
//! and band metadata become a template that is cloned into one STAC-like item
//! per reference; the items are then stacked onto a common grid with every
//! other file opened on first read.

use crate::core::array::{DataArray, Plane};
use crate::core::bands::{lookup_band, BandDescriptor};
use crate::core::naming::{file_name, parse_dates, substitute_band, NamingConvention};
use crate::io::raster::{BandInfo, DeferredRaster, RasterInfo, RasterOpener, RasterSource};
use crate::types::{
    BandStatistics, BoundingBox, Crs, DataType, GeoTransform, GrimpError, GrimpResult, Timestamp,
    CHUNK_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const GEOTIFF_MEDIA_TYPE: &str = "image/tiff; application=geotiff; profile=cloud-optimized";

/// Tolerance, in pixels, for treating grid offsets as whole pixels
const ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// Explicit output grid: edges in projected meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub epsg: u32,
    pub resolution: f64,
    pub bounds: BoundingBox,
}

impl GridSpec {
    pub fn shape(&self) -> (usize, usize) {
        (
            ((self.bounds.maxy - self.bounds.miny) / self.resolution).round() as usize,
            ((self.bounds.maxx - self.bounds.minx) / self.resolution).round() as usize,
        )
    }
}

/// Where the x/y coordinates sit within each pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XyCoords {
    #[default]
    Center,
    TopLeft,
}

/// Per-band raster metadata of an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterBandMeta {
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodata: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<BandStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Vec<u64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMeta {
    pub href: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub roles: Vec<String>,
    #[serde(rename = "raster:bands")]
    pub raster_bands: Vec<RasterBandMeta>,
}

/// Projection extension fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjMeta {
    #[serde(rename = "proj:epsg")]
    pub epsg: Option<u32>,
    #[serde(rename = "proj:wkt2", skip_serializing_if = "Option::is_none")]
    pub wkt: Option<String>,
    /// `[rows, cols]`
    #[serde(rename = "proj:shape")]
    pub shape: [usize; 2],
    #[serde(rename = "proj:transform")]
    pub transform: GeoTransform,
}

impl ProjMeta {
    pub fn resolution(&self) -> (f64, f64) {
        (self.transform[1], -self.transform[5])
    }

    /// Edges of the item grid
    pub fn bounds(&self) -> BoundingBox {
        let [rows, cols] = self.shape;
        let t = &self.transform;
        let x0 = t[0];
        let x1 = t[0] + cols as f64 * t[1];
        let y0 = t[3];
        let y1 = t[3] + rows as f64 * t[5];
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    pub fn crs(&self) -> Option<Crs> {
        if self.epsg.is_none() && self.wkt.is_none() {
            return None;
        }
        Some(Crs {
            wkt: self.wkt.clone(),
            epsg: self.epsg,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemProperties {
    pub datetime: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_datetime: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_datetime: Option<Timestamp>,
    #[serde(flatten)]
    pub proj: ProjMeta,
}

/// STAC-like description of one time slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackItem {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub bbox: [f64; 4],
    pub properties: ItemProperties,
    pub assets: BTreeMap<String, AssetMeta>,
}

/// Metadata shared by every item, read from the first asset
#[derive(Debug, Clone, PartialEq)]
pub struct ItemTemplate {
    pub proj: ProjMeta,
    pub data_type: DataType,
    /// One asset template per distinct band, href left empty
    pub assets: BTreeMap<String, AssetMeta>,
}

/// Open the first band file of `reference` and build the item template.
///
/// Cached statistics and histograms describe that file only and are dropped.
pub fn item_template(
    reference: &str,
    bands: &[&'static BandDescriptor],
    opener: &dyn RasterOpener,
) -> GrimpResult<ItemTemplate> {
    let wrap = |e: GrimpError| GrimpError::MetadataTemplate {
        reference: reference.to_string(),
        source: Box::new(e),
    };

    let first = bands
        .first()
        .ok_or_else(|| wrap(GrimpError::Processing("No bands requested".to_string())))?;
    let href = substitute_band(reference, first.template, first.token()).map_err(wrap)?;
    log::info!("Reading stack template metadata from {}", href);
    let source = opener.open(&href).map_err(wrap)?;
    let info = source.info();

    let band_info = info.bands.first().cloned().ok_or_else(|| {
        wrap(GrimpError::InvalidFormat(format!("{} has no raster bands", href)))
    })?;
    let data_type = info.data_type();

    let mut assets = BTreeMap::new();
    for band in bands {
        assets.entry(band.id.to_string()).or_insert_with(|| AssetMeta {
            href: String::new(),
            media_type: GEOTIFF_MEDIA_TYPE.to_string(),
            roles: vec!["data".to_string()],
            raster_bands: vec![RasterBandMeta {
                data_type: band.dtype.unwrap_or(band_info.data_type),
                nodata: Some(band.no_data),
                statistics: None,
                histogram: None,
            }],
        });
    }

    Ok(ItemTemplate {
        proj: ProjMeta {
            epsg: info.crs.as_ref().and_then(|c| c.epsg),
            wkt: info.crs.as_ref().and_then(|c| c.wkt.clone()),
            shape: [info.height, info.width],
            transform: info.geo_transform,
        },
        data_type,
        assets,
    })
}

/// Clone `template` into one item per reference
pub fn construct_stack_items(
    references: &[String],
    bands: &[&'static BandDescriptor],
    template: &ItemTemplate,
    naming: Option<&NamingConvention>,
) -> GrimpResult<Vec<StackItem>> {
    let bbox = template.proj.bounds().to_array();
    references
        .iter()
        .map(|reference| {
            let times = parse_dates(reference, naming)?;
            let mut assets = BTreeMap::new();
            for band in bands {
                let mut asset = template.assets.get(band.id).cloned().ok_or_else(|| {
                    GrimpError::Processing(format!("No asset template for band {}", band.id))
                })?;
                asset.href = substitute_band(reference, band.template, band.token())?;
                assets.insert(band.id.to_string(), asset);
            }
            Ok(StackItem {
                id: file_name(reference).to_string(),
                collection: None,
                bbox,
                properties: ItemProperties {
                    datetime: times.representative(),
                    start_datetime: Some(times.time1),
                    end_datetime: times.time2,
                    proj: template.proj.clone(),
                },
                assets,
            })
        })
        .collect()
}

/// How items become an array
#[derive(Clone)]
pub struct StackOptions {
    /// Asset keys to stack, in band order
    pub assets: Vec<String>,
    pub chunk_size: usize,
    /// Expand the union bounds outward to whole multiples of the resolution;
    /// a pinned `grid` is used as given
    pub snap_bounds: bool,
    pub xy_coords: XyCoords,
    pub dtype: Option<DataType>,
    /// Output grid; the union of the item footprints when unset
    pub grid: Option<GridSpec>,
    pub opener: Arc<dyn RasterOpener>,
}

impl StackOptions {
    pub fn new(assets: Vec<String>, opener: Arc<dyn RasterOpener>) -> Self {
        Self {
            assets,
            chunk_size: CHUNK_SIZE,
            snap_bounds: false,
            xy_coords: XyCoords::Center,
            dtype: None,
            grid: None,
            opener,
        }
    }
}

fn whole_pixels(value: f64, what: &str, item: &str) -> GrimpResult<i64> {
    let rounded = value.round();
    if (value - rounded).abs() > ALIGNMENT_TOLERANCE {
        return Err(GrimpError::MisalignedGrid(format!(
            "{} of {} is {} pixels, not a whole number",
            what, item, value
        )));
    }
    Ok(rounded as i64)
}

/// Stack items onto one `(time, band, y, x)` grid. Nothing is read or opened.
pub fn stack(items: &[StackItem], options: &StackOptions) -> GrimpResult<DataArray> {
    let first = items
        .first()
        .ok_or_else(|| GrimpError::Processing("No items to stack".to_string()))?;
    let proj = &first.properties.proj;
    let (res_x, res_y) = proj.resolution();
    let crs = proj.crs();

    for item in items {
        let other = &item.properties.proj;
        if other.resolution() != (res_x, res_y) {
            return Err(GrimpError::MisalignedGrid(format!(
                "{} has resolution {:?}, expected {:?}",
                item.id,
                other.resolution(),
                (res_x, res_y)
            )));
        }
        if let (Some(a), Some(b)) = (&crs, other.crs()) {
            if !a.same_as(&b) {
                return Err(GrimpError::MisalignedGrid(format!("{} uses a different CRS", item.id)));
            }
        }
    }

    let (bounds, (rows, cols)) = match &options.grid {
        Some(grid) => {
            if (grid.resolution - res_x).abs() > ALIGNMENT_TOLERANCE || (grid.resolution - res_y).abs() > ALIGNMENT_TOLERANCE {
                return Err(GrimpError::MisalignedGrid(format!(
                    "Grid resolution {} does not match items ({}, {})",
                    grid.resolution, res_x, res_y
                )));
            }
            if let Some(epsg) = crs.as_ref().and_then(|c| c.epsg) {
                if epsg != grid.epsg {
                    return Err(GrimpError::MisalignedGrid(format!(
                        "Grid EPSG:{} does not match items EPSG:{}",
                        grid.epsg, epsg
                    )));
                }
            }
            (grid.bounds, grid.shape())
        }
        None => {
            let bounds = items
                .iter()
                .skip(1)
                .fold(proj.bounds(), |acc, item| acc.union(&item.properties.proj.bounds()));
            let bounds = if options.snap_bounds {
                BoundingBox::new(
                    (bounds.minx / res_x).floor() * res_x,
                    (bounds.miny / res_y).floor() * res_y,
                    (bounds.maxx / res_x).ceil() * res_x,
                    (bounds.maxy / res_y).ceil() * res_y,
                )
            } else {
                bounds
            };
            let rows = ((bounds.maxy - bounds.miny) / res_y).round() as usize;
            let cols = ((bounds.maxx - bounds.minx) / res_x).round() as usize;
            (bounds, (rows, cols))
        }
    };
    let transform: GeoTransform = [bounds.minx, res_x, 0.0, bounds.maxy, 0.0, -res_y];

    let mut fills = Vec::with_capacity(options.assets.len());
    let mut dtype: Option<DataType> = options.dtype;
    for key in &options.assets {
        let meta = first
            .assets
            .get(key)
            .and_then(|a| a.raster_bands.first())
            .ok_or_else(|| GrimpError::Processing(format!("{} has no asset '{}'", first.id, key)))?;
        fills.push(meta.nodata.unwrap_or(f64::NAN));
        if options.dtype.is_none() {
            dtype = Some(dtype.map_or(meta.data_type, |d| d.promote(meta.data_type)));
        }
    }

    let mut planes = Vec::with_capacity(items.len());
    for item in items {
        let item_proj = &item.properties.proj;
        let item_bounds = item_proj.bounds();
        let row_offset = whole_pixels((bounds.maxy - item_bounds.maxy) / res_y, "row offset", &item.id)?;
        let col_offset = whole_pixels((bounds.minx - item_bounds.minx) / res_x, "column offset", &item.id)?;

        let mut row = Vec::with_capacity(options.assets.len());
        for (key, &fill) in options.assets.iter().zip(&fills) {
            let asset = item
                .assets
                .get(key)
                .ok_or_else(|| GrimpError::Processing(format!("{} has no asset '{}'", item.id, key)))?;
            let info = RasterInfo {
                width: item_proj.shape[1],
                height: item_proj.shape[0],
                geo_transform: item_proj.transform,
                crs: item_proj.crs(),
                bands: asset
                    .raster_bands
                    .iter()
                    .map(|b| BandInfo {
                        data_type: b.data_type,
                        no_data: b.nodata,
                        statistics: None,
                    })
                    .collect(),
            };
            let source: Arc<dyn RasterSource> =
                Arc::new(DeferredRaster::new(asset.href.clone(), info, Arc::clone(&options.opener)));
            row.push(Plane {
                // item row 0 sits `row_offset` rows below the output top edge
                row_offset: -row_offset,
                col_offset,
                ..Plane::new(source, 1, fill)
            });
        }
        planes.push(row);
    }

    let name = options
        .assets
        .first()
        .and_then(|key| lookup_band(key))
        .map(|b| b.family.name())
        .unwrap_or("stack");

    let mut array = DataArray::from_planes(
        name,
        items.iter().map(|i| i.properties.datetime).collect(),
        items.iter().map(|i| i.properties.start_datetime).collect(),
        items.iter().map(|i| i.properties.end_datetime).collect(),
        items.iter().map(|i| i.id.clone()).collect(),
        options.assets.clone(),
        fills,
        planes,
        (rows, cols),
        transform,
        crs,
        dtype.unwrap_or(DataType::Float64),
    )?;
    array.chunk_size = options.chunk_size;
    if options.xy_coords == XyCoords::TopLeft {
        array.x = (0..cols).map(|i| transform[0] + i as f64 * transform[1]).collect();
        array.y = (0..rows).map(|i| transform[3] + i as f64 * transform[5]).collect();
    }

    log::info!(
        "Stacked {} items x {} assets onto a {}x{} grid",
        items.len(),
        options.assets.len(),
        cols,
        rows
    );
    Ok(array)
}

/// Template, items and stack in one call
pub fn stack_assets(
    references: &[String],
    bands: &[&'static BandDescriptor],
    opener: Arc<dyn RasterOpener>,
    naming: Option<&NamingConvention>,
    chunk_size: usize,
    grid: Option<GridSpec>,
) -> GrimpResult<DataArray> {
    let first = references
        .first()
        .ok_or_else(|| GrimpError::Processing("No references to stack".to_string()))?;
    let template = item_template(first, bands, opener.as_ref())?;
    let items = construct_stack_items(references, bands, &template, naming)?;

    let options = StackOptions {
        chunk_size,
        dtype: Some(template.data_type),
        grid,
        ..StackOptions::new(bands.iter().map(|b| b.id.to_string()).collect(), opener)
    };
    stack(&items, &options)
}

pub fn to_json(items: &[StackItem]) -> GrimpResult<String> {
    serde_json::to_string_pretty(items)
        .map_err(|e| GrimpError::InvalidFormat(format!("Failed to serialize stack items: {}", e)))
}

pub fn from_json(json: &str) -> GrimpResult<Vec<StackItem>> {
    serde_json::from_str(json)
        .map_err(|e| GrimpError::InvalidFormat(format!("Failed to parse stack items: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bands::descriptors;
    use crate::io::memory::{InMemoryRaster, MemoryOpener};
    use ndarray::Array2;

    fn refs() -> Vec<String> {
        ["01Jan21_15Jan21", "15Jan21_29Jan21", "29Jan21_12Feb21"]
            .iter()
            .map(|d| format!("/mosaics/GL_vel_mosaic_Annual_{}_vv_v1.tif", d))
            .collect()
    }

    fn opener(origin_x: f64) -> Arc<MemoryOpener> {
        let mut opener = MemoryOpener::new();
        for (t, reference) in refs().iter().enumerate() {
            for (b, band) in ["vv", "vx"].iter().enumerate() {
                let href = reference.replace("_vv_", &format!("_{}_", band));
                let values = Array2::from_elem((4, 5), (t * 10 + b) as f64);
                opener.insert(
                    href,
                    InMemoryRaster::from_plane(
                        *band,
                        values,
                        [origin_x, 100.0, 0.0, 1000.0, 0.0, -100.0],
                        Some(Crs::from_epsg(3413)),
                        DataType::Float32,
                    ),
                );
            }
        }
        Arc::new(opener)
    }

    fn bands() -> Vec<&'static BandDescriptor> {
        descriptors(&["vv".to_string(), "vx".to_string()])
    }

    #[test]
    fn test_template_strips_statistics() {
        let mut opener = MemoryOpener::new();
        opener.insert(
            refs()[0].clone(),
            InMemoryRaster::from_plane("vv", Array2::zeros((2, 2)), [0.0, 1.0, 0.0, 2.0, 0.0, -1.0], None, DataType::Float32),
        );
        let template = item_template(&refs()[0], &bands(), &opener).unwrap();
        assert_eq!(template.assets.len(), 2);
        assert_eq!(template.assets["vx"].raster_bands[0].nodata, Some(-2.0e9));
        assert!(template.assets.values().all(|a| a.href.is_empty()));

        let items = construct_stack_items(&refs(), &bands(), &template, None).unwrap();
        let json = to_json(&items).unwrap();
        assert!(!json.contains("statistics"));
        assert!(json.contains("raster:bands"));
        assert_eq!(from_json(&json).unwrap(), items);
    }

    #[test]
    fn test_only_template_opened_before_load() {
        let opener = opener(0.0);
        let array = stack_assets(&refs(), &bands(), opener.clone(), None, 512, None).unwrap();
        assert_eq!(array.shape(), (3, 2, 4, 5));
        assert_eq!(opener.open_count(), 1);
        assert_eq!(array.source_names[1], "GL_vel_mosaic_Annual_15Jan21_29Jan21_vv_v1.tif");
        assert_eq!(array.x[0], 50.0);
        assert_eq!(array.y[0], 950.0);
        assert_eq!(array.dtype, DataType::Float32);

        let values = array.load().unwrap();
        assert_eq!(opener.open_count(), 7);
        assert_eq!(values[[2, 1, 3, 4]], 21.0);
    }

    #[test]
    fn test_template_failure() {
        let opener = Arc::new(MemoryOpener::new());
        let err = stack_assets(&refs(), &bands(), opener, None, 512, None).unwrap_err();
        assert!(matches!(err, GrimpError::MetadataTemplate { .. }));
    }

    #[test]
    fn test_pinned_grid_places_items_by_offset() {
        let opener = opener(200.0);
        let grid = GridSpec {
            epsg: 3413,
            resolution: 100.0,
            bounds: BoundingBox::new(0.0, 400.0, 800.0, 1100.0),
        };
        let array = stack_assets(&refs()[..1], &bands(), opener, None, 512, Some(grid)).unwrap();
        assert_eq!(array.shape(), (1, 2, 7, 8));

        let values = array.load().unwrap();
        // top row lies above the item, first two columns left of it
        assert_eq!(values[[0, 0, 0, 3]], -1.0);
        assert_eq!(values[[0, 1, 1, 1]], -2.0e9);
        assert_eq!(values[[0, 1, 1, 2]], 1.0);
        assert_eq!(values[[0, 0, 4, 6]], 0.0);
        assert_eq!(values[[0, 0, 5, 6]], -1.0);
    }

    #[test]
    fn test_pinned_grid_resolution_mismatch() {
        let grid = crate::core::bands::ProductFamily::Velocity.mosaic_grid();
        let err = stack_assets(&refs(), &bands(), opener(0.0), None, 512, Some(grid)).unwrap_err();
        assert!(matches!(err, GrimpError::MisalignedGrid(_)));
    }
}
