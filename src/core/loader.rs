//! Lazy single-asset loader
//!
//! One reference (the template band file of a time slice) expands to one
//! opened file per requested band. Files are opened for their header only;
//! pixels stay on disk until the assembled array is materialized.

use crate::core::array::{ConcatAxis, DataArray, Plane};
use crate::core::bands::BandDescriptor;
use crate::core::naming::{file_name, parse_dates, substitute_band, NamingConvention};
use crate::io::raster::RasterOpener;
use crate::types::{GrimpError, GrimpResult, CHUNK_SIZE};
use std::sync::Arc;

/// Deferred load of one time slice; nothing is opened until [`AssetTask::run`]
#[derive(Clone)]
pub struct AssetTask {
    pub reference: String,
    bands: Vec<&'static BandDescriptor>,
    opener: Arc<dyn RasterOpener>,
    naming: Option<NamingConvention>,
    chunk_size: usize,
}

impl std::fmt::Debug for AssetTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetTask")
            .field("reference", &self.reference)
            .field("bands", &self.bands.iter().map(|b| b.id).collect::<Vec<_>>())
            .finish()
    }
}

/// Prepare the load of `reference` for `bands`
pub fn open_asset(
    reference: impl Into<String>,
    bands: Vec<&'static BandDescriptor>,
    opener: Arc<dyn RasterOpener>,
    naming: Option<NamingConvention>,
) -> AssetTask {
    AssetTask {
        reference: reference.into(),
        bands,
        opener,
        naming,
        chunk_size: CHUNK_SIZE,
    }
}

impl AssetTask {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sibling file of each requested band, in band order
    pub fn band_references(&self) -> GrimpResult<Vec<String>> {
        self.bands
            .iter()
            .map(|band| substitute_band(&self.reference, band.template, band.token()))
            .collect()
    }

    /// Open every band file and build the `(1, band, y, x)` slice
    pub fn run(&self) -> GrimpResult<DataArray> {
        let first = self.bands.first().ok_or_else(|| {
            GrimpError::Processing(format!("No bands requested for {}", self.reference))
        })?;
        let times = parse_dates(&self.reference, self.naming.as_ref())?;
        let time = times.representative();
        let name = file_name(&self.reference).to_string();

        let mut slices = Vec::with_capacity(self.bands.len());
        for (band, href) in self.bands.iter().zip(self.band_references()?) {
            log::debug!("Opening band {} of {}: {}", band.id, name, href);
            let source = self.opener.open(&href).map_err(|e| GrimpError::AssetLoad {
                reference: href.clone(),
                source: Box::new(e),
            })?;
            let info = source.info().clone();
            let plane = Plane::new(source, 1, band.no_data);
            let mut slice = DataArray::time_slice(
                first.family.name(),
                (time, Some(times.time1), times.time2),
                name.clone(),
                vec![band.id.to_string()],
                vec![band.no_data],
                vec![plane],
                (info.height, info.width),
                info.geo_transform,
                info.crs.clone(),
                info.data_type(),
            )?;
            slice.chunk_size = self.chunk_size;
            slice.attrs.insert("source".to_string(), href);
            slices.push(slice);
        }

        DataArray::concat(slices, ConcatAxis::Band)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bands::descriptors;
    use crate::io::memory::{InMemoryRaster, MemoryOpener};
    use crate::types::DataType;
    use ndarray::Array2;

    const REF: &str = "/data/GL_vel_mosaic_Annual_01Dec20_30Nov21_vv_v03.0.tif";

    fn opener(bands: &[&str]) -> Arc<MemoryOpener> {
        let mut opener = MemoryOpener::new();
        for (i, band) in bands.iter().enumerate() {
            let href = REF.replace("_vv_", &format!("_{}_", band));
            opener.insert(
                href,
                InMemoryRaster::from_plane(
                    *band,
                    Array2::from_elem((3, 4), i as f64),
                    [0.0, 200.0, 0.0, 600.0, 0.0, -200.0],
                    None,
                    DataType::Float32,
                ),
            );
        }
        Arc::new(opener)
    }

    fn ids(bands: &[&str]) -> Vec<&'static BandDescriptor> {
        descriptors(&bands.iter().map(|b| b.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_task_is_deferred() {
        let opener = opener(&["vv", "vx"]);
        let task = open_asset(REF, ids(&["vv", "vx"]), opener.clone(), None);
        assert_eq!(opener.open_count(), 0);
        assert_eq!(
            task.band_references().unwrap()[1],
            "/data/GL_vel_mosaic_Annual_01Dec20_30Nov21_vx_v03.0.tif"
        );

        let slice = task.run().unwrap();
        assert_eq!(opener.open_count(), 2);
        assert_eq!(slice.shape(), (1, 2, 3, 4));
        assert_eq!(slice.name, "velocity");
        assert_eq!(slice.band, vec!["vv", "vx"]);
        assert_eq!(slice.fill_value, vec![-1.0, -2.0e9]);
        assert_eq!(slice.source_names, vec!["GL_vel_mosaic_Annual_01Dec20_30Nov21_vv_v03.0.tif"]);
        assert!(slice.attrs.is_empty());
        assert_eq!(slice.load().unwrap()[[0, 1, 2, 3]], 1.0);
    }

    #[test]
    fn test_missing_band_file_is_asset_error() {
        let opener = opener(&["vv"]);
        let task = open_asset(REF, ids(&["vv", "ey"]), opener, None);
        match task.run() {
            Err(GrimpError::AssetLoad { reference, .. }) => assert!(reference.contains("_ey_")),
            other => panic!("unexpected: {:?}", other.map(|a| a.shape())),
        }
    }

    #[test]
    fn test_bad_name_is_naming_error() {
        let task = open_asset("/data/no_dates_vv.tif", ids(&["vv"]), opener(&["vv"]), None);
        assert!(matches!(task.run(), Err(GrimpError::NamingConvention { .. })));
    }
}
