//! Assembly orchestrator
//!
//! Drives band validation, per-asset or bulk assembly, spatial subsetting and
//! export. Progress is an explicit [`SubsetterState`] value; assembling again
//! or subsetting again replaces the current arrays.

use crate::core::array::{ConcatAxis, DataArray};
use crate::core::bands::{descriptors, validate_bands, BandDescriptor};
use crate::core::loader::open_asset;
use crate::core::naming::NamingConvention;
use crate::core::scheduler::WorkerPool;
use crate::core::stack::{stack_assets, GridSpec};
use crate::io::netcdf_store::{export_netcdf, nc_path, reload};
use crate::io::raster::{GdalOpener, RasterOpener};
use crate::types::{BoundingBox, GrimpError, GrimpResult, CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reference count from which `Auto` picks the bulk path
pub const BULK_ASSET_THRESHOLD: usize = 16;

/// How references become an assembled array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyStrategy {
    /// Open every band file of every reference on the worker pool
    Lazy,
    /// Open the first file only and clone its metadata
    Bulk,
    #[default]
    Auto,
}

impl AssemblyStrategy {
    pub fn resolve(self, references: usize) -> AssemblyStrategy {
        match self {
            AssemblyStrategy::Auto if references >= BULK_ASSET_THRESHOLD => AssemblyStrategy::Bulk,
            AssemblyStrategy::Auto => AssemblyStrategy::Lazy,
            other => other,
        }
    }
}

/// Orchestrator configuration, fixed at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetterConfig {
    pub bands: Vec<String>,
    /// Remote references, used when `tiffs` is empty
    pub urls: Vec<String>,
    /// Local references
    pub tiffs: Vec<String>,
    /// Threads of the load pool
    pub workers: usize,
    pub naming: Option<NamingConvention>,
    pub chunk_size: usize,
    /// Output grid of the bulk path
    pub grid: Option<GridSpec>,
}

impl Default for SubsetterConfig {
    fn default() -> Self {
        Self {
            bands: vec!["vv".to_string()],
            urls: Vec::new(),
            tiffs: Vec::new(),
            workers: 4,
            naming: None,
            chunk_size: CHUNK_SIZE,
            grid: None,
        }
    }
}

impl SubsetterConfig {
    pub fn with_urls(urls: Vec<String>) -> Self {
        Self { urls, ..Default::default() }
    }

    pub fn with_tiffs(tiffs: Vec<String>) -> Self {
        Self { tiffs, ..Default::default() }
    }

    /// References to assemble; local files win over URLs
    pub fn references(&self) -> &[String] {
        if !self.tiffs.is_empty() {
            if !self.urls.is_empty() {
                log::warn!(
                    "Both urls ({}) and tiffs ({}) given, using tiffs",
                    self.urls.len(),
                    self.tiffs.len()
                );
            }
            &self.tiffs
        } else {
            &self.urls
        }
    }
}

/// Progress of an orchestrator
#[derive(Debug, Clone, Default)]
pub enum SubsetterState {
    #[default]
    Uninitialized,
    BandsValidated,
    Assembled {
        array: DataArray,
    },
    Subset {
        array: DataArray,
        subset: DataArray,
    },
    Persisted {
        array: DataArray,
        subset: DataArray,
        path: PathBuf,
    },
}

impl SubsetterState {
    pub fn name(&self) -> &'static str {
        match self {
            SubsetterState::Uninitialized => "uninitialized",
            SubsetterState::BandsValidated => "bands-validated",
            SubsetterState::Assembled { .. } => "assembled",
            SubsetterState::Subset { .. } => "subset",
            SubsetterState::Persisted { .. } => "persisted",
        }
    }

    pub fn array(&self) -> Option<&DataArray> {
        match self {
            SubsetterState::Assembled { array }
            | SubsetterState::Subset { array, .. }
            | SubsetterState::Persisted { array, .. } => Some(array),
            _ => None,
        }
    }

    pub fn subset(&self) -> Option<&DataArray> {
        match self {
            SubsetterState::Subset { subset, .. } | SubsetterState::Persisted { subset, .. } => Some(subset),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SubsetterState::Persisted { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Assembles GrIMP products into one `(time, band, y, x)` array
pub struct Subsetter {
    config: SubsetterConfig,
    references: Vec<String>,
    bands: Vec<String>,
    opener: Arc<dyn RasterOpener>,
    pool: WorkerPool,
    state: SubsetterState,
}

impl std::fmt::Debug for Subsetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subsetter")
            .field("references", &self.references.len())
            .field("bands", &self.bands)
            .field("state", &self.state.name())
            .finish()
    }
}

impl Subsetter {
    /// Orchestrator reading through GDAL
    pub fn new(config: SubsetterConfig) -> GrimpResult<Self> {
        Self::with_opener(config, Arc::new(GdalOpener))
    }

    pub fn with_opener(config: SubsetterConfig, opener: Arc<dyn RasterOpener>) -> GrimpResult<Self> {
        let references = config.references().to_vec();
        let pool = WorkerPool::new(config.workers)?;
        let bands = validate_bands(&config.bands, None);
        log::info!(
            "Subsetter with {} references, bands {:?}, {} workers",
            references.len(),
            bands,
            pool.workers()
        );
        Ok(Self {
            config,
            references,
            bands,
            opener,
            pool,
            state: SubsetterState::Uninitialized,
        })
    }

    pub fn config(&self) -> &SubsetterConfig {
        &self.config
    }

    pub fn references(&self) -> &[String] {
        &self.references
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    pub fn state(&self) -> &SubsetterState {
        &self.state
    }

    /// Assembled array, `NotAssembled` before any load
    pub fn array(&self) -> GrimpResult<&DataArray> {
        self.state.array().ok_or(GrimpError::NotAssembled)
    }

    pub fn subset(&self) -> Option<&DataArray> {
        self.state.subset()
    }

    fn select_bands(&mut self, bands: Option<&[String]>) -> GrimpResult<Vec<&'static BandDescriptor>> {
        if let Some(requested) = bands {
            self.bands = validate_bands(requested, Some(&self.bands));
        }
        if self.bands.is_empty() {
            return Err(GrimpError::Processing("No valid bands to load".to_string()));
        }
        if self.references.is_empty() {
            return Err(GrimpError::Processing("No urls or tiffs to load".to_string()));
        }
        if self.state.array().is_none() {
            self.state = SubsetterState::BandsValidated;
        }
        Ok(descriptors(&self.bands))
    }

    /// Load every reference through the per-asset loader
    pub fn load_data_array(&mut self, bands: Option<&[String]>) -> GrimpResult<&DataArray> {
        let selected = self.select_bands(bands)?;
        log::info!(
            "Loading {} references x {} bands on {} workers",
            self.references.len(),
            selected.len(),
            self.pool.workers()
        );

        let tasks: Vec<_> = self
            .references
            .iter()
            .map(|reference| {
                open_asset(
                    reference.clone(),
                    selected.clone(),
                    Arc::clone(&self.opener),
                    self.config.naming.clone(),
                )
                .with_chunk_size(self.config.chunk_size)
            })
            .collect();
        let slices = self.pool.run_all(tasks, |task| task.run())?;
        let array = DataArray::concat(slices, ConcatAxis::Time)?;

        log::info!("Assembled array of shape {:?}", array.shape());
        self.state = SubsetterState::Assembled { array };
        self.array()
    }

    /// Load every reference through the bulk stacker
    pub fn load_stack(&mut self, bands: Option<&[String]>) -> GrimpResult<&DataArray> {
        let selected = self.select_bands(bands)?;
        log::info!(
            "Stacking {} references x {} bands",
            self.references.len(),
            selected.len()
        );

        let array = stack_assets(
            &self.references,
            &selected,
            Arc::clone(&self.opener),
            self.config.naming.as_ref(),
            self.config.chunk_size,
            self.config.grid,
        )?;

        log::info!("Assembled array of shape {:?}", array.shape());
        self.state = SubsetterState::Assembled { array };
        self.array()
    }

    pub fn assemble(&mut self, strategy: AssemblyStrategy, bands: Option<&[String]>) -> GrimpResult<&DataArray> {
        match strategy.resolve(self.references.len()) {
            AssemblyStrategy::Bulk => self.load_stack(bands),
            _ => self.load_data_array(bands),
        }
    }

    /// Extent of the assembled array's pixel-centre coordinates
    pub fn bounds(&self) -> GrimpResult<BoundingBox> {
        self.array()?.bounds()
    }

    /// Crop the assembled array to `bbox`; the previous subset is replaced
    pub fn subset_data(&mut self, bbox: &BoundingBox) -> GrimpResult<&DataArray> {
        let array = self.array()?.clone();
        let subset = array.clip_box(bbox)?;
        log::info!("Subset to {} -> {:?}", bbox, subset.shape());
        self.state = SubsetterState::Subset { array, subset };
        self.subset().ok_or(GrimpError::NotAssembled)
    }

    /// Export the full extent
    pub fn save_all(&mut self, path: impl AsRef<Path>) -> GrimpResult<Option<PathBuf>> {
        let bbox = self.bounds()?;
        self.export_to_file(path, Some(bbox), 1)
    }

    /// Write the current subset (after cropping to `bbox` when given).
    ///
    /// Without a subset nothing is written and `Ok(None)` is returned.
    pub fn export_to_file(
        &mut self,
        path: impl AsRef<Path>,
        bbox: Option<BoundingBox>,
        num_workers: usize,
    ) -> GrimpResult<Option<PathBuf>> {
        if let Some(bbox) = bbox {
            self.subset_data(&bbox)?;
        }
        let (array, subset) = match &self.state {
            SubsetterState::Subset { array, subset } | SubsetterState::Persisted { array, subset, .. } => {
                (array.clone(), subset.clone())
            }
            _ => {
                log::warn!("No subset to export, call subset_data first or pass a bounding box");
                return Ok(None);
            }
        };

        let path = nc_path(path.as_ref());
        if path.exists() {
            log::info!("Removing existing {}", path.display());
            std::fs::remove_file(&path)?;
        }

        let pool = WorkerPool::new(num_workers)?;
        export_netcdf(&subset, &path, &pool)?;

        self.state = SubsetterState::Persisted {
            array,
            subset,
            path: path.clone(),
        };
        Ok(Some(path))
    }

    /// Reopen an exported file as both the assembled array and the subset
    pub fn read_from_file(&mut self, path: impl AsRef<Path>) -> GrimpResult<&DataArray> {
        let array = reload(path.as_ref())?;
        self.state = SubsetterState::Subset {
            array: array.clone(),
            subset: array,
        };
        self.array()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryOpener;

    #[test]
    fn test_config_defaults() {
        let config = SubsetterConfig::default();
        assert_eq!(config.bands, vec!["vv"]);
        assert_eq!(config.workers, 4);
        assert_eq!(config.chunk_size, 512);
        assert!(config.references().is_empty());
    }

    #[test]
    fn test_tiffs_win_over_urls() {
        let config = SubsetterConfig {
            urls: vec!["https://host/a_vv.tif".to_string()],
            tiffs: vec!["/data/b_vv.tif".to_string()],
            ..Default::default()
        };
        assert_eq!(config.references(), &["/data/b_vv.tif".to_string()]);
        assert_eq!(SubsetterConfig::with_urls(vec!["u".to_string()]).references(), &["u".to_string()]);
    }

    #[test]
    fn test_auto_strategy_threshold() {
        assert_eq!(AssemblyStrategy::Auto.resolve(0), AssemblyStrategy::Lazy);
        assert_eq!(AssemblyStrategy::Auto.resolve(BULK_ASSET_THRESHOLD - 1), AssemblyStrategy::Lazy);
        assert_eq!(AssemblyStrategy::Auto.resolve(BULK_ASSET_THRESHOLD), AssemblyStrategy::Bulk);
        assert_eq!(AssemblyStrategy::Lazy.resolve(1000), AssemblyStrategy::Lazy);
        assert_eq!(AssemblyStrategy::Bulk.resolve(1), AssemblyStrategy::Bulk);
    }

    #[test]
    fn test_requires_assembly() {
        let mut subsetter =
            Subsetter::with_opener(SubsetterConfig::default(), Arc::new(MemoryOpener::new())).unwrap();
        assert!(matches!(subsetter.bounds(), Err(GrimpError::NotAssembled)));
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert!(matches!(subsetter.subset_data(&bbox), Err(GrimpError::NotAssembled)));
        assert!(matches!(subsetter.save_all("/tmp/never"), Err(GrimpError::NotAssembled)));
        assert_eq!(subsetter.state().name(), "uninitialized");
    }

    #[test]
    fn test_invalid_bands_filtered_at_construction() {
        let config = SubsetterConfig {
            bands: vec!["vx".to_string(), "speed".to_string()],
            ..Default::default()
        };
        let subsetter = Subsetter::with_opener(config, Arc::new(MemoryOpener::new())).unwrap();
        assert_eq!(subsetter.bands(), &["vx".to_string()]);
    }
}
