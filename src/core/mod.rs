//! Core assembly modules

pub mod array;
pub mod bands;
pub mod loader;
pub mod naming;
pub mod scheduler;
pub mod stack;
pub mod subsetter;

// Re-export main types
pub use array::{pixel_centers, ConcatAxis, DataArray, Plane};
pub use bands::{check_bands, lookup_band, preset_bands, registry, validate_bands, BandDescriptor, BandSelection, ProductFamily};
pub use loader::{open_asset, AssetTask};
pub use naming::{parse_dates, substitute_band, AcquisitionTimes, NamingConvention};
pub use scheduler::WorkerPool;
pub use stack::{construct_stack_items, item_template, stack, stack_assets, GridSpec, StackItem, StackOptions, XyCoords};
pub use subsetter::{AssemblyStrategy, Subsetter, SubsetterConfig, SubsetterState, BULK_ASSET_THRESHOLD};
