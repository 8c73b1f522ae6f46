//! Band registry for GrIMP products
//!
//! Every band id maps to the token used in its file names, the template token
//! shared by all bands of its product family, the no-data sentinel written by
//! the producers, and (for mosaic products) the native data type and
//! resolution.

use crate::types::{DataType, GrimpError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical product family a band belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductFamily {
    Velocity,
    Image,
    Gamma0,
    Sigma0,
}

impl ProductFamily {
    /// Name used for the data variable of assembled arrays
    pub fn name(&self) -> &'static str {
        match self {
            ProductFamily::Velocity => "velocity",
            ProductFamily::Image => "image",
            ProductFamily::Gamma0 => "gamma0",
            ProductFamily::Sigma0 => "sigma0",
        }
    }

    /// Band whose file names appear in catalog search results
    pub fn template(&self) -> &'static str {
        match self {
            ProductFamily::Velocity => "vv",
            ProductFamily::Image => "image",
            ProductFamily::Gamma0 => "gamma0",
            ProductFamily::Sigma0 => "sigma0",
        }
    }

    pub fn default_bands(&self) -> &'static [&'static str] {
        match self {
            ProductFamily::Velocity => &["vv", "vx", "vy"],
            ProductFamily::Image => &["image"],
            ProductFamily::Gamma0 => &["gamma0"],
            ProductFamily::Sigma0 => &["sigma0"],
        }
    }

    /// Fixed polar stereographic grid of the family's Greenland-wide mosaics
    pub fn mosaic_grid(&self) -> crate::core::stack::GridSpec {
        use crate::core::stack::GridSpec;
        use crate::types::BoundingBox;

        match self {
            ProductFamily::Velocity => GridSpec {
                epsg: 3413,
                resolution: 200.0,
                bounds: BoundingBox::new(-659100.0, -3379100.0, 857900.0, -639100.0),
            },
            family => GridSpec {
                epsg: 3413,
                resolution: lookup_band(family.template())
                    .and_then(|b| b.resolution)
                    .unwrap_or(50.0),
                bounds: BoundingBox::new(-626000.0, -3356000.0, 850000.0, -695000.0),
            },
        }
    }
}

impl fmt::Display for ProductFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Static description of one band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandDescriptor {
    pub id: &'static str,
    /// Token of the family's template band in file names
    pub template: &'static str,
    pub no_data: f64,
    pub dtype: Option<DataType>,
    /// Native resolution in meters
    pub resolution: Option<f64>,
    pub family: ProductFamily,
}

impl BandDescriptor {
    /// Token identifying this band's own file
    pub fn token(&self) -> &'static str {
        self.id
    }
}

// NSIDC-0481 (TSX individual glacier) velocities are 100 m, other velocity
// products 200 m, so velocity bands carry no fixed resolution.
static BAND_REGISTRY: [BandDescriptor; 9] = [
    BandDescriptor { id: "vv", template: "vv", no_data: -1.0, dtype: None, resolution: None, family: ProductFamily::Velocity },
    BandDescriptor { id: "vx", template: "vv", no_data: -2.0e9, dtype: None, resolution: None, family: ProductFamily::Velocity },
    BandDescriptor { id: "vy", template: "vv", no_data: -2.0e9, dtype: None, resolution: None, family: ProductFamily::Velocity },
    BandDescriptor { id: "ex", template: "vv", no_data: -1.0, dtype: None, resolution: None, family: ProductFamily::Velocity },
    BandDescriptor { id: "ey", template: "vv", no_data: -1.0, dtype: None, resolution: None, family: ProductFamily::Velocity },
    BandDescriptor { id: "dT", template: "vv", no_data: -2.0e9, dtype: None, resolution: None, family: ProductFamily::Velocity },
    BandDescriptor { id: "image", template: "image", no_data: 0.0, dtype: Some(DataType::UInt8), resolution: Some(25.0), family: ProductFamily::Image },
    BandDescriptor { id: "gamma0", template: "gamma0", no_data: -30.0, dtype: Some(DataType::Float32), resolution: Some(50.0), family: ProductFamily::Gamma0 },
    BandDescriptor { id: "sigma0", template: "sigma0", no_data: -30.0, dtype: Some(DataType::Float32), resolution: Some(50.0), family: ProductFamily::Sigma0 },
];

/// All registered bands, in registry order
pub fn registry() -> &'static [BandDescriptor] {
    &BAND_REGISTRY
}

pub fn band_ids() -> Vec<String> {
    BAND_REGISTRY.iter().map(|b| b.id.to_string()).collect()
}

pub fn lookup_band(id: &str) -> Option<&'static BandDescriptor> {
    BAND_REGISTRY.iter().find(|b| b.id == id)
}

/// Resolve ids that already passed validation
pub fn descriptors(ids: &[String]) -> Vec<&'static BandDescriptor> {
    ids.iter().filter_map(|id| lookup_band(id)).collect()
}

/// Named band groups offered by the catalog search dashboard
pub fn preset_bands(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "speed" => Some(&["vv"]),
        "velocity" => Some(&["vv", "vx", "vy"]),
        "velocity+errors" => Some(&["vv", "vx", "vy", "ex", "ey"]),
        "all" => Some(&["vv", "vx", "vy", "ex", "ey", "dT"]),
        "image" => Some(&["image"]),
        "gamma0" => Some(&["gamma0"]),
        "sigma0" => Some(&["sigma0"]),
        _ => None,
    }
}

/// Outcome of checking a requested band list against the registry
#[derive(Debug)]
pub struct BandSelection {
    pub accepted: Vec<String>,
    /// One `GrimpError::InvalidBand` per dropped entry
    pub rejected: Vec<GrimpError>,
}

/// Check a band request, keeping valid ids in order and collecting rejects.
///
/// An empty request falls back to `previous` when one is active.
pub fn check_bands<S: AsRef<str>>(requested: &[S], previous: Option<&[String]>) -> BandSelection {
    if requested.is_empty() {
        if let Some(previous) = previous {
            return BandSelection {
                accepted: previous.to_vec(),
                rejected: Vec::new(),
            };
        }
    }

    let mut accepted = Vec::with_capacity(requested.len());
    let mut rejected = Vec::new();
    for band in requested {
        let band = band.as_ref();
        if lookup_band(band).is_some() {
            accepted.push(band.to_string());
        } else {
            let error = GrimpError::InvalidBand {
                band: band.to_string(),
                allowed: band_ids(),
            };
            log::warn!("{}", error);
            rejected.push(error);
        }
    }

    BandSelection { accepted, rejected }
}

/// Validate requested bands; invalid entries are logged and dropped
pub fn validate_bands<S: AsRef<str>>(requested: &[S], previous: Option<&[String]>) -> Vec<String> {
    check_bands(requested, previous).accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_subsets_pass_through() {
        let requested = ["vy", "vv", "sigma0"];
        let selection = check_bands(&requested, None);
        assert_eq!(selection.accepted, vec!["vy", "vv", "sigma0"]);
        assert!(selection.rejected.is_empty());

        for band in registry() {
            let selection = check_bands(&[band.id], None);
            assert_eq!(selection.accepted, vec![band.id.to_string()]);
            assert!(selection.rejected.is_empty());
        }
    }

    #[test]
    fn test_invalid_bands_dropped_with_one_warning_each() {
        let requested = ["vv", "bogus", "vx", "VV", "browse"];
        let selection = check_bands(&requested, None);
        assert_eq!(selection.accepted, vec!["vv", "vx"]);
        assert_eq!(selection.rejected.len(), 3);
        match &selection.rejected[0] {
            GrimpError::InvalidBand { band, allowed } => {
                assert_eq!(band, "bogus");
                assert_eq!(allowed.len(), registry().len());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_request_keeps_previous() {
        let previous = vec!["vx".to_string(), "vy".to_string()];
        let empty: [&str; 0] = [];
        assert_eq!(validate_bands(&empty, Some(&previous)), previous);
        assert!(validate_bands(&empty, None).is_empty());
    }

    #[test]
    fn test_registry_lookup() {
        let vx = lookup_band("vx").unwrap();
        assert_eq!(vx.template, "vv");
        assert_eq!(vx.no_data, -2.0e9);
        assert_eq!(vx.family, ProductFamily::Velocity);

        let image = lookup_band("image").unwrap();
        assert_eq!(image.dtype, Some(DataType::UInt8));
        assert_eq!(image.resolution, Some(25.0));
        assert!(lookup_band("browse").is_none());
    }

    #[test]
    fn test_presets_resolve_to_registry() {
        for name in ["speed", "velocity", "velocity+errors", "all", "image", "gamma0", "sigma0"] {
            let bands = preset_bands(name).unwrap();
            assert!(bands.iter().all(|b| lookup_band(b).is_some()));
        }
        assert!(preset_bands("termini").is_none());
        assert_eq!(ProductFamily::Velocity.default_bands(), preset_bands("velocity").unwrap());
    }

    #[test]
    fn test_family_mosaic_grids() {
        let grid = ProductFamily::Gamma0.mosaic_grid();
        assert_eq!(grid.epsg, 3413);
        assert_eq!(grid.resolution, 50.0);
        assert_eq!(ProductFamily::Image.mosaic_grid().resolution, 25.0);
        assert_eq!(ProductFamily::Velocity.mosaic_grid().resolution, 200.0);
    }
}
