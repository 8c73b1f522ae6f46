use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::DriverManager;
use grimp::core::subsetter::{Subsetter, SubsetterConfig};
use grimp::io::raster::{GdalRaster, PixelWindow, RasterSource};
use grimp::types::{BoundingBox, DataType};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ROWS: usize = 20;
const COLS: usize = 30;
const TRANSFORM: [f64; 6] = [-300000.0, 200.0, 0.0, -2500000.0, 0.0, -200.0];

fn write_band(path: &Path, offset: f32, no_data: f64) {
    let driver = DriverManager::get_driver_by_name("GTiff").expect("GTiff driver not available");
    let mut dataset = driver
        .create_with_band_type::<f32, _>(path, COLS as isize, ROWS as isize, 1)
        .expect("Failed to create GeoTIFF");
    dataset.set_geo_transform(&TRANSFORM).expect("Failed to set transform");
    let srs = SpatialRef::from_epsg(3413).expect("Failed to build EPSG:3413");
    dataset.set_spatial_ref(&srs).expect("Failed to set CRS");

    let data: Vec<f32> = (0..ROWS * COLS).map(|i| offset + i as f32).collect();
    let mut band = dataset.rasterband(1).expect("Failed to get band");
    band.set_no_data_value(Some(no_data)).expect("Failed to set no-data");
    band.write((0, 0), (COLS, ROWS), &Buffer { size: (COLS, ROWS), data })
        .expect("Failed to write band");
}

/// Writes vv/vx files of two time slices, returns the vv references
fn write_products(dir: &Path) -> Vec<String> {
    let mut references = Vec::new();
    for (t, dates) in ["01Dec19_30Nov20", "01Dec20_30Nov21"].iter().enumerate() {
        for (b, (band, no_data)) in [("vv", -1.0), ("vx", -2.0e9)].iter().enumerate() {
            let name = format!("GL_vel_mosaic_Annual_{}_{}_v03.0.tif", dates, band);
            write_band(&dir.join(&name), (t * 10000 + b * 1000) as f32, *no_data);
        }
        let vv: PathBuf = dir.join(format!("GL_vel_mosaic_Annual_{}_vv_v03.0.tif", dates));
        references.push(vv.display().to_string());
    }
    references
}

#[test]
fn test_gdal_raster_reads_header_and_windows() {
    let dir = TempDir::new().unwrap();
    let references = write_products(dir.path());

    let raster = GdalRaster::open(&references[0]).expect("Failed to open GeoTIFF");
    let info = raster.info();
    assert_eq!((info.width, info.height), (COLS, ROWS));
    assert_eq!(info.geo_transform, TRANSFORM);
    assert_eq!(info.data_type(), DataType::Float32);
    assert_eq!(info.bands[0].no_data, Some(-1.0));
    assert_eq!(info.crs.as_ref().and_then(|c| c.epsg), Some(3413));

    let window = raster.read_window(1, PixelWindow::new(2, 3, 2, 2)).expect("Failed to read window");
    assert_eq!(window, ndarray::arr2(&[[63.0, 64.0], [93.0, 94.0]]));
}

#[test]
fn test_load_export_reload_geotiffs() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let references = write_products(dir.path());

    let config = SubsetterConfig {
        bands: vec!["vv".to_string(), "vx".to_string()],
        tiffs: references.clone(),
        workers: 2,
        ..Default::default()
    };
    let mut subsetter = Subsetter::new(config).expect("Failed to create subsetter");
    let lazy = subsetter.load_data_array(None).expect("Failed to load GeoTIFFs").clone();
    assert_eq!(lazy.shape(), (2, 2, ROWS, COLS));
    assert_eq!(lazy.dtype, DataType::Float32);
    assert_eq!(lazy.crs.as_ref().and_then(|c| c.epsg), Some(3413));
    assert_eq!(lazy.x[0], -299900.0);
    assert_eq!(lazy.y[0], -2500100.0);

    let values = lazy.load().expect("Failed to materialize");
    assert_eq!(values[[1, 1, 0, 0]], 11000.0);
    assert_eq!(values[[0, 0, 19, 29]], 599.0);

    let bulk = subsetter.load_stack(None).expect("Failed to stack GeoTIFFs").clone();
    assert_eq!(bulk.shape(), lazy.shape());
    assert_eq!(bulk.x, lazy.x);
    assert_eq!(bulk.load().unwrap(), values);

    let bbox = BoundingBox::new(-299000.0, -2502000.0, -297000.0, -2500500.0);
    let path = subsetter
        .export_to_file(dir.path().join("greenland_subset"), Some(bbox), 2)
        .expect("Failed to export")
        .expect("Expected a written file");
    assert!(path.to_string_lossy().ends_with("greenland_subset.nc"));
    let subset = subsetter.subset().unwrap().clone();

    let reloaded = subsetter.read_from_file(&path).expect("Failed to reload").clone();
    assert_eq!(reloaded.shape(), subset.shape());
    assert_eq!(reloaded.crs.as_ref().and_then(|c| c.epsg), Some(3413));
    assert_eq!(reloaded.load().unwrap(), subset.load().unwrap());
}
