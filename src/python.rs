//! Python bindings

use crate::core::subsetter::{AssemblyStrategy, Subsetter, SubsetterConfig};
use crate::types::{BoundingBox, GrimpError};
use numpy::{IntoPyArray, PyArray4};
use pyo3::prelude::*;
use std::collections::HashMap;

fn to_py_err(e: GrimpError) -> PyErr {
    match e {
        GrimpError::InvalidBand { .. }
        | GrimpError::NamingConvention { .. }
        | GrimpError::NoDataInBounds(_)
        | GrimpError::MisalignedGrid(_) => PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e)),
        _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
    }
}

fn bbox_from_dict(bbox: &HashMap<String, f64>) -> PyResult<BoundingBox> {
    let key = |name: &str| {
        bbox.get(name).copied().ok_or_else(|| {
            PyErr::new::<pyo3::exceptions::PyKeyError, _>(format!("bbox is missing '{}'", name))
        })
    };
    Ok(BoundingBox::new(key("minx")?, key("miny")?, key("maxx")?, key("maxy")?))
}

/// Python module definition
#[pymodule]
fn grimp(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PySubsetter>()?;
    m.add("BULK_ASSET_THRESHOLD", crate::core::subsetter::BULK_ASSET_THRESHOLD)?;
    Ok(())
}

/// Python wrapper for Subsetter
#[pyclass(name = "Subsetter")]
struct PySubsetter {
    inner: Subsetter,
}

#[pymethods]
impl PySubsetter {
    #[new]
    #[pyo3(signature = (bands=None, urls=None, tiffs=None, workers=4))]
    fn new(
        bands: Option<Vec<String>>,
        urls: Option<Vec<String>>,
        tiffs: Option<Vec<String>>,
        workers: usize,
    ) -> PyResult<Self> {
        let defaults = SubsetterConfig::default();
        let config = SubsetterConfig {
            bands: bands.unwrap_or(defaults.bands),
            urls: urls.unwrap_or_default(),
            tiffs: tiffs.unwrap_or_default(),
            workers,
            ..Default::default()
        };
        let inner = Subsetter::new(config).map_err(to_py_err)?;
        Ok(PySubsetter { inner })
    }

    #[getter]
    fn bands(&self) -> Vec<String> {
        self.inner.bands().to_vec()
    }

    #[getter]
    fn state(&self) -> &'static str {
        self.inner.state().name()
    }

    /// Returns the `(time, band, y, x)` shape
    #[pyo3(signature = (bands=None))]
    fn load_data_array(&mut self, bands: Option<Vec<String>>) -> PyResult<(usize, usize, usize, usize)> {
        let array = self.inner.load_data_array(bands.as_deref()).map_err(to_py_err)?;
        Ok(array.shape())
    }

    #[pyo3(signature = (bands=None))]
    fn load_stack(&mut self, bands: Option<Vec<String>>) -> PyResult<(usize, usize, usize, usize)> {
        let array = self.inner.load_stack(bands.as_deref()).map_err(to_py_err)?;
        Ok(array.shape())
    }

    #[pyo3(signature = (strategy="auto", bands=None))]
    fn assemble(&mut self, strategy: &str, bands: Option<Vec<String>>) -> PyResult<(usize, usize, usize, usize)> {
        let strategy = match strategy.to_lowercase().as_str() {
            "lazy" => AssemblyStrategy::Lazy,
            "bulk" => AssemblyStrategy::Bulk,
            "auto" => AssemblyStrategy::Auto,
            _ => {
                return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                    "Invalid strategy: {}",
                    strategy
                )))
            }
        };
        let array = self.inner.assemble(strategy, bands.as_deref()).map_err(to_py_err)?;
        Ok(array.shape())
    }

    fn get_bounds(&self) -> PyResult<HashMap<String, f64>> {
        let bbox = self.inner.bounds().map_err(to_py_err)?;
        Ok(bbox.to_pairs().iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    fn sub_set_data(&mut self, bbox: HashMap<String, f64>) -> PyResult<(usize, usize, usize, usize)> {
        let bbox = bbox_from_dict(&bbox)?;
        let subset = self.inner.subset_data(&bbox).map_err(to_py_err)?;
        Ok(subset.shape())
    }

    fn save_all(&mut self, path: String) -> PyResult<Option<String>> {
        let path = self.inner.save_all(&path).map_err(to_py_err)?;
        Ok(path.map(|p| p.display().to_string()))
    }

    #[pyo3(signature = (path, bbox=None, num_workers=1))]
    fn export(&mut self, path: String, bbox: Option<HashMap<String, f64>>, num_workers: usize) -> PyResult<Option<String>> {
        let bbox = bbox.as_ref().map(bbox_from_dict).transpose()?;
        let path = self.inner.export_to_file(&path, bbox, num_workers).map_err(to_py_err)?;
        Ok(path.map(|p| p.display().to_string()))
    }

    fn read_from_file(&mut self, path: String) -> PyResult<(usize, usize, usize, usize)> {
        let array = self.inner.read_from_file(&path).map_err(to_py_err)?;
        Ok(array.shape())
    }

    /// Materialize the subset, or the assembled array when there is none
    fn values<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray4<f64>> {
        let array = match self.inner.subset() {
            Some(subset) => subset,
            None => self.inner.array().map_err(to_py_err)?,
        };
        let values = array.load().map_err(to_py_err)?;
        Ok(values.into_pyarray(py))
    }

    fn __repr__(&self) -> String {
        format!(
            "Subsetter(references={}, bands={:?}, state='{}')",
            self.inner.references().len(),
            self.inner.bands(),
            self.inner.state().name()
        )
    }
}
