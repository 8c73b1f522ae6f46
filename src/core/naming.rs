//! File-name conventions of GrIMP products
//!
//! Dates are read from fixed positions established by the producing
//! pipeline, and sibling band files are located by swapping the template
//! band token in the file name.

use crate::types::{GrimpError, GrimpResult, Timestamp};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Date token formats written by the producers
const DATE_FORMATS: [&str; 5] = ["%d%b%y", "%d%b%Y", "%Y-%m-%d", "%Y%m%d", "%Y.%m.%d"];

/// One or two acquisition dates of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionTimes {
    pub time1: Timestamp,
    pub time2: Option<Timestamp>,
}

impl AcquisitionTimes {
    pub fn single(time: Timestamp) -> Self {
        Self { time1: time, time2: None }
    }

    pub fn pair(time1: Timestamp, time2: Timestamp) -> Self {
        Self { time1, time2: Some(time2) }
    }

    /// Midpoint of the interval, or the single date
    pub fn representative(&self) -> Timestamp {
        match self.time2 {
            Some(time2) => self.time1 + (time2 - self.time1) / 2,
            None => self.time1,
        }
    }
}

/// Where the dates of an asset are encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamingConvention {
    /// Two `_`-delimited date fields of the file name
    FilenameFields { first: usize, second: usize },
    /// `<prefix><date>.<date>` in the directory `depth` levels above the file
    DirectoryPair { prefix: String, depth: usize },
    /// Single `YYYY.MM.DD` date in the directory `depth` levels above the file
    DirectoryDate { depth: usize },
}

impl NamingConvention {
    /// Mosaic and annual products: `GL_vel_mosaic_Annual_01Dec20_30Nov21_vv_v03.0.tif`
    pub fn filename_fields() -> Self {
        NamingConvention::FilenameFields { first: 4, second: 5 }
    }

    /// Individual glacier products: `.../Vel-2009-01-27.2009-02-07/<track>/<file>`
    pub fn directory_pair() -> Self {
        NamingConvention::DirectoryPair {
            prefix: "Vel-".to_string(),
            depth: 2,
        }
    }

    /// Catalog mosaics staged under `.../NSIDC-0723.003/2016.01.01/<file>`
    pub fn directory_date() -> Self {
        NamingConvention::DirectoryDate { depth: 1 }
    }

    /// Conventions tried, in order, when none is configured
    pub fn known() -> Vec<NamingConvention> {
        vec![
            Self::filename_fields(),
            Self::directory_pair(),
            Self::directory_date(),
        ]
    }

    /// Parse the dates of `reference` under this convention
    pub fn parse(&self, reference: &str) -> GrimpResult<AcquisitionTimes> {
        match self {
            NamingConvention::FilenameFields { first, second } => {
                let name = file_name(reference);
                let fields: Vec<&str> = name.split('_').collect();
                let token = |index: usize| {
                    fields
                        .get(index)
                        .copied()
                        .map(|f| f.split('.').next().unwrap_or(f))
                        .ok_or_else(|| {
                            GrimpError::naming(
                                reference,
                                format!("expected a date in field {} of '{}'", index, name),
                            )
                        })
                };
                let time1 = parse_date_token(token(*first)?)
                    .ok_or_else(|| GrimpError::naming(reference, format!("field {} is not a date", first)))?;
                let time2 = parse_date_token(token(*second)?)
                    .ok_or_else(|| GrimpError::naming(reference, format!("field {} is not a date", second)))?;
                Ok(AcquisitionTimes::pair(time1, time2))
            }
            NamingConvention::DirectoryPair { prefix, depth } => {
                let dir = directory_component(reference, *depth)?;
                let stripped = dir.strip_prefix(prefix.as_str()).ok_or_else(|| {
                    GrimpError::naming(reference, format!("directory '{}' lacks prefix '{}'", dir, prefix))
                })?;
                let mut parts = stripped.split('.');
                let (first, second) = match (parts.next(), parts.next(), parts.next()) {
                    (Some(a), Some(b), None) => (a, b),
                    _ => {
                        return Err(GrimpError::naming(
                            reference,
                            format!("directory '{}' is not <start>.<end>", dir),
                        ))
                    }
                };
                let time1 = parse_date_token(first)
                    .ok_or_else(|| GrimpError::naming(reference, format!("'{}' is not a date", first)))?;
                let time2 = parse_date_token(second)
                    .ok_or_else(|| GrimpError::naming(reference, format!("'{}' is not a date", second)))?;
                Ok(AcquisitionTimes::pair(time1, time2))
            }
            NamingConvention::DirectoryDate { depth } => {
                let dir = directory_component(reference, *depth)?;
                let pattern = Regex::new(r"^\d{4}\.\d{2}\.\d{2}$")
                    .map_err(|e| GrimpError::Processing(format!("Regex error: {}", e)))?;
                if !pattern.is_match(dir) {
                    return Err(GrimpError::naming(
                        reference,
                        format!("directory '{}' is not YYYY.MM.DD", dir),
                    ));
                }
                let date = NaiveDate::parse_from_str(dir, "%Y.%m.%d")
                    .map_err(|e| GrimpError::naming(reference, e.to_string()))?;
                Ok(AcquisitionTimes::single(midnight(date)))
            }
        }
    }
}

/// Parse dates with `convention`, or with the first known convention that matches
pub fn parse_dates(reference: &str, convention: Option<&NamingConvention>) -> GrimpResult<AcquisitionTimes> {
    if let Some(convention) = convention {
        return convention.parse(reference);
    }

    let mut reasons = Vec::new();
    for convention in NamingConvention::known() {
        match convention.parse(reference) {
            Ok(times) => {
                log::debug!("{} parsed with {:?}", reference, convention);
                return Ok(times);
            }
            Err(GrimpError::NamingConvention { reason, .. }) => reasons.push(reason),
            Err(e) => return Err(e),
        }
    }

    Err(GrimpError::naming(reference, reasons.join("; ")))
}

/// Parse one date token in any of the producer formats
pub fn parse_date_token(token: &str) -> Option<Timestamp> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(token, format).ok())
        .map(midnight)
}

fn midnight(date: NaiveDate) -> Timestamp {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

/// Last path component of a local path or URL
pub fn file_name(reference: &str) -> &str {
    let trimmed = reference.split(['?', '#']).next().unwrap_or(reference);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn directory_component(reference: &str, depth: usize) -> GrimpResult<&str> {
    let trimmed = reference.split(['?', '#']).next().unwrap_or(reference);
    let components: Vec<&str> = trimmed.split('/').filter(|c| !c.is_empty()).collect();
    if depth == 0 || components.len() <= depth {
        return Err(GrimpError::naming(
            reference,
            format!("no directory {} levels above the file", depth),
        ));
    }
    Ok(components[components.len() - 1 - depth])
}

/// Swap the template band token for `band` in the file name of `reference`.
///
/// Only whole `_`-delimited fields of the file name are replaced; a field may
/// carry the extension (`vv.tif`).
pub fn substitute_band(reference: &str, template: &str, band: &str) -> GrimpResult<String> {
    let trimmed = reference.split(['?', '#']).next().unwrap_or(reference);
    let name = file_name(reference);
    let (head, rest) = reference.split_at(trimmed.len() - name.len());
    let tail = &rest[name.len()..];

    let mut found = false;
    let fields: Vec<String> = name
        .split('_')
        .map(|field| {
            if field == template {
                found = true;
                band.to_string()
            } else if let Some(suffix) = field.strip_prefix(template).filter(|s| s.starts_with('.')) {
                found = true;
                format!("{}{}", band, suffix)
            } else {
                field.to_string()
            }
        })
        .collect();

    if !found {
        return Err(GrimpError::naming(
            reference,
            format!("template token '{}' not found in '{}'", template, name),
        ));
    }

    Ok(format!("{}{}{}", head, fields.join("_"), tail))
}
