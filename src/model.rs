use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;

use crate::errors::{AppError, AppResult};

/// Two coordinates closer than this (in degrees) are considered equal.
pub const COORDINATE_TOLERANCE: f64 = 0.000001;

/// Name of a district as it appears in the source dataset. Equality is exact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DistrictName(String);

impl DistrictName {
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::InvalidDistrict(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DistrictName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DistrictName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    lat: f64,
    lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> AppResult<Self> {
        let valid = lat.is_finite()
            && lon.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lon);
        if !valid {
            return Err(AppError::InvalidCoordinate { lat, lon });
        }
        Ok(Self { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    pub fn approx_eq(&self, other: &Coordinate) -> bool {
        (self.lat - other.lat).abs() <= COORDINATE_TOLERANCE
            && (self.lon - other.lon).abs() <= COORDINATE_TOLERANCE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cached,
    FreshlyResolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinateRecord {
    pub name: DistrictName,
    pub coordinate: Coordinate,
    pub source: ResolutionSource,
}

impl CoordinateRecord {
    pub fn cached(name: DistrictName, coordinate: Coordinate) -> Self {
        Self {
            name,
            coordinate,
            source: ResolutionSource::Cached,
        }
    }

    pub fn resolved(name: DistrictName, coordinate: Coordinate) -> Self {
        Self {
            name,
            coordinate,
            source: ResolutionSource::FreshlyResolved,
        }
    }
}
