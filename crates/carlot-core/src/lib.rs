//! Core domain model for the car lot catalog: stored records, scraped listings, coercion rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("{field} is not an integer: {value:?}")]
    NotAnInteger { field: &'static str, value: String },
    #[error("{field} is not a number: {value:?}")]
    NotANumber { field: &'static str, value: String },
    #[error("{0} is required")]
    Required(&'static str),
    #[error("unknown status {0:?} (expected available, pending or sold)")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CarStatus {
    #[default]
    Available,
    Pending,
    Sold,
}

impl CarStatus {
    pub const ALL: [CarStatus; 3] = [CarStatus::Available, CarStatus::Pending, CarStatus::Sold];

    pub fn as_str(&self) -> &'static str {
        match self {
            CarStatus::Available => "available",
            CarStatus::Pending => "pending",
            CarStatus::Sold => "sold",
        }
    }
}

impl fmt::Display for CarStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CarStatus {
    type Err = CoercionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        CarStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CoercionError::UnknownStatus(trimmed.to_string()))
    }
}

/// Persisted catalog row. `id` is assigned by the store and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Car {
    pub id: i64,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: f64,
    pub mileage: i64,
    pub status: CarStatus,
    pub vin: Option<String>,
    pub image_url: Option<String>,
    pub link: Option<String>,
}

/// Field set for inserts and edits; everything except the identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCar {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: f64,
    pub mileage: i64,
    pub status: CarStatus,
    pub vin: Option<String>,
    pub image_url: Option<String>,
    pub link: Option<String>,
}

impl NewCar {
    /// Collapses blank optional text to `None` so rows without a VIN never share `""`.
    pub fn normalized(mut self) -> Self {
        self.vin = non_blank(self.vin);
        self.image_url = non_blank(self.image_url);
        self.link = non_blank(self.link);
        self
    }
}

pub fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// A numeric value as it came off the page or out of a JSON feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for RawNumber {
    fn from(value: i64) -> Self {
        RawNumber::Int(value)
    }
}

impl From<f64> for RawNumber {
    fn from(value: f64) -> Self {
        RawNumber::Float(value)
    }
}

impl From<&str> for RawNumber {
    fn from(value: &str) -> Self {
        RawNumber::Text(value.to_string())
    }
}

impl fmt::Display for RawNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawNumber::Int(v) => write!(f, "{v}"),
            RawNumber::Float(v) => write!(f, "{v:?}"),
            RawNumber::Text(v) => f.write_str(v),
        }
    }
}

/// Handoff contract from scrapers into the sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub make: String,
    pub model: String,
    pub year: RawNumber,
    #[serde(default)]
    pub price: Option<RawNumber>,
    #[serde(default)]
    pub mileage: Option<RawNumber>,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl RawListing {
    /// VIN to match on, if the listing carries a non-blank one.
    pub fn vin(&self) -> Option<&str> {
        self.vin.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn year(&self) -> i32 {
        coerce_year(&self.year)
    }

    /// Builds the row the sync job inserts when nothing in the catalog matches.
    pub fn to_new_car(&self) -> Result<NewCar, CoercionError> {
        Ok(NewCar {
            make: self.make.clone(),
            model: self.model.clone(),
            year: self.year(),
            price: coerce_price(self.price.as_ref())?,
            mileage: coerce_mileage(self.mileage.as_ref())?,
            status: CarStatus::Available,
            vin: self.vin().map(str::to_string),
            image_url: self.image_url.clone(),
            link: self.link.clone(),
        }
        .normalized())
    }
}

/// Digit strings and non-negative integers become the year; anything else is 0.
pub fn coerce_year(value: &RawNumber) -> i32 {
    match value {
        RawNumber::Int(v) => i32::try_from(*v).ok().filter(|y| *y >= 0).unwrap_or(0),
        RawNumber::Float(_) => 0,
        RawNumber::Text(s) => {
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                s.parse().unwrap_or(0)
            } else {
                0
            }
        }
    }
}

/// Absent mileage is 0; fractional mileage truncates; unparseable text is an error.
pub fn coerce_mileage(value: Option<&RawNumber>) -> Result<i64, CoercionError> {
    let malformed = |value: String| CoercionError::NotAnInteger {
        field: "mileage",
        value,
    };
    match value {
        None => Ok(0),
        Some(RawNumber::Int(v)) => Ok(*v),
        Some(RawNumber::Float(v)) if v.is_finite() => Ok(v.trunc() as i64),
        Some(RawNumber::Float(v)) => Err(malformed(v.to_string())),
        Some(RawNumber::Text(s)) => s.trim().parse().map_err(|_| malformed(s.clone())),
    }
}

/// Absent price is 0.0; unparseable or non-finite text is an error.
pub fn coerce_price(value: Option<&RawNumber>) -> Result<f64, CoercionError> {
    let malformed = |value: String| CoercionError::NotANumber {
        field: "price",
        value,
    };
    match value {
        None => Ok(0.0),
        Some(RawNumber::Int(v)) => Ok(*v as f64),
        Some(RawNumber::Float(v)) if v.is_finite() => Ok(*v),
        Some(RawNumber::Float(v)) => Err(malformed(v.to_string())),
        Some(RawNumber::Text(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| malformed(s.clone())),
    }
}
