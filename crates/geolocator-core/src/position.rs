//! Position model and distance helpers.
//!
//! A [`Position`] is a single location sample. Every optional measurement is
//! an `Option`, so "speed unknown" and "0 m/s" are different values. Positions
//! are `Clone` values; adapters hand out copies across event boundaries and
//! never share the native backing object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statute miles per degree of great-circle arc.
const MILES_PER_DEGREE: f64 = 60.0 * 1.1515;

const KILOMETERS_PER_MILE: f64 = 1.609_344;
const MILES_PER_KILOMETER: f64 = 0.621_371_19;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Coordinate {
    /// Create a coordinate.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in the requested units.
    #[must_use]
    pub fn distance_to(&self, other: &Self, units: DistanceUnits) -> f64 {
        calculate_distance(*self, *other, units)
    }
}

/// A single location sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// When the sample was taken (UTC).
    pub timestamp: DateTime<Utc>,

    /// Latitude and longitude, if the provider reported them.
    pub coordinate: Option<Coordinate>,

    /// Altitude in meters relative to sea level.
    pub altitude: Option<f64>,

    /// Horizontal error radius in meters.
    pub accuracy: Option<f64>,

    /// Vertical error range in meters. Several platforms never report it.
    pub altitude_accuracy: Option<f64>,

    /// Heading in degrees relative to true north.
    pub heading: Option<f64>,

    /// Speed in meters per second.
    pub speed: Option<f64>,

    /// Whether the sample came from a mock (spoofing) provider.
    #[serde(default)]
    pub is_from_mock_provider: bool,
}

impl Position {
    /// Create a position with only a timestamp and coordinate.
    #[must_use]
    pub const fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            coordinate: Some(Coordinate::new(latitude, longitude)),
            altitude: None,
            accuracy: None,
            altitude_accuracy: None,
            heading: None,
            speed: None,
            is_from_mock_provider: false,
        }
    }

    /// Create a position stamped with the current time.
    #[must_use]
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self::new(Utc::now(), latitude, longitude)
    }

    /// Create a position that carries a timestamp and nothing else.
    #[must_use]
    pub const fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            coordinate: None,
            altitude: None,
            accuracy: None,
            altitude_accuracy: None,
            heading: None,
            speed: None,
            is_from_mock_provider: false,
        }
    }

    /// Set the horizontal accuracy in meters.
    #[must_use]
    pub const fn with_accuracy(mut self, meters: f64) -> Self {
        self.accuracy = Some(meters);
        self
    }

    /// Set the altitude in meters.
    #[must_use]
    pub const fn with_altitude(mut self, meters: f64) -> Self {
        self.altitude = Some(meters);
        self
    }

    /// Set the vertical accuracy in meters.
    #[must_use]
    pub const fn with_altitude_accuracy(mut self, meters: f64) -> Self {
        self.altitude_accuracy = Some(meters);
        self
    }

    /// Set the heading in degrees from true north.
    #[must_use]
    pub const fn with_heading(mut self, degrees: f64) -> Self {
        self.heading = Some(degrees);
        self
    }

    /// Set the speed in meters per second.
    #[must_use]
    pub const fn with_speed(mut self, meters_per_second: f64) -> Self {
        self.speed = Some(meters_per_second);
        self
    }

    /// Mark the sample as coming from a mock provider.
    #[must_use]
    pub const fn from_mock_provider(mut self) -> Self {
        self.is_from_mock_provider = true;
        self
    }

    /// Whether latitude and longitude are valid.
    #[must_use]
    pub const fn has_latitude_longitude(&self) -> bool {
        self.coordinate.is_some()
    }

    /// Whether the altitude is valid.
    #[must_use]
    pub const fn has_altitude(&self) -> bool {
        self.altitude.is_some()
    }

    /// Whether the horizontal accuracy is valid.
    #[must_use]
    pub const fn has_accuracy(&self) -> bool {
        self.accuracy.is_some()
    }

    /// Whether the heading is valid.
    #[must_use]
    pub const fn has_heading(&self) -> bool {
        self.heading.is_some()
    }

    /// Whether the speed is valid.
    #[must_use]
    pub const fn has_speed(&self) -> bool {
        self.speed.is_some()
    }

    /// Distance to `other`, or `None` if either position lacks a coordinate.
    #[must_use]
    pub fn distance_to(&self, other: &Self, units: DistanceUnits) -> Option<f64> {
        match (self.coordinate, other.coordinate) {
            (Some(a), Some(b)) => Some(calculate_distance(a, b, units)),
            _ => None,
        }
    }
}

/// Units for [`calculate_distance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceUnits {
    /// Kilometers.
    Kilometers,
    /// Statute miles.
    #[default]
    Miles,
}

/// Great-circle distance between two coordinates.
///
/// Identical coordinates, and inputs that produce a non-finite or negative
/// result, yield `0.0`.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn calculate_distance(start: Coordinate, end: Coordinate, units: DistanceUnits) -> f64 {
    if start.latitude == end.latitude && start.longitude == end.longitude {
        return 0.0;
    }

    let rlat1 = start.latitude.to_radians();
    let rlat2 = end.latitude.to_radians();
    let rtheta = (start.longitude - end.longitude).to_radians();

    let cos_arc = rlat2
        .sin()
        .mul_add(rlat1.sin(), rlat1.cos() * rlat2.cos() * rtheta.cos());
    let miles = cos_arc.acos().to_degrees() * MILES_PER_DEGREE;

    if !miles.is_finite() || miles < 0.0 {
        return 0.0;
    }

    match units {
        DistanceUnits::Miles => miles,
        DistanceUnits::Kilometers => miles_to_kilometers(miles),
    }
}

/// Convert miles to kilometers.
#[must_use]
pub fn miles_to_kilometers(miles: f64) -> f64 {
    miles * KILOMETERS_PER_MILE
}

/// Convert kilometers to miles.
#[must_use]
pub fn kilometers_to_miles(kilometers: f64) -> f64 {
    kilometers * MILES_PER_KILOMETER
}
