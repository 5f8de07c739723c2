//! Address lookup capability.
//!
//! Reverse and forward geocoding are network-backed collaborators; the
//! geolocator only delegates to whichever [`Geocoder`] it was built with.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permission::BoxFuture;
use crate::position::Position;

/// A postal address produced by a geocoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// ISO country code.
    pub country_code: Option<String>,
    /// Country name.
    pub country_name: Option<String>,
    /// Feature name, e.g. a building or landmark.
    pub feature_name: Option<String>,
    /// Postal code.
    pub postal_code: Option<String>,
    /// Neighbourhood or district.
    pub sub_locality: Option<String>,
    /// City or town.
    pub locality: Option<String>,
    /// Street name.
    pub thoroughfare: Option<String>,
    /// House number.
    pub sub_thoroughfare: Option<String>,
    /// State or province.
    pub admin_area: Option<String>,
    /// County or region.
    pub sub_admin_area: Option<String>,
}

/// Failures reported by a [`Geocoder`] backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeocodingError {
    /// The backend needs a map service key and none was given.
    #[error("A map service key is required for this lookup")]
    MissingMapKey,

    /// The geocoding service could not be reached.
    #[error("Geocoding service unreachable: {0}")]
    Unreachable(String),

    /// The service answered with an error.
    #[error("Geocoding service error: {0}")]
    Service(String),
}

/// A geocoding backend.
pub trait Geocoder: Send + Sync + 'static {
    /// Reverse geocode: addresses near a position.
    fn addresses_for_position<'a>(
        &'a self,
        position: &'a Position,
        map_key: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<Address>, GeocodingError>>;

    /// Forward geocode: positions matching an address query.
    fn positions_for_address<'a>(
        &'a self,
        address: &'a str,
        map_key: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<Position>, GeocodingError>>;
}
