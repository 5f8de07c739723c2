//! Unified error types for the geolocator core library.
//!
//! This module provides a unified error type [`GeolocatorError`] that covers all failure
//! modes across the geolocator. Each module also has its own specific error types
//! ([`ConfigError`](crate::config::ConfigError), [`ProviderError`](crate::provider::ProviderError),
//! [`GeocodingError`](crate::geocoding::GeocodingError))
//! that convert into it.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Cancellation is not failure**: `Canceled` and `TimedOut` are outcomes, not
//!   geolocation errors, and are classified separately
//! - **Context preservation**: Wrapped errors maintain their original context
//!
//! # Example
//!
//! ```rust
//! use geolocator_core::error::{GeolocationError, GeolocatorError, Result};
//!
//! fn require_fix(found: bool) -> Result<()> {
//!     if !found {
//!         return Err(GeolocationError::PositionUnavailable.into());
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_fix(false).unwrap_err().is_geolocation_error());
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Geolocation failure carried both by a typed failure and by the
/// `PositionError` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum GeolocationError {
    /// No provider produced a usable fix, or every provider went away.
    #[error("Position unavailable: no location provider produced a usable fix")]
    PositionUnavailable,

    /// Location permission was denied or revoked.
    #[error("Unauthorized: location permission was denied or revoked")]
    Unauthorized,
}

/// The unified error type for all geolocator operations.
#[derive(Debug, Error)]
pub enum GeolocatorError {
    // =========================================================================
    // GEOLOCATION ERRORS
    // =========================================================================
    /// A typed geolocation failure.
    #[error("A geolocation error occurred: {0}")]
    Geolocation(#[from] GeolocationError),

    // =========================================================================
    // CALLER ERRORS
    // =========================================================================
    /// An argument was out of range or otherwise invalid.
    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument {
        /// Name of the offending argument.
        name: &'static str,
        /// Why the value was rejected.
        message: String,
    },

    /// `start_listening` was called while a session is already active.
    #[error("This geolocator is already listening. Call stop_listening first.")]
    AlreadyListening,

    // =========================================================================
    // CANCELLATION OUTCOMES
    // =========================================================================
    /// The caller's cancellation signal fired before a position resolved.
    #[error("Position request was canceled")]
    Canceled,

    /// The timeout elapsed before any fix was seen.
    #[error("Position request timed out before any fix arrived")]
    TimedOut,

    // =========================================================================
    // GEOCODING ERRORS
    // =========================================================================
    /// No geocoder was configured on this geolocator.
    #[error("No geocoder is configured for address lookups")]
    GeocoderUnavailable,

    /// The geocoder failed.
    #[error("Geocoding failed: {0}")]
    Geocoding(crate::geocoding::GeocodingError),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration could not be read or parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),
}

/// A specialized [`Result`] type for geolocator operations.
pub type Result<T> = std::result::Result<T, GeolocatorError>;

impl GeolocatorError {
    /// Builds an [`GeolocatorError::InvalidArgument`].
    pub(crate) fn invalid_argument(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            message: message.into(),
        }
    }

    /// Returns the carried [`GeolocationError`], if any.
    #[must_use]
    pub const fn geolocation_error(&self) -> Option<GeolocationError> {
        match self {
            Self::Geolocation(e) => Some(*e),
            _ => None,
        }
    }

    /// Returns `true` if this is a typed geolocation failure.
    #[inline]
    #[must_use]
    pub const fn is_geolocation_error(&self) -> bool {
        matches!(self, Self::Geolocation(_))
    }

    /// Returns `true` if the request ended by cancellation or timeout rather
    /// than by a hard failure.
    #[inline]
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::TimedOut)
    }

    /// Returns `true` if the caller passed an invalid argument or called an
    /// operation in the wrong state.
    #[inline]
    #[must_use]
    pub const fn is_argument_error(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. } | Self::AlreadyListening)
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Geolocation(GeolocationError::PositionUnavailable) => "POSITION_UNAVAILABLE",
            Self::Geolocation(GeolocationError::Unauthorized) => "UNAUTHORIZED",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::AlreadyListening => "ALREADY_LISTENING",
            Self::Canceled => "CANCELED",
            Self::TimedOut => "TIMED_OUT",
            Self::GeocoderUnavailable => "GEOCODER_UNAVAILABLE",
            Self::Geocoding(_) => "GEOCODING_FAILED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

/// A provider that refuses access is `Unauthorized`; any other provider
/// failure leaves the position unavailable.
impl From<crate::provider::ProviderError> for GeolocatorError {
    fn from(err: crate::provider::ProviderError) -> Self {
        use crate::provider::ProviderError;
        match err {
            ProviderError::Unauthorized => Self::Geolocation(GeolocationError::Unauthorized),
            _ => Self::Geolocation(GeolocationError::PositionUnavailable),
        }
    }
}

impl From<crate::geocoding::GeocodingError> for GeolocatorError {
    fn from(err: crate::geocoding::GeocodingError) -> Self {
        Self::Geocoding(err)
    }
}

impl From<crate::config::ConfigError> for GeolocatorError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
