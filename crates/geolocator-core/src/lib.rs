//! # geolocator-core
//!
//! Core location acquisition logic for the cross-platform geolocator.
//!
//! This crate provides:
//! - Fix arbitration between competing location providers
//! - Single-shot position acquisition with timeout and cancellation
//! - Continuous listening sessions with change and error events
//! - Configuration management (desired accuracy, provider allow-lists)
//!
//! Platform adapters implement [`ProviderSource`] (and optionally
//! [`PermissionChecker`] and [`Geocoder`]); everything else is written once
//! here against those interfaces.
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`position`] - Position samples and distance helpers
//! - [`comparator`] - Decides whether a new fix supersedes the current best
//! - [`provider`] - The native provider capability and its event contract
//! - [`permission`] - Location permission capability
//! - [`geocoding`] - Address lookup capability
//! - [`settings`] - Listening session settings
//! - [`single_shot`] - One-off position requests
//! - [`geolocator`] - The public facade
//! - [`events`] - Position change/error notification
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Unified error types for the crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use geolocator_core::{Geolocator, PositionRequest, ProviderSource};
//!
//! async fn locate(source: Arc<dyn ProviderSource>) -> geolocator_core::Result<()> {
//!     let geolocator = Geolocator::new(source)?;
//!     let position = geolocator
//!         .get_position(PositionRequest::new().with_timeout(Duration::from_secs(10)))
//!         .await?;
//!     println!("{:?}", position.coordinate);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod comparator;
pub mod config;
pub mod error;
pub mod events;
pub mod geocoding;
pub mod geolocator;
pub mod permission;
pub mod position;
pub mod provider;
mod session;
pub mod settings;
pub mod single_shot;

// Re-export primary types for convenience
pub use comparator::{is_better_fix, BestFix};
pub use config::{default_config_path, ConfigError, ConfigResult, GeolocatorConfig};
pub use error::{GeolocationError, GeolocatorError, Result};
pub use events::{GeolocatorEvent, HandlerId};
pub use geocoding::{Address, Geocoder, GeocodingError};
pub use geolocator::{Geolocator, GeolocatorBuilder};
pub use permission::{BoxFuture, PermissionChecker, PermissionLevel, PermissionStatus, StaticPermission};
pub use position::{calculate_distance, Coordinate, DistanceUnits, Position};
#[cfg(any(test, feature = "mock-provider"))]
pub use provider::mock::MockProvider;
pub use provider::{
    EventSink, Fix, ProviderError, ProviderEvent, ProviderId, ProviderSource, ProviderStatus,
    SubscriptionId, UpdateRequest,
};
pub use settings::{ActivityType, ListenerPriority, ListenerSettings};
pub use single_shot::PositionRequest;
