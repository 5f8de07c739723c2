//! Native location provider capability.
//!
//! A [`ProviderSource`] is the one interface each platform adapter implements
//! (Android location manager, CoreLocation, Windows Geolocator, ...). The core
//! subscribes to named providers through it and receives [`ProviderEvent`]s
//! on whatever thread the platform delivers them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::GeolocationError;
use crate::position::Position;
use crate::settings::ListenerSettings;

#[cfg(any(test, feature = "mock-provider"))]
pub mod mock;

/// Name of a native provider, e.g. `"gps"`, `"network"`, `"fused"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a provider id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The provider name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ProviderId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A raw location sample from one provider, before arbitration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// Provider that produced the sample.
    pub provider: ProviderId,
    /// The sample itself.
    pub position: Position,
}

impl Fix {
    /// Create a fix.
    pub fn new(provider: impl Into<ProviderId>, position: Position) -> Self {
        Self {
            provider: provider.into(),
            position,
        }
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn time_millis(&self) -> i64 {
        self.position.timestamp.timestamp_millis()
    }

    /// Horizontal accuracy in meters. An unreported accuracy reads as
    /// `f64::INFINITY`, the worst possible value.
    #[must_use]
    pub fn accuracy_meters(&self) -> f64 {
        self.position.accuracy.unwrap_or(f64::INFINITY)
    }
}

/// Availability transitions a provider can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// The provider is (again) able to produce fixes.
    Available,
    /// The provider stopped producing fixes. When every provider of a
    /// subscription is out of service the position is unavailable.
    OutOfService,
    /// The platform reported that no location data can be obtained.
    NoData,
    /// Location access was disabled or revoked.
    Disabled,
}

impl ProviderStatus {
    /// The error this status raises on its own, independent of other
    /// providers.
    #[must_use]
    pub const fn fatal_error(self) -> Option<GeolocationError> {
        match self {
            Self::Available | Self::OutOfService => None,
            Self::NoData => Some(GeolocationError::PositionUnavailable),
            Self::Disabled => Some(GeolocationError::Unauthorized),
        }
    }
}

/// Events a provider delivers to a subscription's sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A new raw fix.
    Fix(Fix),
    /// A compass heading update, in degrees from true north.
    Heading(f64),
    /// A provider availability transition.
    Status {
        /// The provider whose status changed.
        provider: ProviderId,
        /// The new status.
        status: ProviderStatus,
    },
    /// A batch of deferred updates has been delivered.
    DeferredUpdatesFinished,
}

/// Callback a provider invokes for each event. May be called from any thread.
pub type EventSink = Arc<dyn Fn(ProviderEvent) + Send + Sync>;

/// Opaque handle for one provider subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Filter parameters passed to a provider when subscribing.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    /// Minimum time between updates.
    pub min_time: Duration,
    /// Minimum distance in meters between updates.
    pub min_distance_m: f64,
    /// Desired accuracy in meters. `0.0` asks for the best the provider can do.
    pub desired_accuracy_m: f64,
    /// Whether heading updates should be produced.
    pub include_heading: bool,
    /// Listener settings for continuous sessions; `None` for single-shot.
    pub settings: Option<ListenerSettings>,
}

impl UpdateRequest {
    /// Request used by single-shot acquisition: no time or distance filter.
    #[must_use]
    pub const fn single_shot(desired_accuracy_m: f64, include_heading: bool) -> Self {
        Self {
            min_time: Duration::ZERO,
            min_distance_m: 0.0,
            desired_accuracy_m,
            include_heading,
            settings: None,
        }
    }
}

/// Errors a provider capability can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The platform refused the call for lack of permission.
    #[error("Provider access denied by the platform")]
    Unauthorized,

    /// No provider with this name exists.
    #[error("Unknown location provider: '{0}'")]
    UnknownProvider(ProviderId),

    /// The subscription id is not active.
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    /// The provider does not support the requested operation.
    #[error("Operation not supported by provider: {message}")]
    Unsupported {
        /// Description of the unsupported operation.
        message: String,
    },

    /// Any other platform failure.
    #[error("Provider failure: {message}")]
    Internal {
        /// Platform error description.
        message: String,
    },
}

/// A native location subsystem.
///
/// Implementations must tolerate [`unsubscribe`](Self::unsubscribe) being
/// called from inside an event callback, and must not hold internal locks
/// while invoking a sink.
pub trait ProviderSource: Send + Sync + 'static {
    /// Every provider on the device, enabled or not.
    fn providers(&self) -> Vec<ProviderId>;

    /// Whether the named provider is currently enabled.
    fn is_enabled(&self, provider: &ProviderId) -> bool;

    /// The platform's cached last fix for the provider.
    fn last_known_fix(&self, provider: &ProviderId) -> Option<Fix>;

    /// Whether the device can report heading.
    fn supports_heading(&self) -> bool;

    /// Start delivering events for `provider` to `sink`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the platform rejects the subscription.
    fn subscribe(
        &self,
        provider: &ProviderId,
        request: &UpdateRequest,
        sink: EventSink,
    ) -> Result<SubscriptionId, ProviderError>;

    /// Stop a subscription.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the platform fails to remove it.
    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ProviderError>;

    /// Whether the platform can coalesce fixes for power saving.
    fn supports_deferred_updates(&self) -> bool {
        false
    }

    /// Ask the platform to defer delivery until `distance_m` has been travelled
    /// or `time` has elapsed. `None` waits indefinitely on that axis.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if deferral cannot be enabled.
    fn allow_deferred_updates(
        &self,
        _subscription: SubscriptionId,
        _distance_m: Option<f64>,
        _time: Option<Duration>,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            message: "deferred updates".to_string(),
        })
    }

    /// Cancel any pending deferral.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if deferral cannot be disabled.
    fn disallow_deferred_updates(&self, _subscription: SubscriptionId) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Unsubscribes every id, logging and swallowing failures.
pub(crate) fn unsubscribe_all(
    source: &dyn ProviderSource,
    subscriptions: impl IntoIterator<Item = SubscriptionId>,
) {
    for id in subscriptions {
        if let Err(e) = source.unsubscribe(id) {
            tracing::warn!(subscription = %id, error = %e, "Unable to remove location updates");
        }
    }
}
