//! Listener settings for continuous sessions.
//!
//! A [`ListenerSettings`] snapshot is passed once to `start_listening` and held
//! unchanged for the lifetime of that session. Defaults follow the platform
//! location manager defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default deferral distance in meters.
pub const DEFAULT_DEFERRAL_DISTANCE_M: f64 = 500.0;

/// Default deferral time.
pub const DEFAULT_DEFERRAL_TIME: Duration = Duration::from_secs(5 * 60);

/// Activity hint used to decide when updates may be paused automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    /// Unknown activity.
    #[default]
    Other,
    /// Driving navigation.
    AutomotiveNavigation,
    /// Walking, running, cycling.
    Fitness,
    /// Other navigation such as boats or trains.
    OtherNavigation,
}

/// Power/accuracy trade-off hint for the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerPriority {
    /// Best accuracy with no additional power use.
    NoPower,
    /// City level accuracy, about 10 km.
    LowPower,
    /// Block level accuracy, about 100 m.
    BalancedPowerAccuracy,
    /// The most accurate locations available.
    #[default]
    HighAccuracy,
}

/// Settings for one continuous listening session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Allow updates while the application is in the background.
    pub allow_background_updates: bool,

    /// Let the platform pause updates when the location is unlikely to change.
    pub pause_automatically: bool,

    /// Activity hint for automatic pausing.
    pub activity_type: ActivityType,

    /// Only report significant location changes.
    pub listen_for_significant_changes_only: bool,

    /// Defer updates until an energy efficient time or the deferral
    /// thresholds are met.
    pub defer_updates: bool,

    /// Distance to travel before deferred updates are delivered. `None` waits
    /// indefinitely.
    pub deferral_distance_m: Option<f64>,

    /// Time to elapse before deferred updates are delivered. `None` waits
    /// indefinitely.
    #[serde(with = "optional_duration_secs")]
    pub deferral_time: Option<Duration>,

    /// The fastest rate at which updates will be delivered.
    #[serde(with = "optional_duration_secs")]
    pub fastest_interval: Option<Duration>,

    /// Maximum time to wait between updates.
    #[serde(with = "optional_duration_secs")]
    pub max_wait_time: Option<Duration>,

    /// Power/accuracy hint.
    pub priority: ListenerPriority,

    /// Require "always" rather than "when in use" location permission.
    pub require_location_always_permission: bool,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            allow_background_updates: false,
            pause_automatically: true,
            activity_type: ActivityType::Other,
            listen_for_significant_changes_only: false,
            defer_updates: false,
            deferral_distance_m: Some(DEFAULT_DEFERRAL_DISTANCE_M),
            deferral_time: Some(DEFAULT_DEFERRAL_TIME),
            fastest_interval: None,
            max_wait_time: None,
            priority: ListenerPriority::HighAccuracy,
            require_location_always_permission: false,
        }
    }
}

impl ListenerSettings {
    /// Settings that defer updates with the default thresholds.
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            defer_updates: true,
            ..Self::default()
        }
    }
}

mod optional_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ListenerSettings::default();
        assert!(!settings.allow_background_updates);
        assert!(settings.pause_automatically);
        assert_eq!(settings.activity_type, ActivityType::Other);
        assert!(!settings.listen_for_significant_changes_only);
        assert!(!settings.defer_updates);
        assert_eq!(settings.deferral_distance_m, Some(500.0));
        assert_eq!(settings.deferral_time, Some(Duration::from_secs(300)));
        assert_eq!(settings.priority, ListenerPriority::HighAccuracy);
    }

    #[test]
    fn test_deferred_keeps_default_thresholds() {
        let settings = ListenerSettings::deferred();
        assert!(settings.defer_updates);
        assert_eq!(settings.deferral_distance_m, Some(DEFAULT_DEFERRAL_DISTANCE_M));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: ListenerSettings =
            serde_json::from_str(r#"{"defer_updates": true, "deferral_time": 60}"#).unwrap();
        assert!(settings.defer_updates);
        assert_eq!(settings.deferral_time, Some(Duration::from_secs(60)));
        assert!(settings.pause_automatically);
    }

    #[test]
    fn test_null_deferral_means_indefinite() {
        let settings: ListenerSettings =
            serde_json::from_str(r#"{"deferral_distance_m": null, "deferral_time": null}"#)
                .unwrap();
        assert_eq!(settings.deferral_distance_m, None);
        assert_eq!(settings.deferral_time, None);
    }

    #[test]
    fn test_negative_duration_is_rejected() {
        let result: Result<ListenerSettings, _> =
            serde_json::from_str(r#"{"max_wait_time": -1.0}"#);
        assert!(result.is_err());
    }
}
