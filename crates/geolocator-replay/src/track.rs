//! Recorded location tracks.
//!
//! A track lists the providers of a simulated device and a timeline of
//! provider events, each stamped with a millisecond offset from the start of
//! the replay. Tracks are read from JSON or TOML, chosen by file extension.
//!
//! ```toml
//! [[providers]]
//! name = "gps"
//!
//! [[events]]
//! kind = "fix"
//! provider = "gps"
//! offset_ms = 0
//! latitude = 46.52
//! longitude = 6.63
//! accuracy = 35.0
//!
//! [[events]]
//! kind = "status"
//! provider = "gps"
//! offset_ms = 4000
//! status = "out_of_service"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use geolocator_core::{Fix, MockProvider, Position, ProviderStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors from loading a track.
#[derive(Debug, Error)]
pub enum TrackError {
    /// The file could not be read.
    #[error("Failed to read track {}: {source}", path.display())]
    Io {
        /// Track path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for a track.
    #[error("Invalid JSON track: {0}")]
    Json(#[from] serde_json::Error),

    /// The file is not valid TOML for a track.
    #[error("Invalid TOML track: {0}")]
    Toml(#[from] toml::de::Error),

    /// The extension is neither `.json` nor `.toml`.
    #[error("Unsupported track format '{0}', expected .json or .toml")]
    UnsupportedFormat(String),

    /// The track is structurally wrong.
    #[error("Invalid track: {0}")]
    Invalid(String),
}

/// A simulated provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackProvider {
    /// Provider name, e.g. `gps`.
    pub name: String,
    /// Whether the provider starts enabled.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

const fn enabled_by_default() -> bool {
    true
}

/// One timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackEvent {
    /// A raw fix.
    Fix {
        /// Emitting provider.
        provider: String,
        /// Offset from replay start.
        offset_ms: u64,
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
        /// Horizontal accuracy in meters.
        #[serde(default)]
        accuracy: Option<f64>,
        /// Altitude in meters.
        #[serde(default)]
        altitude: Option<f64>,
        /// Heading in degrees.
        #[serde(default)]
        heading: Option<f64>,
        /// Speed in meters per second.
        #[serde(default)]
        speed: Option<f64>,
    },
    /// A provider status change.
    Status {
        /// Affected provider.
        provider: String,
        /// Offset from replay start.
        offset_ms: u64,
        /// New status.
        status: ProviderStatus,
    },
    /// A compass heading.
    Heading {
        /// Offset from replay start.
        offset_ms: u64,
        /// Degrees from true north.
        degrees: f64,
    },
    /// End of a deferred batch.
    DeferredFinished {
        /// Offset from replay start.
        offset_ms: u64,
    },
}

impl TrackEvent {
    /// Offset from replay start.
    #[must_use]
    pub const fn offset(&self) -> Duration {
        match self {
            Self::Fix { offset_ms, .. }
            | Self::Status { offset_ms, .. }
            | Self::Heading { offset_ms, .. }
            | Self::DeferredFinished { offset_ms } => Duration::from_millis(*offset_ms),
        }
    }
}

/// A recorded track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Providers on the simulated device.
    pub providers: Vec<TrackProvider>,
    /// Timeline, sorted by offset after loading.
    #[serde(default)]
    pub events: Vec<TrackEvent>,
}

impl Track {
    /// Load a track, picking the format from the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails
    /// [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrackError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let contents = std::fs::read_to_string(path).map_err(|source| TrackError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut track: Self = match extension.as_str() {
            "json" => serde_json::from_str(&contents)?,
            "toml" => toml::from_str(&contents)?,
            other => return Err(TrackError::UnsupportedFormat(other.to_string())),
        };
        track.validate()?;
        track.events.sort_by_key(TrackEvent::offset);
        Ok(track)
    }

    /// Check that the track is usable.
    ///
    /// # Errors
    ///
    /// Returns [`TrackError::Invalid`] if there are no providers or an event
    /// names an unknown provider.
    pub fn validate(&self) -> Result<(), TrackError> {
        if self.providers.is_empty() {
            return Err(TrackError::Invalid("at least one provider is required".to_string()));
        }
        let known = |name: &str| self.providers.iter().any(|p| p.name == name);
        for event in &self.events {
            if let TrackEvent::Fix { provider, .. } | TrackEvent::Status { provider, .. } = event {
                if !known(provider) {
                    return Err(TrackError::Invalid(format!("unknown provider '{provider}'")));
                }
            }
        }
        Ok(())
    }

    /// A mock source with this track's providers.
    #[must_use]
    pub fn build_source(&self) -> MockProvider {
        let mock = MockProvider::new();
        for provider in &self.providers {
            mock.add_provider(provider.name.as_str(), provider.enabled);
        }
        mock
    }

    /// Emit every event into `mock` at its offset from now. Fix timestamps
    /// are `start` plus the offset.
    pub async fn play(&self, mock: &MockProvider, start: DateTime<Utc>, cancel: &CancellationToken) {
        let origin = tokio::time::Instant::now();
        for event in &self.events {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep_until(origin + event.offset()) => {}
            }
            debug!(?event, "Replaying event");
            emit(mock, event, start);
        }
    }
}

fn emit(mock: &MockProvider, event: &TrackEvent, start: DateTime<Utc>) {
    match event {
        TrackEvent::Fix {
            provider,
            offset_ms,
            latitude,
            longitude,
            accuracy,
            altitude,
            heading,
            speed,
        } => {
            let offset = chrono::Duration::milliseconds(i64::try_from(*offset_ms).unwrap_or(i64::MAX));
            let mut position = Position::new(start + offset, *latitude, *longitude);
            position.accuracy = *accuracy;
            position.altitude = *altitude;
            position.heading = *heading;
            position.speed = *speed;
            mock.emit_fix(Fix::new(provider.as_str(), position));
        }
        TrackEvent::Status {
            provider, status, ..
        } => mock.emit_status(provider.as_str(), *status),
        TrackEvent::Heading { degrees, .. } => mock.emit_heading(*degrees),
        TrackEvent::DeferredFinished { .. } => mock.emit_deferred_finished(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geolocator_core::{ProviderEvent, ProviderId, ProviderSource, UpdateRequest};
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn write_track(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const TOML_TRACK: &str = r#"
[[providers]]
name = "gps"

[[providers]]
name = "network"
enabled = false

[[events]]
kind = "status"
provider = "gps"
offset_ms = 3000
status = "out_of_service"

[[events]]
kind = "fix"
provider = "gps"
offset_ms = 0
latitude = 46.52
longitude = 6.63
accuracy = 35.0
"#;

    #[test]
    fn test_load_toml_sorts_events() {
        let file = write_track(".toml", TOML_TRACK);
        let track = Track::load(file.path()).unwrap();

        assert_eq!(track.providers.len(), 2);
        assert!(!track.providers[1].enabled);
        assert_eq!(track.events[0].offset(), Duration::ZERO);
        assert!(matches!(track.events[1], TrackEvent::Status { .. }));
    }

    #[test]
    fn test_load_json() {
        let file = write_track(
            ".json",
            r#"{
                "providers": [{"name": "fused"}],
                "events": [
                    {"kind": "fix", "provider": "fused", "offset_ms": 10, "latitude": 1.0, "longitude": 2.0},
                    {"kind": "heading", "offset_ms": 20, "degrees": 90.0}
                ]
            }"#,
        );
        let track = Track::load(file.path()).unwrap();
        assert_eq!(track.events.len(), 2);
        assert!(track.providers[0].enabled);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let file = write_track(".yaml", "providers: []");
        assert!(matches!(
            Track::load(file.path()),
            Err(TrackError::UnsupportedFormat(ext)) if ext == "yaml"
        ));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let file = write_track(
            ".json",
            r#"{"providers": [{"name": "gps"}], "events": [{"kind": "status", "provider": "wifi", "offset_ms": 0, "status": "disabled"}]}"#,
        );
        assert!(matches!(Track::load(file.path()), Err(TrackError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Track::load(dir.path().join("absent.json")),
            Err(TrackError::Io { .. })
        ));
    }

    #[test]
    fn test_build_source_registers_providers() {
        let file = write_track(".toml", TOML_TRACK);
        let mock = Track::load(file.path()).unwrap().build_source();
        assert!(mock.is_enabled(&ProviderId::new("gps")));
        assert!(!mock.is_enabled(&ProviderId::new("network")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_emits_in_order_with_offsets() {
        let file = write_track(".toml", TOML_TRACK);
        let track = Track::load(file.path()).unwrap();
        let mock = track.build_source();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        mock.subscribe(
            &ProviderId::new("gps"),
            &UpdateRequest::single_shot(10.0, false),
            Arc::new(move |event| sink_seen.lock().unwrap().push(event)),
        )
        .unwrap();

        let start = Utc::now();
        let begun = tokio::time::Instant::now();
        track.play(&mock, start, &CancellationToken::new()).await;

        assert!(begun.elapsed() >= Duration::from_secs(3));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        match &seen[0] {
            ProviderEvent::Fix(fix) => {
                assert_eq!(fix.position.timestamp, start);
                assert_eq!(fix.position.accuracy, Some(35.0));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_stops_on_cancel() {
        let file = write_track(".toml", TOML_TRACK);
        let track = Track::load(file.path()).unwrap();
        let mock = track.build_source();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let begun = tokio::time::Instant::now();
        track.play(&mock, Utc::now(), &cancel).await;
        assert!(begun.elapsed() < Duration::from_secs(3));
    }
}
