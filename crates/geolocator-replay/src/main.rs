//! # geolocator-replay
//!
//! Replays a recorded location track through a [`Geolocator`] backed by the
//! in-process mock provider, logging every resolved position and event.
//!
//! ## Running
//!
//! ```bash
//! # Resolve one position from the track
//! cargo run --package geolocator-replay -- track.toml --once --timeout-ms 5000
//!
//! # Run a listening session for the length of the track
//! cargo run --package geolocator-replay -- track.json --listen --min-distance 5
//! ```
//!
//! # Environment Variables
//!
//! - `GEOLOCATOR_ENV`: Optional. `production` for JSON file logging
//! - `GEOLOCATOR_LOG_LEVEL`: Optional. Filter when `RUST_LOG` is unset (default: info)
//! - `GEOLOCATOR_*`: Overrides for [`GeolocatorConfig`] fields

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use geolocator_core::{
    default_config_path, Geolocator, GeolocatorConfig, GeolocatorEvent, ListenerSettings,
    PositionRequest, ProviderSource,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod logging;
mod track;

use track::Track;

/// Default timeout for `--once`.
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Command line errors.
#[derive(Debug, thiserror::Error)]
enum ArgsError {
    #[error("usage: geolocator-replay <track.json|track.toml> [--once|--listen] [--timeout-ms N] [--min-time-ms N] [--min-distance M] [--heading] [--defer] [--config PATH]")]
    Usage,

    #[error("missing value for {0}")]
    MissingValue(&'static str),

    #[error("invalid value '{value}' for {flag}")]
    InvalidValue { flag: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Once,
    Listen,
}

#[derive(Debug, Clone, PartialEq)]
struct ReplayArgs {
    track: PathBuf,
    mode: Mode,
    timeout: Duration,
    min_time: Duration,
    min_distance_m: f64,
    include_heading: bool,
    defer: bool,
    config: Option<PathBuf>,
}

impl ReplayArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, ArgsError> {
        let mut track = None;
        let mut parsed = Self {
            track: PathBuf::new(),
            mode: Mode::Once,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            min_time: Duration::ZERO,
            min_distance_m: 0.0,
            include_heading: false,
            defer: false,
            config: None,
        };

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--once" => parsed.mode = Mode::Once,
                "--listen" => parsed.mode = Mode::Listen,
                "--heading" => parsed.include_heading = true,
                "--defer" => parsed.defer = true,
                "--timeout-ms" => {
                    parsed.timeout = Duration::from_millis(number(&mut args, "--timeout-ms")?);
                }
                "--min-time-ms" => {
                    parsed.min_time = Duration::from_millis(number(&mut args, "--min-time-ms")?);
                }
                "--min-distance" => parsed.min_distance_m = number(&mut args, "--min-distance")?,
                "--config" => {
                    let path = args.next().ok_or(ArgsError::MissingValue("--config"))?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "-h" | "--help" => return Err(ArgsError::Usage),
                other if other.starts_with("--") => return Err(ArgsError::Usage),
                other => track = Some(PathBuf::from(other)),
            }
        }

        parsed.track = track.ok_or(ArgsError::Usage)?;
        Ok(parsed)
    }
}

fn number<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<T, ArgsError> {
    let value = args.next().ok_or(ArgsError::MissingValue(flag))?;
    value
        .parse()
        .map_err(|_| ArgsError::InvalidValue { flag, value })
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GeolocatorConfig> {
    let config = match path {
        Some(path) => GeolocatorConfig::load(path)?,
        None => GeolocatorConfig::load_or_default(default_config_path()?)?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    let args = ReplayArgs::parse(std::env::args().skip(1))?;
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let track = Track::load(&args.track)
        .with_context(|| format!("Failed to load track {}", args.track.display()))?;

    info!(
        track = %args.track.display(),
        mode = ?args.mode,
        providers = track.providers.len(),
        events = track.events.len(),
        "Starting geolocator-replay"
    );

    let mock = Arc::new(track.build_source());
    mock.set_supports_heading(args.include_heading);
    mock.set_supports_deferred_updates(args.defer);
    let geolocator = Geolocator::builder(Arc::clone(&mock) as Arc<dyn ProviderSource>)
        .config(config)
        .build()?;

    let cancel = CancellationToken::new();
    let reporter = tokio::spawn(report_events(geolocator.subscribe(), cancel.clone()));

    let player = {
        let (mock, track, cancel) = (Arc::clone(&mock), track.clone(), cancel.clone());
        async move { track.play(&mock, Utc::now(), &cancel).await }
    };

    match args.mode {
        Mode::Once => {
            let request = PositionRequest::new()
                .with_timeout(args.timeout)
                .with_heading(args.include_heading)
                .with_cancellation(cancel.clone());
            let (result, ()) = tokio::join!(
                async {
                    let result = geolocator.get_position(request).await;
                    cancel.cancel();
                    result
                },
                player
            );
            match result {
                Ok(position) => info!(?position, "Resolved position"),
                Err(e) if e.is_cancellation() => warn!(error = %e, "No position before the track ended"),
                Err(e) => error!(code = e.error_code(), error = %e, "Position request failed"),
            }
        }
        Mode::Listen => {
            let settings = ListenerSettings {
                defer_updates: args.defer,
                ..ListenerSettings::default()
            };
            geolocator
                .start_listening(args.min_time, args.min_distance_m, args.include_heading, Some(settings))
                .await?;
            player.await;
            geolocator.stop_listening().await;
            cancel.cancel();
        }
    }

    reporter.await?;
    info!("Replay finished");
    Ok(())
}

async fn report_events(
    mut events: broadcast::Receiver<GeolocatorEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            // Drain what is buffered before honouring cancellation.
            biased;
            event = events.recv() => match event {
                Ok(GeolocatorEvent::PositionChanged(position)) => {
                    info!(
                        coordinate = ?position.coordinate,
                        accuracy = ?position.accuracy,
                        heading = ?position.heading,
                        "Position changed"
                    );
                }
                Ok(GeolocatorEvent::PositionError(e)) => warn!(error = %e, "Position error"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event reporter lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            () = cancel.cancelled() => break,
        }
    }
}
