//! The public geolocation facade.
//!
//! A [`Geolocator`] composes the provider capability, the permission
//! capability and an optional geocoder behind one API. It is cheap to clone;
//! clones share the same listening session, handlers and state.
//!
//! # Locking
//!
//! Two locks guard each instance:
//!
//! - `state`, a `std::sync::Mutex`, protects the desired accuracy and the
//!   listening session. It is taken from provider callback threads and is
//!   never held across an `.await`, a provider call or a handler invocation.
//! - `lifecycle`, a `tokio::sync::Mutex`, serializes `start_listening` and
//!   `stop_listening` so provider subscribe/unsubscribe calls for a session
//!   never interleave.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::comparator::BestFix;
use crate::config::{is_valid_accuracy, GeolocatorConfig};
use crate::error::{GeolocationError, GeolocatorError, Result};
use crate::events::{EventHub, GeolocatorEvent, HandlerId};
use crate::geocoding::{Address, Geocoder};
use crate::permission::{ensure_permission, PermissionChecker, PermissionLevel, StaticPermission};
use crate::position::Position;
use crate::provider::{
    unsubscribe_all, EventSink, ProviderError, ProviderEvent, ProviderId, ProviderSource,
    UpdateRequest,
};
use crate::session::{ListeningSession, SessionOutcome};
use crate::settings::ListenerSettings;
use crate::single_shot::{acquire, AcquireOptions, PositionRequest};

/// Builder for [`Geolocator`].
pub struct GeolocatorBuilder {
    source: Arc<dyn ProviderSource>,
    permissions: Option<Arc<dyn PermissionChecker>>,
    geocoder: Option<Arc<dyn Geocoder>>,
    config: GeolocatorConfig,
}

impl GeolocatorBuilder {
    /// Use `checker` for permission checks. Defaults to always granted.
    #[must_use]
    pub fn permissions(mut self, checker: impl PermissionChecker) -> Self {
        self.permissions = Some(Arc::new(checker));
        self
    }

    /// Attach a geocoding backend.
    #[must_use]
    pub fn geocoder(mut self, geocoder: impl Geocoder) -> Self {
        self.geocoder = Some(Arc::new(geocoder));
        self
    }

    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: GeolocatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the geolocator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn build(self) -> Result<Geolocator> {
        self.config.validate()?;

        let inner = Inner {
            source: self.source,
            permissions: self
                .permissions
                .unwrap_or_else(|| Arc::new(StaticPermission::granted())),
            geocoder: self.geocoder,
            events: EventHub::new(self.config.event_channel_capacity),
            state: Mutex::new(State {
                desired_accuracy_m: self.config.desired_accuracy_m,
                session: None,
                generation: 0,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            config: self.config,
        };
        Ok(Geolocator {
            inner: Arc::new(inner),
        })
    }
}

/// Cross-platform geolocation facade.
#[derive(Clone)]
pub struct Geolocator {
    inner: Arc<Inner>,
}

struct State {
    desired_accuracy_m: f64,
    session: Option<ListeningSession>,
    generation: u64,
}

struct Inner {
    source: Arc<dyn ProviderSource>,
    permissions: Arc<dyn PermissionChecker>,
    geocoder: Option<Arc<dyn Geocoder>>,
    config: GeolocatorConfig,
    state: Mutex<State>,
    lifecycle: tokio::sync::Mutex<()>,
    events: EventHub,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Providers from `allow_list`, or every provider when it is empty.
    fn select_providers(&self, allow_list: &[ProviderId]) -> Vec<ProviderId> {
        let all = self.source.providers();
        if allow_list.is_empty() {
            all
        } else {
            all.into_iter().filter(|p| allow_list.contains(p)).collect()
        }
    }

    async fn require_permission(&self, level: PermissionLevel) -> Result<()> {
        if ensure_permission(self.permissions.as_ref(), level).await {
            Ok(())
        } else {
            Err(GeolocationError::Unauthorized.into())
        }
    }

    fn on_provider_event(&self, generation: u64, event: ProviderEvent) {
        let (outcome, closed) = {
            let mut state = self.state();
            let Some(session) = state.session.as_mut().filter(|s| s.generation == generation) else {
                return;
            };
            let outcome = session.handle(event);
            let closed = if matches!(outcome, SessionOutcome::Fatal(_)) {
                state.session.take()
            } else {
                None
            };
            (outcome, closed)
        };

        match outcome {
            SessionOutcome::Ignored => {}
            SessionOutcome::Changed {
                position,
                waiters,
                defer,
            } => {
                if let Some(request) = defer {
                    for id in request.subscriptions {
                        if let Err(e) = self.source.allow_deferred_updates(id, request.distance_m, request.time) {
                            warn!(subscription = %id, error = %e, "Unable to defer location updates");
                        }
                    }
                }
                for waiter in waiters {
                    let _ = waiter.send(Ok(position.clone()));
                }
                self.events.publish_position_changed(&position);
            }
            SessionOutcome::Fatal(error) => {
                // Torn down before anyone hears about it.
                if let Some(session) = closed {
                    session.close(self.source.as_ref(), Some(error));
                }
                self.events.publish_position_error(error);
            }
        }
    }

    fn take_session(&self, generation: Option<u64>) -> Option<ListeningSession> {
        let mut state = self.state();
        match generation {
            Some(g) if state.session.as_ref().map(|s| s.generation) != Some(g) => None,
            _ => state.session.take(),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = state.session.take() {
            session.close(self.source.as_ref(), None);
        }
    }
}

impl Geolocator {
    /// Start building a geolocator backed by `source`.
    pub fn builder(source: Arc<dyn ProviderSource>) -> GeolocatorBuilder {
        GeolocatorBuilder {
            source,
            permissions: None,
            geocoder: None,
            config: GeolocatorConfig::default(),
        }
    }

    /// A geolocator with default configuration and granted permission.
    ///
    /// # Errors
    ///
    /// Never fails with the default configuration; the signature matches
    /// [`GeolocatorBuilder::build`].
    pub fn new(source: Arc<dyn ProviderSource>) -> Result<Self> {
        Self::builder(source).build()
    }

    /// The configuration this instance was built with.
    #[must_use]
    pub fn config(&self) -> &GeolocatorConfig {
        &self.inner.config
    }

    /// Desired accuracy in meters for single-shot requests.
    #[must_use]
    pub fn desired_accuracy(&self) -> f64 {
        self.inner.state().desired_accuracy_m
    }

    /// Change the desired accuracy. A running session keeps the value it
    /// started with.
    ///
    /// # Errors
    ///
    /// Returns an invalid-argument error unless `meters` is finite and positive.
    pub fn set_desired_accuracy(&self, meters: f64) -> Result<()> {
        if !is_valid_accuracy(meters) {
            return Err(GeolocatorError::invalid_argument(
                "desired_accuracy",
                format!("must be a positive number of meters (got {meters})"),
            ));
        }
        self.inner.state().desired_accuracy_m = meters;
        Ok(())
    }

    /// Whether a listening session is active.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner.state().session.is_some()
    }

    /// Whether the device can report heading.
    #[must_use]
    pub fn supports_heading(&self) -> bool {
        self.inner.source.supports_heading()
    }

    /// Whether the device has any location provider at all.
    #[must_use]
    pub fn is_geolocation_available(&self) -> bool {
        !self.inner.source.providers().is_empty()
    }

    /// Whether at least one non-ignored provider is enabled.
    #[must_use]
    pub fn is_geolocation_enabled(&self) -> bool {
        self.inner
            .source
            .providers()
            .iter()
            .filter(|p| !self.inner.config.is_ignored(p))
            .any(|p| self.inner.source.is_enabled(p))
    }

    /// The last known position, without starting any provider.
    ///
    /// While listening this is the session's last accepted fix; otherwise the
    /// best of the providers' cached fixes. `Ok(None)` means no fix is known.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` if location permission is not granted.
    pub async fn get_last_known_position(&self) -> Result<Option<Position>> {
        self.inner.require_permission(PermissionLevel::WhenInUse).await?;

        if let Some(session) = self.inner.state().session.as_ref() {
            return Ok(session.last_position());
        }

        let best: BestFix = self
            .inner
            .select_providers(&self.inner.config.providers_to_use)
            .iter()
            .filter_map(|p| self.inner.source.last_known_fix(p))
            .collect();
        Ok(best.into_inner().map(|f| f.position))
    }

    /// Resolve one position.
    ///
    /// While a session is active this returns the session's last fix, or
    /// waits for its next change, without subscribing to any provider.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a zero timeout
    /// - `Unauthorized` without location permission
    /// - `PositionUnavailable` when no provider can produce a fix
    /// - `TimedOut` when the timeout passes with no fix at all
    /// - `Canceled` when the request's token is cancelled first
    pub async fn get_position(&self, request: PositionRequest) -> Result<Position> {
        request.validate()?;
        self.inner.require_permission(PermissionLevel::WhenInUse).await?;

        let cancel = request.cancel.clone().unwrap_or_default();

        let (options, waiter) = {
            let mut state = self.inner.state();
            let waiter = match state.session.as_mut() {
                Some(session) => match session.last_position() {
                    Some(position) => {
                        debug!(session = %session.id, "Serving position from listening session");
                        return Ok(position);
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        session.add_waiter(tx);
                        Some(rx)
                    }
                },
                None => None,
            };
            let options = AcquireOptions {
                desired_accuracy_m: state.desired_accuracy_m,
                include_heading: request.include_heading,
                heading_supported: self.inner.source.supports_heading(),
                timeout: request.timeout,
            };
            (options, waiter)
        };

        if let Some(rx) = waiter {
            return wait_for_session(rx, request.timeout, &cancel).await;
        }

        let providers = self.inner.select_providers(&self.inner.config.providers_to_use);
        acquire(Arc::clone(&self.inner.source), providers, options, cancel).await
    }

    /// Start a continuous listening session.
    ///
    /// Accepted fixes are published as [`GeolocatorEvent::PositionChanged`];
    /// a provider failure stops the session and publishes
    /// [`GeolocatorEvent::PositionError`].
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a negative or non-finite distance
    /// - `AlreadyListening` if a session is active
    /// - `Unauthorized` without the required permission
    /// - `PositionUnavailable` if no provider could be subscribed
    pub async fn start_listening(
        &self,
        min_time: Duration,
        min_distance_m: f64,
        include_heading: bool,
        settings: Option<ListenerSettings>,
    ) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if !min_distance_m.is_finite() || min_distance_m < 0.0 {
            return Err(GeolocatorError::invalid_argument(
                "min_distance",
                format!("must be zero or greater (got {min_distance_m})"),
            ));
        }
        let settings = settings.unwrap_or_default();
        if settings
            .deferral_distance_m
            .is_some_and(|d| !d.is_finite() || d < 0.0)
        {
            return Err(GeolocatorError::invalid_argument(
                "deferral_distance_m",
                "must be zero or greater",
            ));
        }
        if self.is_listening() {
            return Err(GeolocatorError::AlreadyListening);
        }

        let level = if settings.require_location_always_permission {
            PermissionLevel::Always
        } else {
            PermissionLevel::WhenInUse
        };
        self.inner.require_permission(level).await?;

        let source = &self.inner.source;
        let providers = self
            .inner
            .select_providers(&self.inner.config.providers_to_use_while_listening);
        if providers.is_empty() {
            return Err(GeolocationError::PositionUnavailable.into());
        }

        let can_defer = settings.defer_updates && source.supports_deferred_updates();
        let heading = include_heading && source.supports_heading();
        let enabled: Vec<ProviderId> = providers
            .iter()
            .filter(|p| source.is_enabled(p))
            .cloned()
            .collect();
        let (generation, session_id, request) = {
            let mut state = self.inner.state();
            state.generation += 1;
            let generation = state.generation;
            let request = UpdateRequest {
                min_time,
                min_distance_m: if can_defer { 0.0 } else { min_distance_m },
                desired_accuracy_m: if can_defer { 0.0 } else { state.desired_accuracy_m },
                include_heading: heading,
                settings: Some(settings.clone()),
            };
            let session = ListeningSession::new(generation, enabled, settings, include_heading, can_defer);
            let session_id = session.id;
            state.session = Some(session);
            (generation, session_id, request)
        };

        for provider in &providers {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let sink: EventSink = Arc::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_provider_event(generation, event);
                }
            });

            match source.subscribe(provider, &request, sink) {
                Ok(id) => {
                    let orphaned = {
                        let mut state = self.inner.state();
                        match state.session.as_mut().filter(|s| s.generation == generation) {
                            Some(session) => {
                                session.add_subscription(id);
                                false
                            }
                            None => true,
                        }
                    };
                    // The session failed while we were subscribing.
                    if orphaned {
                        unsubscribe_all(source.as_ref(), [id]);
                    }
                }
                Err(e @ ProviderError::Unauthorized) => {
                    if let Some(session) = self.inner.take_session(Some(generation)) {
                        session.close(source.as_ref(), None);
                    }
                    return Err(e.into());
                }
                Err(e) => warn!(session = %session_id, %provider, error = %e, "Unable to request location updates"),
            }
        }

        let subscribed = self
            .inner
            .state()
            .session
            .as_ref()
            .filter(|s| s.generation == generation)
            .map(ListeningSession::has_subscriptions);
        if subscribed == Some(false) {
            if let Some(session) = self.inner.take_session(Some(generation)) {
                session.close(source.as_ref(), None);
            }
            return Err(GeolocationError::PositionUnavailable.into());
        }

        info!(
            session = %session_id,
            providers = providers.len(),
            min_time_ms = u64::try_from(min_time.as_millis()).unwrap_or(u64::MAX),
            min_distance_m,
            deferred = can_defer,
            "Started listening"
        );
        Ok(())
    }

    /// Stop the listening session.
    ///
    /// Always returns `true`. Stopping when not listening does nothing, and
    /// provider unsubscribe failures are logged rather than returned.
    pub async fn stop_listening(&self) -> bool {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(session) = self.inner.take_session(None) {
            let id = session.id;
            session.close(self.inner.source.as_ref(), None);
            info!(session = %id, "Stopped listening");
        }
        true
    }

    /// Register a handler for accepted positions.
    pub fn on_position_changed<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Position) + Send + Sync + 'static,
    {
        self.inner.events.add_position_changed(Arc::new(handler))
    }

    /// Register a handler for session failures. The session is already
    /// stopped when it runs.
    pub fn on_position_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(GeolocationError) + Send + Sync + 'static,
    {
        self.inner.events.add_position_error(Arc::new(handler))
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.events.remove(id)
    }

    /// A stream of every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GeolocatorEvent> {
        self.inner.events.subscribe()
    }

    /// Reverse geocode a position.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the position has no coordinate
    /// - `GeocoderUnavailable` if no geocoder is attached
    /// - `Geocoding` if the backend fails
    pub async fn get_addresses_for_position(
        &self,
        position: &Position,
        map_key: Option<&str>,
    ) -> Result<Vec<Address>> {
        if !position.has_latitude_longitude() {
            return Err(GeolocatorError::invalid_argument(
                "position",
                "has no latitude/longitude",
            ));
        }
        let geocoder = self
            .inner
            .geocoder
            .as_ref()
            .ok_or(GeolocatorError::GeocoderUnavailable)?;
        Ok(geocoder.addresses_for_position(position, map_key).await?)
    }

    /// Forward geocode an address.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `address` is blank
    /// - `GeocoderUnavailable` if no geocoder is attached
    /// - `Geocoding` if the backend fails
    pub async fn get_positions_for_address(
        &self,
        address: &str,
        map_key: Option<&str>,
    ) -> Result<Vec<Position>> {
        if address.trim().is_empty() {
            return Err(GeolocatorError::invalid_argument("address", "must not be empty"));
        }
        let geocoder = self
            .inner
            .geocoder
            .as_ref()
            .ok_or(GeolocatorError::GeocoderUnavailable)?;
        Ok(geocoder.positions_for_address(address, map_key).await?)
    }
}

async fn wait_for_session(
    rx: oneshot::Receiver<std::result::Result<Position, GeolocationError>>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Position> {
    let timer = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        outcome = rx => match outcome {
            Ok(result) => result.map_err(GeolocatorError::from),
            Err(_) => Err(GeolocationError::PositionUnavailable.into()),
        },
        () = cancel.cancelled() => Err(GeolocatorError::Canceled),
        () = timer => Err(GeolocatorError::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocoding::{Address, GeocodingError};
    use crate::permission::{BoxFuture, PermissionStatus};
    use crate::provider::mock::MockProvider;
    use crate::provider::{Fix, ProviderStatus};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup(providers: &[&str]) -> (Arc<MockProvider>, Geolocator) {
        let mock = Arc::new(MockProvider::with_providers(providers));
        let geo = Geolocator::new(Arc::clone(&mock) as Arc<dyn ProviderSource>).unwrap();
        (mock, geo)
    }

    fn fix_at(provider: &str, offset_ms: i64, accuracy: f64) -> Fix {
        let t = Utc::now() + chrono::Duration::milliseconds(offset_ms);
        Fix::new(provider, Position::new(t, 46.5, 6.6).with_accuracy(accuracy))
    }

    async fn listen(geo: &Geolocator) {
        geo.start_listening(Duration::ZERO, 0.0, false, None).await.unwrap();
    }

    /// Lets spawned tasks on the current-thread runtime reach their await point.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    struct FakeGeocoder;

    impl Geocoder for FakeGeocoder {
        fn addresses_for_position<'a>(
            &'a self,
            position: &'a Position,
            _map_key: Option<&'a str>,
        ) -> BoxFuture<'a, std::result::Result<Vec<Address>, GeocodingError>> {
            Box::pin(async move {
                let coordinate = position
                    .coordinate
                    .ok_or_else(|| GeocodingError::Service("no coordinate".into()))?;
                Ok(vec![Address {
                    latitude: coordinate.latitude,
                    longitude: coordinate.longitude,
                    locality: Some("Lausanne".to_string()),
                    ..Address::default()
                }])
            })
        }

        fn positions_for_address<'a>(
            &'a self,
            address: &'a str,
            map_key: Option<&'a str>,
        ) -> BoxFuture<'a, std::result::Result<Vec<Position>, GeocodingError>> {
            Box::pin(async move {
                if map_key.is_none() {
                    return Err(GeocodingError::MissingMapKey);
                }
                if address.contains("offline") {
                    return Err(GeocodingError::Unreachable("no route to host".into()));
                }
                Ok(vec![Position::now(46.5, 6.6)])
            })
        }
    }

    #[tokio::test]
    async fn test_listening_end_to_end() {
        let (mock, geo) = setup(&["gps"]);
        let mut events = geo.subscribe();
        listen(&geo).await;
        assert!(geo.is_listening());

        mock.emit_fix(fix_at("gps", 0, 50.0));
        mock.emit_fix(fix_at("gps", 1000, 30.0));

        for expected in [50.0, 30.0] {
            match events.recv().await.unwrap() {
                GeolocatorEvent::PositionChanged(p) => assert_eq!(p.accuracy, Some(expected)),
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert!(geo.stop_listening().await);
        assert!(!geo.is_listening());
        assert_eq!(geo.get_last_known_position().await.unwrap(), None);
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_get_position_short_circuits_on_session_fix() {
        let (mock, geo) = setup(&["gps"]);
        listen(&geo).await;
        mock.emit_fix(fix_at("gps", 0, 40.0));
        let subscribed = mock.subscribe_count();

        let position = geo.get_position(PositionRequest::new()).await.unwrap();

        assert_eq!(position.accuracy, Some(40.0));
        assert_eq!(mock.subscribe_count(), subscribed);
    }

    #[tokio::test]
    async fn test_get_position_waits_for_next_session_change() {
        let (mock, geo) = setup(&["gps"]);
        listen(&geo).await;

        let pending = tokio::spawn({
            let geo = geo.clone();
            async move { geo.get_position(PositionRequest::new()).await }
        });
        settle().await;
        mock.emit_fix(fix_at("gps", 0, 25.0));

        assert_eq!(pending.await.unwrap().unwrap().accuracy, Some(25.0));
        assert_eq!(mock.subscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_wait_honours_timeout() {
        let (_mock, geo) = setup(&["gps"]);
        listen(&geo).await;

        let result = geo
            .get_position(PositionRequest::new().with_timeout(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(GeolocatorError::TimedOut)));
    }

    #[tokio::test]
    async fn test_session_wait_fails_with_session_error() {
        let (mock, geo) = setup(&["gps"]);
        listen(&geo).await;

        let pending = tokio::spawn({
            let geo = geo.clone();
            async move { geo.get_position(PositionRequest::new()).await }
        });
        settle().await;
        mock.emit_status("gps", ProviderStatus::Disabled);

        let error = pending.await.unwrap().unwrap_err();
        assert_eq!(error.geolocation_error(), Some(GeolocationError::Unauthorized));
    }

    #[tokio::test]
    async fn test_disabled_provider_stops_session_before_error_handler() {
        let (mock, geo) = setup(&["gps"]);
        let observed = Arc::new(Mutex::new(None));
        let probe = geo.clone();
        let slot = Arc::clone(&observed);
        geo.on_position_error(move |error| {
            *slot.lock().unwrap() = Some((error, probe.is_listening()));
        });
        listen(&geo).await;

        mock.emit_status("gps", ProviderStatus::Disabled);

        assert_eq!(
            *observed.lock().unwrap(),
            Some((GeolocationError::Unauthorized, false))
        );
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_error_handler_can_restart_listening() {
        let (mock, geo) = setup(&["gps"]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let restarter = geo.clone();
        geo.on_position_error(move |_| {
            let geo = restarter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(geo.start_listening(Duration::ZERO, 0.0, false, None).await);
            });
        });
        listen(&geo).await;

        mock.emit_status("gps", ProviderStatus::NoData);

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(geo.is_listening());
        assert_eq!(mock.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_stop_listening_is_idempotent() {
        let (mock, geo) = setup(&["gps", "network"]);
        listen(&geo).await;

        assert!(geo.stop_listening().await);
        let unsubscribed = mock.unsubscribe_count();
        assert_eq!(unsubscribed, 2);

        assert!(geo.stop_listening().await);
        assert_eq!(mock.unsubscribe_count(), unsubscribed);
    }

    #[tokio::test]
    async fn test_stop_listening_swallows_unsubscribe_failures() {
        let (mock, geo) = setup(&["gps"]);
        listen(&geo).await;
        mock.fail_unsubscribe(Some(ProviderError::Internal {
            message: "binder died".to_string(),
        }));

        assert!(geo.stop_listening().await);
        assert!(!geo.is_listening());
    }

    #[tokio::test]
    async fn test_start_listening_twice_is_rejected() {
        let (mock, geo) = setup(&["gps"]);
        listen(&geo).await;

        let error = geo
            .start_listening(Duration::ZERO, 0.0, false, None)
            .await
            .unwrap_err();
        assert!(matches!(error, GeolocatorError::AlreadyListening));
        assert_eq!(mock.subscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_negative_distance_is_rejected() {
        let (mock, geo) = setup(&["gps"]);
        let error = geo
            .start_listening(Duration::ZERO, -1.0, false, None)
            .await
            .unwrap_err();
        assert!(error.is_argument_error());
        assert_eq!(mock.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_is_unauthorized() {
        let mock = Arc::new(MockProvider::with_providers(&["gps"]));
        let geo = Geolocator::builder(Arc::clone(&mock) as Arc<dyn ProviderSource>)
            .permissions(StaticPermission::denied())
            .build()
            .unwrap();

        let listen_error = geo
            .start_listening(Duration::ZERO, 0.0, false, None)
            .await
            .unwrap_err();
        let position_error = geo.get_position(PositionRequest::new()).await.unwrap_err();
        let last_known_error = geo.get_last_known_position().await.unwrap_err();

        for error in [listen_error, position_error, last_known_error] {
            assert_eq!(error.geolocation_error(), Some(GeolocationError::Unauthorized));
        }
        assert_eq!(mock.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn test_always_permission_requested_for_background_settings() {
        struct WhenInUseOnly(AtomicBool);

        impl PermissionChecker for WhenInUseOnly {
            fn check(&self, level: PermissionLevel) -> BoxFuture<'_, PermissionStatus> {
                if level == PermissionLevel::Always {
                    self.0.store(true, Ordering::SeqCst);
                }
                Box::pin(async move {
                    match level {
                        PermissionLevel::WhenInUse => PermissionStatus::Granted,
                        PermissionLevel::Always => PermissionStatus::Denied,
                    }
                })
            }

            fn request(&self, level: PermissionLevel) -> BoxFuture<'_, PermissionStatus> {
                self.check(level)
            }
        }

        let mock = Arc::new(MockProvider::with_providers(&["gps"]));
        let geo = Geolocator::builder(Arc::clone(&mock) as Arc<dyn ProviderSource>)
            .permissions(WhenInUseOnly(AtomicBool::new(false)))
            .build()
            .unwrap();
        let settings = ListenerSettings {
            require_location_always_permission: true,
            ..ListenerSettings::default()
        };

        let error = geo
            .start_listening(Duration::ZERO, 0.0, false, Some(settings))
            .await
            .unwrap_err();
        assert_eq!(error.geolocation_error(), Some(GeolocationError::Unauthorized));
        assert!(geo.start_listening(Duration::ZERO, 0.0, false, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_unauthorized_leaves_nothing_behind() {
        let (mock, geo) = setup(&["gps"]);
        mock.fail_subscriptions_with(Some(ProviderError::Unauthorized));

        let error = geo
            .start_listening(Duration::ZERO, 0.0, false, None)
            .await
            .unwrap_err();

        assert_eq!(error.geolocation_error(), Some(GeolocationError::Unauthorized));
        assert!(!geo.is_listening());
    }

    #[tokio::test]
    async fn test_every_subscription_failing_is_unavailable() {
        let (mock, geo) = setup(&["gps"]);
        mock.fail_subscriptions_with(Some(ProviderError::Internal {
            message: "no looper".to_string(),
        }));

        let error = geo
            .start_listening(Duration::ZERO, 0.0, false, None)
            .await
            .unwrap_err();

        assert_eq!(error.geolocation_error(), Some(GeolocationError::PositionUnavailable));
        assert!(!geo.is_listening());
    }

    #[tokio::test]
    async fn test_listening_allow_list_limits_subscriptions() {
        let mock = Arc::new(MockProvider::with_providers(&["gps", "network", "passive"]));
        let config = GeolocatorConfig {
            providers_to_use_while_listening: vec![ProviderId::new("gps")],
            ..GeolocatorConfig::default()
        };
        let geo = Geolocator::builder(Arc::clone(&mock) as Arc<dyn ProviderSource>)
            .config(config)
            .build()
            .unwrap();

        listen(&geo).await;

        assert_eq!(mock.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_competing_provider_arbitration() {
        let (mock, geo) = setup(&["gps", "network"]);
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&accepted);
        geo.on_position_changed(move |p| sink.lock().unwrap().push(p.accuracy));
        listen(&geo).await;

        mock.emit_fix(fix_at("gps", 0, 10.0));
        mock.emit_fix(fix_at("network", 1000, 600.0));
        mock.emit_fix(fix_at("gps", 2000, 12.0));

        assert_eq!(*accepted.lock().unwrap(), vec![Some(10.0), Some(12.0)]);
    }

    #[tokio::test]
    async fn test_deferred_updates() {
        let (mock, geo) = setup(&["gps"]);
        mock.set_supports_deferred_updates(true);

        geo.start_listening(Duration::from_secs(1), 25.0, false, Some(ListenerSettings::deferred()))
            .await
            .unwrap();
        let request = mock.last_request().unwrap();
        assert!(request.min_distance_m.abs() < f64::EPSILON);
        assert!(request.desired_accuracy_m.abs() < f64::EPSILON);

        mock.emit_fix(fix_at("gps", 0, 5.0));
        mock.emit_fix(fix_at("gps", 1000, 5.0));
        assert_eq!(mock.deferral_requests().len(), 1);
        assert_eq!(mock.deferral_requests()[0].distance_m, Some(500.0));

        mock.emit_deferred_finished();
        mock.emit_fix(fix_at("gps", 2000, 5.0));
        assert_eq!(mock.deferral_requests().len(), 2);

        geo.stop_listening().await;
        assert_eq!(mock.deferring_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_filters_pass_through_without_deferral() {
        let (mock, geo) = setup(&["gps"]);
        geo.set_desired_accuracy(15.0).unwrap();

        geo.start_listening(Duration::from_secs(2), 25.0, true, None)
            .await
            .unwrap();

        let request = mock.last_request().unwrap();
        assert_eq!(request.min_time, Duration::from_secs(2));
        assert!((request.min_distance_m - 25.0).abs() < f64::EPSILON);
        assert!((request.desired_accuracy_m - 15.0).abs() < f64::EPSILON);
        assert!(!request.include_heading);
    }

    #[tokio::test]
    async fn test_heading_updates_republish_last_fix() {
        let (mock, geo) = setup(&["gps"]);
        mock.set_supports_heading(true);
        let mut events = geo.subscribe();
        geo.start_listening(Duration::ZERO, 0.0, true, None).await.unwrap();

        mock.emit_fix(fix_at("gps", 0, 5.0));
        mock.emit_heading(180.0);

        let _ = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            GeolocatorEvent::PositionChanged(p) => assert_eq!(p.heading, Some(180.0)),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            geo.get_last_known_position().await.unwrap().unwrap().heading,
            Some(180.0)
        );
    }

    #[tokio::test]
    async fn test_last_known_position_without_session_uses_provider_cache() {
        let (mock, geo) = setup(&["gps", "network"]);
        assert_eq!(geo.get_last_known_position().await.unwrap(), None);

        mock.set_last_known(fix_at("network", 0, 300.0));
        mock.set_last_known(fix_at("gps", -1000, 20.0));

        let position = geo.get_last_known_position().await.unwrap().unwrap();
        assert_eq!(position.accuracy, Some(20.0));
        assert_eq!(mock.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn test_single_shot_respects_allow_list() {
        let mock = Arc::new(MockProvider::with_providers(&["gps", "network"]));
        let config = GeolocatorConfig {
            providers_to_use: vec![ProviderId::new("network")],
            desired_accuracy_m: 500.0,
            ..GeolocatorConfig::default()
        };
        let geo = Geolocator::builder(Arc::clone(&mock) as Arc<dyn ProviderSource>)
            .config(config)
            .build()
            .unwrap();

        let pending = tokio::spawn({
            let geo = geo.clone();
            async move { geo.get_position(PositionRequest::new()).await }
        });
        while mock.active_subscriptions() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(mock.active_subscriptions(), 1);
        mock.emit_fix(fix_at("network", 0, 100.0));

        assert_eq!(pending.await.unwrap().unwrap().accuracy, Some(100.0));
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_position_with_cancelled_token() {
        let (_mock, geo) = setup(&["gps"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = geo
            .get_position(PositionRequest::new().with_cancellation(cancel))
            .await;

        assert!(result.unwrap_err().is_cancellation());
    }

    #[test]
    fn test_availability_and_enabled_state() {
        let mock = Arc::new(MockProvider::new());
        let geo = Geolocator::new(Arc::clone(&mock) as Arc<dyn ProviderSource>).unwrap();
        assert!(!geo.is_geolocation_available());

        mock.add_provider("passive", true);
        assert!(geo.is_geolocation_available());
        assert!(!geo.is_geolocation_enabled());

        mock.add_provider("gps", false);
        assert!(!geo.is_geolocation_enabled());
        mock.set_enabled("gps", true);
        assert!(geo.is_geolocation_enabled());
    }

    #[test]
    fn test_desired_accuracy_validation() {
        let (_mock, geo) = setup(&["gps"]);
        assert!((geo.desired_accuracy() - 100.0).abs() < f64::EPSILON);
        assert!(geo.set_desired_accuracy(0.0).is_err());
        assert!(geo.set_desired_accuracy(f64::INFINITY).is_err());
        geo.set_desired_accuracy(5.0).unwrap();
        assert!((geo.desired_accuracy() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let mock = Arc::new(MockProvider::new());
        let result = Geolocator::builder(mock)
            .config(GeolocatorConfig {
                event_channel_capacity: 0,
                ..GeolocatorConfig::default()
            })
            .build();
        assert!(result.err().is_some_and(|e| e.is_config_error()));
    }

    #[tokio::test]
    async fn test_dropping_geolocator_ends_session() {
        let (mock, geo) = setup(&["gps"]);
        listen(&geo).await;
        drop(geo);
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_removed_handler_stops_receiving() {
        let (mock, geo) = setup(&["gps"]);
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let id = geo.on_position_changed(move |_| *counter.lock().unwrap() += 1);
        listen(&geo).await;

        mock.emit_fix(fix_at("gps", 0, 5.0));
        assert!(geo.remove_handler(id));
        mock.emit_fix(fix_at("gps", 1000, 5.0));

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_geocoding() {
        let mock = Arc::new(MockProvider::new());
        let geo = Geolocator::builder(Arc::clone(&mock) as Arc<dyn ProviderSource>)
            .geocoder(FakeGeocoder)
            .build()
            .unwrap();

        let addresses = geo
            .get_addresses_for_position(&Position::now(46.5, 6.6), None)
            .await
            .unwrap();
        assert_eq!(addresses[0].locality.as_deref(), Some("Lausanne"));

        let blank = geo.get_positions_for_address("  ", Some("key")).await.unwrap_err();
        assert!(blank.is_argument_error());

        let failed = geo.get_positions_for_address("Rue du Bourg", None).await.unwrap_err();
        assert!(matches!(
            failed,
            GeolocatorError::Geocoding(GeocodingError::MissingMapKey)
        ));
        assert_eq!(failed.error_code(), "GEOCODING_FAILED");

        let unreachable = geo
            .get_positions_for_address("offline street", Some("key"))
            .await
            .unwrap_err();
        assert!(matches!(
            unreachable,
            GeolocatorError::Geocoding(GeocodingError::Unreachable(_))
        ));

        let found = geo.get_positions_for_address("Rue du Bourg", Some("key")).await.unwrap();
        assert_eq!(found.len(), 1);

        let no_coordinate = Position::empty(Utc::now());
        assert!(geo
            .get_addresses_for_position(&no_coordinate, None)
            .await
            .unwrap_err()
            .is_argument_error());
    }

    #[tokio::test]
    async fn test_missing_geocoder_is_reported() {
        let (_mock, geo) = setup(&["gps"]);
        let error = geo
            .get_addresses_for_position(&Position::now(0.0, 0.0), None)
            .await
            .unwrap_err();
        assert!(matches!(error, GeolocatorError::GeocoderUnavailable));
    }
}
