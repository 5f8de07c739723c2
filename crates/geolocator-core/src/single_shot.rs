//! Single-shot position acquisition.
//!
//! One call subscribes to every selected provider with no time or distance
//! filter, keeps a running best fix, and resolves exactly once with whichever
//! of these happens first:
//!
//! - a fix meets the desired accuracy (and carries a heading when one was
//!   requested and the device supports it),
//! - the timeout elapses: the best fix so far, or [`GeolocatorError::TimedOut`],
//! - the caller cancels: [`GeolocatorError::Canceled`],
//! - a provider status makes a fix impossible.
//!
//! All subscriptions are removed when the call settles, and also when the
//! returned future is dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::comparator::BestFix;
use crate::error::{GeolocationError, GeolocatorError, Result};
use crate::position::Position;
use crate::provider::{
    unsubscribe_all, EventSink, Fix, ProviderError, ProviderEvent, ProviderId, ProviderSource,
    ProviderStatus, SubscriptionId, UpdateRequest,
};

/// Parameters of one `get_position` call.
#[derive(Debug, Clone, Default)]
pub struct PositionRequest {
    /// How long to wait. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Caller cancellation signal.
    pub cancel: Option<CancellationToken>,
    /// Require a heading on the resolved fix when the device supports it.
    pub include_heading: bool,
}

impl PositionRequest {
    /// A request with no timeout, no cancellation and no heading.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Ask for a heading.
    #[must_use]
    pub const fn with_heading(mut self, include_heading: bool) -> Self {
        self.include_heading = include_heading;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(GeolocatorError::invalid_argument(
                "timeout",
                "must be greater than zero, or None to wait indefinitely",
            ));
        }
        Ok(())
    }
}

/// A result slot that accepts exactly one value.
///
/// Every later [`settle`](Self::settle) is a silent no-op.
pub(crate) struct SettleOnce<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> SettleOnce<T> {
    pub(crate) fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Returns `true` if this call won.
    pub(crate) fn settle(&self, value: T) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            // A dropped receiver still counts as settled.
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// Options resolved by the geolocator before acquisition starts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcquireOptions {
    pub desired_accuracy_m: f64,
    pub include_heading: bool,
    pub heading_supported: bool,
    pub timeout: Option<Duration>,
}

struct SingleShotListener {
    id: Uuid,
    options: AcquireOptions,
    best: Mutex<BestFix>,
    active_providers: Mutex<HashSet<ProviderId>>,
    result: SettleOnce<Result<Position>>,
}

impl SingleShotListener {
    fn best(&self) -> MutexGuard<'_, BestFix> {
        self.best.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_event(&self, event: ProviderEvent) {
        if self.result.is_settled() {
            return;
        }
        match event {
            ProviderEvent::Fix(fix) => self.on_fix(fix),
            ProviderEvent::Status { provider, status } => self.on_status(&provider, status),
            ProviderEvent::Heading(_) | ProviderEvent::DeferredUpdatesFinished => {}
        }
    }

    fn on_fix(&self, fix: Fix) {
        if self.is_acceptable(&fix) {
            debug!(request = %self.id, provider = %fix.provider, accuracy = ?fix.position.accuracy, "Fix meets desired accuracy");
            self.result.settle(Ok(fix.position));
            return;
        }

        let mut best = self.best();
        let provider = fix.provider.clone();
        let accuracy = fix.position.accuracy;
        if best.offer(fix) {
            debug!(request = %self.id, %provider, ?accuracy, "New best fix");
        }
    }

    fn is_acceptable(&self, fix: &Fix) -> bool {
        let accurate = fix
            .position
            .accuracy
            .is_some_and(|a| a <= self.options.desired_accuracy_m);
        let heading_needed = self.options.include_heading && self.options.heading_supported;
        accurate && (!heading_needed || fix.position.has_heading())
    }

    fn on_status(&self, provider: &ProviderId, status: ProviderStatus) {
        if let Some(error) = status.fatal_error() {
            self.result.settle(Err(error.into()));
            return;
        }

        let mut active = self
            .active_providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match status {
            ProviderStatus::Available => {
                active.insert(provider.clone());
            }
            ProviderStatus::OutOfService => {
                if active.remove(provider) && active.is_empty() {
                    self.result
                        .settle(Err(GeolocationError::PositionUnavailable.into()));
                }
            }
            ProviderStatus::NoData | ProviderStatus::Disabled => {}
        }
    }

    fn on_timeout(&self) {
        let best = self.best();
        let outcome = best
            .get()
            .map(|fix| fix.position.clone())
            .ok_or(GeolocatorError::TimedOut);
        self.result.settle(outcome);
    }
}

/// Removes its subscriptions when dropped.
struct SubscriptionGuard {
    source: Arc<dyn ProviderSource>,
    ids: Vec<SubscriptionId>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        unsubscribe_all(self.source.as_ref(), self.ids.drain(..));
    }
}

/// Resolve one position from `providers`.
pub(crate) async fn acquire(
    source: Arc<dyn ProviderSource>,
    providers: Vec<ProviderId>,
    options: AcquireOptions,
    cancel: CancellationToken,
) -> Result<Position> {
    let enabled: Vec<ProviderId> = providers
        .into_iter()
        .filter(|p| source.is_enabled(p))
        .collect();
    if enabled.is_empty() {
        return Err(GeolocationError::PositionUnavailable.into());
    }

    let (result, rx) = SettleOnce::new();
    let listener = Arc::new(SingleShotListener {
        id: Uuid::new_v4(),
        options,
        best: Mutex::new(enabled.iter().filter_map(|p| source.last_known_fix(p)).collect()),
        active_providers: Mutex::new(enabled.iter().cloned().collect()),
        result,
    });
    debug!(request = %listener.id, providers = enabled.len(), "Starting single-shot acquisition");

    let request = UpdateRequest::single_shot(options.desired_accuracy_m, options.include_heading);
    let mut guard = SubscriptionGuard {
        source: Arc::clone(&source),
        ids: Vec::with_capacity(enabled.len()),
    };
    for provider in &enabled {
        let sink_listener = Arc::clone(&listener);
        let sink: EventSink = Arc::new(move |event| sink_listener.on_event(event));
        match source.subscribe(provider, &request, sink) {
            Ok(id) => guard.ids.push(id),
            Err(e @ ProviderError::Unauthorized) => return Err(e.into()),
            Err(e) => warn!(request = %listener.id, %provider, error = %e, "Unable to request location updates"),
        }
    }
    if guard.ids.is_empty() {
        return Err(GeolocationError::PositionUnavailable.into());
    }

    let outcome = wait_for_outcome(&listener, rx, options.timeout, &cancel).await;
    drop(guard);

    match &outcome {
        Ok(position) => info!(request = %listener.id, accuracy = ?position.accuracy, "Resolved position"),
        Err(e) => info!(request = %listener.id, error = %e, "Position request ended without a fix"),
    }
    outcome
}

async fn wait_for_outcome(
    listener: &SingleShotListener,
    mut rx: oneshot::Receiver<Result<Position>>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Position> {
    let timer = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timer);

    tokio::select! {
        biased;
        outcome = &mut rx => return flatten(outcome),
        () = cancel.cancelled() => {
            listener.result.settle(Err(GeolocatorError::Canceled));
        }
        () = &mut timer => listener.on_timeout(),
    }

    // Whichever path settled first decides the outcome.
    flatten(rx.await)
}

fn flatten(
    outcome: std::result::Result<Result<Position>, oneshot::error::RecvError>,
) -> Result<Position> {
    outcome.unwrap_or_else(|_| Err(GeolocationError::PositionUnavailable.into()))
}
