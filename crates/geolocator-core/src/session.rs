//! Continuous listening session state.
//!
//! A [`ListeningSession`] owns everything one `start_listening` call set up:
//! the provider subscriptions, the per-source arbitration state, the cached
//! last fix, the deferral latch, and any `get_position` callers waiting for
//! the next change. It never calls back into the geolocator; [`handle`]
//! returns a [`SessionOutcome`] and the geolocator decides what to publish
//! once its state lock is released.
//!
//! [`handle`]: ListeningSession::handle

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::comparator::is_better_fix;
use crate::error::GeolocationError;
use crate::position::Position;
use crate::provider::{
    unsubscribe_all, Fix, ProviderEvent, ProviderId, ProviderSource, ProviderStatus,
    SubscriptionId,
};
use crate::settings::ListenerSettings;

/// A `get_position` caller waiting on the session's next change.
pub(crate) type Waiter = oneshot::Sender<Result<Position, GeolocationError>>;

/// A deferral request to forward to the provider.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DeferralRequest {
    pub subscriptions: Vec<SubscriptionId>,
    pub distance_m: Option<f64>,
    pub time: Option<Duration>,
}

/// What the geolocator must do after an event was applied.
#[derive(Debug)]
pub(crate) enum SessionOutcome {
    /// Nothing observable happened.
    Ignored,
    /// A new position was accepted.
    Changed {
        position: Position,
        waiters: Vec<Waiter>,
        defer: Option<DeferralRequest>,
    },
    /// The session cannot continue.
    Fatal(GeolocationError),
}

#[derive(Debug)]
pub(crate) struct ListeningSession {
    pub id: Uuid,
    pub generation: u64,
    settings: ListenerSettings,
    include_heading: bool,
    can_defer: bool,
    subscriptions: Vec<SubscriptionId>,
    active_providers: HashSet<ProviderId>,
    active_provider: Option<ProviderId>,
    last_fix: Option<Fix>,
    deferring: bool,
    waiters: Vec<Waiter>,
}

impl ListeningSession {
    pub(crate) fn new(
        generation: u64,
        providers: impl IntoIterator<Item = ProviderId>,
        settings: ListenerSettings,
        include_heading: bool,
        can_defer: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation,
            settings,
            include_heading,
            can_defer,
            subscriptions: Vec::new(),
            active_providers: providers.into_iter().collect(),
            active_provider: None,
            last_fix: None,
            deferring: false,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn add_subscription(&mut self, id: SubscriptionId) {
        self.subscriptions.push(id);
    }

    pub(crate) fn has_subscriptions(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    pub(crate) const fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    /// The most recently accepted position.
    pub(crate) fn last_position(&self) -> Option<Position> {
        self.last_fix.as_ref().map(|f| f.position.clone())
    }

    /// Queue a caller for the next change.
    pub(crate) fn add_waiter(&mut self, waiter: Waiter) {
        self.waiters.retain(|w| !w.is_closed());
        self.waiters.push(waiter);
    }

    /// Apply one provider event.
    pub(crate) fn handle(&mut self, event: ProviderEvent) -> SessionOutcome {
        match event {
            ProviderEvent::Fix(fix) => self.on_fix(fix),
            ProviderEvent::Heading(degrees) => self.on_heading(degrees),
            ProviderEvent::Status { provider, status } => self.on_status(provider, status),
            ProviderEvent::DeferredUpdatesFinished => {
                debug!(session = %self.id, "Deferred batch finished");
                self.deferring = false;
                SessionOutcome::Ignored
            }
        }
    }

    fn on_fix(&mut self, fix: Fix) -> SessionOutcome {
        if self.active_provider.as_ref() != Some(&fix.provider) {
            let incumbent_active = self
                .active_provider
                .as_ref()
                .is_some_and(|p| self.active_providers.contains(p));
            if incumbent_active && !is_better_fix(&fix, self.last_fix.as_ref()) {
                debug!(
                    session = %self.id,
                    provider = %fix.provider,
                    accuracy = ?fix.position.accuracy,
                    "Rejected fix from competing provider"
                );
                return SessionOutcome::Ignored;
            }
            self.active_provider = Some(fix.provider.clone());
        }

        debug!(session = %self.id, provider = %fix.provider, accuracy = ?fix.position.accuracy, "Accepted fix");
        let position = fix.position.clone();
        self.last_fix = Some(fix);
        SessionOutcome::Changed {
            position,
            waiters: std::mem::take(&mut self.waiters),
            defer: self.take_deferral(),
        }
    }

    fn take_deferral(&mut self) -> Option<DeferralRequest> {
        if !self.settings.defer_updates || !self.can_defer || self.deferring {
            return None;
        }
        self.deferring = true;
        Some(DeferralRequest {
            subscriptions: self.subscriptions.clone(),
            distance_m: self.settings.deferral_distance_m,
            time: self.settings.deferral_time,
        })
    }

    fn on_heading(&mut self, degrees: f64) -> SessionOutcome {
        if !self.include_heading || !degrees.is_finite() || degrees < 0.0 {
            return SessionOutcome::Ignored;
        }
        let Some(fix) = self.last_fix.as_mut() else {
            return SessionOutcome::Ignored;
        };
        fix.position.heading = Some(degrees);
        SessionOutcome::Changed {
            position: fix.position.clone(),
            waiters: std::mem::take(&mut self.waiters),
            defer: None,
        }
    }

    fn on_status(&mut self, provider: ProviderId, status: ProviderStatus) -> SessionOutcome {
        if let Some(error) = status.fatal_error() {
            info!(session = %self.id, %provider, ?status, "Provider status ends the session");
            return SessionOutcome::Fatal(error);
        }
        match status {
            ProviderStatus::Available => {
                self.active_providers.insert(provider);
                SessionOutcome::Ignored
            }
            ProviderStatus::OutOfService => {
                if self.active_providers.remove(&provider) && self.active_providers.is_empty() {
                    info!(session = %self.id, "Every provider is out of service");
                    SessionOutcome::Fatal(GeolocationError::PositionUnavailable)
                } else {
                    SessionOutcome::Ignored
                }
            }
            ProviderStatus::NoData | ProviderStatus::Disabled => SessionOutcome::Ignored,
        }
    }

    /// Tear the session down and release its waiters.
    ///
    /// Waiters receive `error`, or `PositionUnavailable` when the caller
    /// stopped the session.
    pub(crate) fn close(self, source: &dyn ProviderSource, error: Option<GeolocationError>) {
        if self.deferring {
            for id in &self.subscriptions {
                if let Err(e) = source.disallow_deferred_updates(*id) {
                    tracing::warn!(session = %self.id, subscription = %id, error = %e, "Unable to disallow deferred updates");
                }
            }
        }
        unsubscribe_all(source, self.subscriptions);

        let outcome = error.unwrap_or(GeolocationError::PositionUnavailable);
        for waiter in self.waiters {
            let _ = waiter.send(Err(outcome));
        }
        info!(session = %self.id, ?error, "Listening session closed");
    }
}
