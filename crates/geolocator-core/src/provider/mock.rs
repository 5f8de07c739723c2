//! In-memory [`ProviderSource`] driven by the caller.
//!
//! Events are pushed with the `emit_*` methods and delivered synchronously to
//! every matching subscription on the calling thread. Counters and the last
//! request are exposed so tests can check what the geolocator asked for.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    EventSink, Fix, ProviderError, ProviderEvent, ProviderId, ProviderSource, ProviderStatus,
    SubscriptionId, UpdateRequest,
};

#[derive(Debug, Clone, Default)]
struct ProviderEntry {
    enabled: bool,
    last_known: Option<Fix>,
}

struct Subscription {
    provider: ProviderId,
    sink: EventSink,
}

/// A recorded `allow_deferred_updates` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeferralRequest {
    /// Subscription the deferral applies to.
    pub subscription: SubscriptionId,
    /// Requested distance threshold.
    pub distance_m: Option<f64>,
    /// Requested time threshold.
    pub time: Option<Duration>,
}

#[derive(Default)]
struct MockState {
    providers: BTreeMap<ProviderId, ProviderEntry>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    last_request: Option<UpdateRequest>,
    deferrals: Vec<DeferralRequest>,
    deferring: Vec<SubscriptionId>,
    subscribe_failure: Option<ProviderError>,
    unsubscribe_failure: Option<ProviderError>,
    supports_heading: bool,
    supports_deferred_updates: bool,
}

/// Scriptable provider source.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

impl MockProvider {
    /// A source with no providers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A source with the given providers, all enabled.
    #[must_use]
    pub fn with_providers(names: &[&str]) -> Self {
        let mock = Self::new();
        for name in names {
            mock.add_provider(*name, true);
        }
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a provider.
    pub fn add_provider(&self, name: impl Into<ProviderId>, enabled: bool) {
        self.state().providers.insert(
            name.into(),
            ProviderEntry {
                enabled,
                last_known: None,
            },
        );
    }

    /// Enable or disable a provider.
    pub fn set_enabled(&self, name: impl Into<ProviderId>, enabled: bool) {
        self.state().providers.entry(name.into()).or_default().enabled = enabled;
    }

    /// Set the cached last fix for the fix's provider.
    pub fn set_last_known(&self, fix: Fix) {
        let provider = fix.provider.clone();
        self.state().providers.entry(provider).or_default().last_known = Some(fix);
    }

    /// Toggle heading support.
    pub fn set_supports_heading(&self, supported: bool) {
        self.state().supports_heading = supported;
    }

    /// Toggle deferred update support.
    pub fn set_supports_deferred_updates(&self, supported: bool) {
        self.state().supports_deferred_updates = supported;
    }

    /// Make every later `subscribe` fail with `error`, or succeed again with `None`.
    pub fn fail_subscriptions_with(&self, error: Option<ProviderError>) {
        self.state().subscribe_failure = error;
    }

    /// Make every later `unsubscribe` fail with `error`. The subscription is
    /// still removed.
    pub fn fail_unsubscribe(&self, error: Option<ProviderError>) {
        self.state().unsubscribe_failure = error;
    }

    fn sinks_for(&self, provider: Option<&ProviderId>) -> Vec<EventSink> {
        self.state()
            .subscriptions
            .values()
            .filter(|s| provider.map_or(true, |p| &s.provider == p))
            .map(|s| EventSink::clone(&s.sink))
            .collect()
    }

    fn deliver(&self, provider: Option<&ProviderId>, event: &ProviderEvent) {
        // The lock is released before any sink runs.
        for sink in self.sinks_for(provider) {
            sink(event.clone());
        }
    }

    /// Deliver a fix to every subscription on the fix's provider.
    pub fn emit_fix(&self, fix: Fix) {
        let provider = fix.provider.clone();
        self.deliver(Some(&provider), &ProviderEvent::Fix(fix));
    }

    /// Deliver a status change to subscriptions on `provider`.
    pub fn emit_status(&self, provider: impl Into<ProviderId>, status: ProviderStatus) {
        let provider = provider.into();
        let event = ProviderEvent::Status {
            provider: provider.clone(),
            status,
        };
        self.deliver(Some(&provider), &event);
    }

    /// Deliver a heading to every subscription.
    pub fn emit_heading(&self, degrees: f64) {
        self.deliver(None, &ProviderEvent::Heading(degrees));
    }

    /// Signal the end of a deferred batch to every subscription.
    pub fn emit_deferred_finished(&self) {
        self.deliver(None, &ProviderEvent::DeferredUpdatesFinished);
    }

    /// Total successful and failed `subscribe` calls.
    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Total `unsubscribe` calls.
    #[must_use]
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Subscriptions currently registered.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.state().subscriptions.len()
    }

    /// The request passed to the most recent `subscribe`.
    #[must_use]
    pub fn last_request(&self) -> Option<UpdateRequest> {
        self.state().last_request.clone()
    }

    /// Every `allow_deferred_updates` call so far.
    #[must_use]
    pub fn deferral_requests(&self) -> Vec<DeferralRequest> {
        self.state().deferrals.clone()
    }

    /// Subscriptions with deferral currently allowed.
    #[must_use]
    pub fn deferring_subscriptions(&self) -> usize {
        self.state().deferring.len()
    }
}

impl ProviderSource for MockProvider {
    fn providers(&self) -> Vec<ProviderId> {
        self.state().providers.keys().cloned().collect()
    }

    fn is_enabled(&self, provider: &ProviderId) -> bool {
        self.state().providers.get(provider).is_some_and(|p| p.enabled)
    }

    fn last_known_fix(&self, provider: &ProviderId) -> Option<Fix> {
        self.state()
            .providers
            .get(provider)
            .and_then(|p| p.last_known.clone())
    }

    fn supports_heading(&self) -> bool {
        self.state().supports_heading
    }

    fn subscribe(
        &self,
        provider: &ProviderId,
        request: &UpdateRequest,
        sink: EventSink,
    ) -> Result<SubscriptionId, ProviderError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = &state.subscribe_failure {
            return Err(error.clone());
        }
        if !state.providers.contains_key(provider) {
            return Err(ProviderError::UnknownProvider(provider.clone()));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        state.last_request = Some(request.clone());
        state.subscriptions.insert(
            id,
            Subscription {
                provider: provider.clone(),
                sink,
            },
        );
        Ok(id)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ProviderError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let removed = state.subscriptions.remove(&subscription);
        state.deferring.retain(|id| *id != subscription);
        if let Some(error) = &state.unsubscribe_failure {
            return Err(error.clone());
        }
        removed
            .map(|_| ())
            .ok_or(ProviderError::UnknownSubscription(subscription))
    }

    fn supports_deferred_updates(&self) -> bool {
        self.state().supports_deferred_updates
    }

    fn allow_deferred_updates(
        &self,
        subscription: SubscriptionId,
        distance_m: Option<f64>,
        time: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        if !state.supports_deferred_updates {
            return Err(ProviderError::Unsupported {
                message: "deferred updates".to_string(),
            });
        }
        state.deferrals.push(DeferralRequest {
            subscription,
            distance_m,
            time,
        });
        if !state.deferring.contains(&subscription) {
            state.deferring.push(subscription);
        }
        Ok(())
    }

    fn disallow_deferred_updates(&self, subscription: SubscriptionId) -> Result<(), ProviderError> {
        self.state().deferring.retain(|id| *id != subscription);
        Ok(())
    }
}
