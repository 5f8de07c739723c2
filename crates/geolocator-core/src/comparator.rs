//! Fix quality comparison.
//!
//! [`is_better_fix`] decides whether a newly arrived fix supersedes the best
//! known one. Recency can override accuracy inside a two minute window and a
//! 200 m degradation tolerance, but only while the provider is unchanged.

use crate::provider::Fix;

/// Age difference past which the newer fix always wins, in milliseconds.
pub const SIGNIFICANT_TIME_DELTA_MS: i64 = 120_000;

/// Accuracy loss, in meters, a newer fix from the same provider may carry and
/// still win.
pub const SAME_PROVIDER_ACCURACY_TOLERANCE_M: f64 = 200.0;

/// Returns `true` if `candidate` should replace `current_best`.
///
/// Any candidate beats an absent best. Equal time and equal accuracy keep the
/// existing best.
#[must_use]
pub fn is_better_fix(candidate: &Fix, current_best: Option<&Fix>) -> bool {
    let Some(best) = current_best else {
        return true;
    };

    let time_delta = candidate.time_millis() - best.time_millis();
    if time_delta > SIGNIFICANT_TIME_DELTA_MS {
        return true;
    }
    if time_delta < -SIGNIFICANT_TIME_DELTA_MS {
        return false;
    }

    let accuracy_delta = accuracy_delta(candidate, best);
    let is_newer = time_delta > 0;

    if accuracy_delta < 0.0 {
        return true;
    }
    if is_newer && accuracy_delta <= 0.0 {
        return true;
    }
    is_newer
        && accuracy_delta <= SAME_PROVIDER_ACCURACY_TOLERANCE_M
        && candidate.provider == best.provider
}

/// Candidate accuracy minus best accuracy. Unreported accuracy is the worst
/// value, and two unreported accuracies compare equal.
fn accuracy_delta(candidate: &Fix, best: &Fix) -> f64 {
    match (candidate.position.accuracy, best.position.accuracy) {
        (None, None) => 0.0,
        _ => candidate.accuracy_meters() - best.accuracy_meters(),
    }
}

/// Running best-of over a stream of fixes.
///
/// Only ever replaces its fix with one that [`is_better_fix`] prefers.
#[derive(Debug, Clone, Default)]
pub struct BestFix {
    best: Option<Fix>,
}

impl BestFix {
    /// An empty tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self { best: None }
    }

    /// Offer a fix; returns `true` if it became the new best.
    pub fn offer(&mut self, fix: Fix) -> bool {
        if is_better_fix(&fix, self.best.as_ref()) {
            self.best = Some(fix);
            true
        } else {
            false
        }
    }

    /// The current best fix.
    #[must_use]
    pub const fn get(&self) -> Option<&Fix> {
        self.best.as_ref()
    }

    /// Consume the tracker, returning the best fix.
    #[must_use]
    pub fn into_inner(self) -> Option<Fix> {
        self.best
    }
}

impl FromIterator<Fix> for BestFix {
    fn from_iter<I: IntoIterator<Item = Fix>>(iter: I) -> Self {
        let mut best = Self::new();
        for fix in iter {
            best.offer(fix);
        }
        best
    }
}
