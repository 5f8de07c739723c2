//! Location permission capability.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Boxed future returned by the capability traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which location permission an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// Location access while the application is in use.
    WhenInUse,
    /// Location access at all times, including in the background.
    Always,
}

/// Result of a permission check or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    /// Permission granted.
    Granted,
    /// Permission denied or not yet asked.
    Denied,
    /// Permission restricted by policy.
    Restricted,
}

impl PermissionStatus {
    /// Whether location access is allowed.
    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Platform permission prompts and checks.
pub trait PermissionChecker: Send + Sync + 'static {
    /// Current status without prompting.
    fn check(&self, level: PermissionLevel) -> BoxFuture<'_, PermissionStatus>;

    /// Ask the user for permission.
    fn request(&self, level: PermissionLevel) -> BoxFuture<'_, PermissionStatus>;
}

/// Checks permission, requesting it once if not yet granted.
pub(crate) async fn ensure_permission(checker: &dyn PermissionChecker, level: PermissionLevel) -> bool {
    if checker.check(level).await.is_granted() {
        return true;
    }

    tracing::info!(?level, "No location permission, requesting it");
    let status = checker.request(level).await;
    if status.is_granted() {
        true
    } else {
        tracing::warn!(?level, ?status, "Location permission denied");
        false
    }
}

/// A permission checker with a fixed answer, for platforms without a
/// permission model.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission(pub PermissionStatus);

impl StaticPermission {
    /// Always granted.
    #[must_use]
    pub const fn granted() -> Self {
        Self(PermissionStatus::Granted)
    }

    /// Always denied.
    #[must_use]
    pub const fn denied() -> Self {
        Self(PermissionStatus::Denied)
    }
}

impl PermissionChecker for StaticPermission {
    fn check(&self, _level: PermissionLevel) -> BoxFuture<'_, PermissionStatus> {
        let status = self.0;
        Box::pin(async move { status })
    }

    fn request(&self, level: PermissionLevel) -> BoxFuture<'_, PermissionStatus> {
        self.check(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Denies the first check, grants on request.
    struct PromptOnce {
        requests: AtomicUsize,
    }

    impl PermissionChecker for PromptOnce {
        fn check(&self, _level: PermissionLevel) -> BoxFuture<'_, PermissionStatus> {
            Box::pin(async { PermissionStatus::Denied })
        }

        fn request(&self, _level: PermissionLevel) -> BoxFuture<'_, PermissionStatus> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { PermissionStatus::Granted })
        }
    }

    #[tokio::test]
    async fn test_granted_does_not_prompt() {
        assert!(ensure_permission(&StaticPermission::granted(), PermissionLevel::WhenInUse).await);
    }

    #[tokio::test]
    async fn test_denied_stays_denied() {
        assert!(!ensure_permission(&StaticPermission::denied(), PermissionLevel::Always).await);
    }

    #[tokio::test]
    async fn test_prompts_once_when_not_granted() {
        let checker = PromptOnce {
            requests: AtomicUsize::new(0),
        };
        assert!(ensure_permission(&checker, PermissionLevel::WhenInUse).await);
        assert_eq!(checker.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_static_permission_is_ready_immediately() {
        let status = tokio_test::block_on(StaticPermission::granted().check(PermissionLevel::Always));
        assert!(status.is_granted());
    }
}
