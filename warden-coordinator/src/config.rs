//! Runtime orchestration settings.
//!
//! Settings travel over a `tokio::sync::watch` channel and are read at
//! every call, never cached at spawn. That is what makes the bypass
//! decision (pre-upgrade clusters, or an operator kill switch) take effect
//! without restarting the coordinator.

use std::fmt;
use std::time::Duration;

use warden_core::ActivityOptions;

/// Cluster compatibility version, ordered lexicographically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompatVersion {
    pub major: u16,
    pub minor: u16,
}

impl CompatVersion {
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for CompatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// First compat version at which lease-gated orchestration is active.
/// Below this the whole cluster still runs pre-upgrade coordination, so
/// every call short-circuits to bypass behavior.
pub const MIN_ORCHESTRATION_COMPAT: CompatVersion = CompatVersion::new(2, 0);

/// Cluster-wide coordinator knobs.
#[derive(Clone, Debug)]
pub struct OrchestrationSettings {
    /// Effective cluster compatibility version.
    pub cluster_compat: CompatVersion,
    /// Force pre-upgrade behavior even on a compatible cluster.
    pub orchestration_disabled: bool,
    /// Admission patience when the request does not set one.
    pub default_quorum_timeout: Duration,
    /// Admission patience for unsafe requests.
    pub unsafe_quorum_timeout: Duration,
    /// Added to the quorum timeout to bound the caller's total wait.
    pub reply_grace: Duration,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            cluster_compat: MIN_ORCHESTRATION_COMPAT,
            orchestration_disabled: false,
            default_quorum_timeout: Duration::from_millis(15_000),
            unsafe_quorum_timeout: Duration::from_millis(2_000),
            reply_grace: Duration::from_millis(5_000),
        }
    }
}

impl OrchestrationSettings {
    /// True when calls must short-circuit to pre-upgrade behavior.
    #[must_use]
    pub fn bypass_active(&self) -> bool {
        self.orchestration_disabled || self.cluster_compat < MIN_ORCHESTRATION_COMPAT
    }

    /// Resolve the admission patience for a request.
    #[must_use]
    pub fn quorum_timeout_for(&self, options: &ActivityOptions) -> Duration {
        options.quorum_timeout.unwrap_or_else(|| {
            if options.is_unsafe() {
                self.unsafe_quorum_timeout
            } else {
                self.default_quorum_timeout
            }
        })
    }

    /// Resolve the caller's total wait bound for a request.
    #[must_use]
    pub fn total_timeout_for(&self, options: &ActivityOptions) -> Duration {
        options
            .timeout
            .unwrap_or_else(|| self.quorum_timeout_for(options) + self.reply_grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compat_versions_order_lexicographically() {
        assert!(CompatVersion::new(1, 9) < CompatVersion::new(2, 0));
        assert!(CompatVersion::new(2, 0) < CompatVersion::new(2, 1));
        assert!(CompatVersion::new(2, 1) < CompatVersion::new(10, 0));
    }

    #[test]
    fn bypass_below_min_compat_or_when_disabled() {
        let mut settings = OrchestrationSettings::default();
        assert!(!settings.bypass_active());

        settings.cluster_compat = CompatVersion::new(1, 5);
        assert!(settings.bypass_active());

        settings.cluster_compat = MIN_ORCHESTRATION_COMPAT;
        settings.orchestration_disabled = true;
        assert!(settings.bypass_active());
    }

    #[test]
    fn quorum_timeout_prefers_explicit_then_unsafe_default() {
        let settings = OrchestrationSettings::default();

        let explicit = ActivityOptions {
            quorum_timeout: Some(Duration::from_millis(50)),
            ..ActivityOptions::default()
        };
        assert_eq!(
            settings.quorum_timeout_for(&explicit),
            Duration::from_millis(50)
        );

        let unsafe_opts = ActivityOptions {
            unsafe_admission: Some(true),
            ..ActivityOptions::default()
        };
        assert_eq!(
            settings.quorum_timeout_for(&unsafe_opts),
            Duration::from_millis(2_000)
        );

        assert_eq!(
            settings.quorum_timeout_for(&ActivityOptions::default()),
            Duration::from_millis(15_000)
        );
    }

    #[test]
    fn total_timeout_is_quorum_timeout_plus_grace() {
        let settings = OrchestrationSettings::default();
        assert_eq!(
            settings.total_timeout_for(&ActivityOptions::default()),
            Duration::from_millis(20_000)
        );

        let explicit = ActivityOptions {
            timeout: Some(Duration::from_millis(123)),
            ..ActivityOptions::default()
        };
        assert_eq!(
            settings.total_timeout_for(&explicit),
            Duration::from_millis(123)
        );
    }
}
