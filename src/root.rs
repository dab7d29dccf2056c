//! Root-level (cross-field) validation.
//!
//! Runs a dedicated suite under [`ROOT_KEY`]. The root suite is never the
//! per-field suite: without an explicit root suite this validator is
//! disabled and every call resolves to `None`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::outcome::{root_path, Outcome, INTERNAL_ERROR_MESSAGE, ROOT_KEY};
use crate::snapshot::Snapshot;
use crate::suite::{SuiteAdapter, SuiteRun, ValidationSuite};

/// When root validation runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootMode {
    /// Only once the form has been submitted at least once.
    #[default]
    Submit,
    /// On every (debounced) snapshot change.
    Live,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RootRun {
    Settled(Option<Outcome>),
    Superseded,
}

#[derive(Debug)]
pub struct RootValidator {
    adapter: SuiteAdapter,
    mode: RootMode,
    debounce: Duration,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl RootValidator {
    pub fn new(suite: Option<Arc<dyn ValidationSuite>>, mode: RootMode, debounce: Duration) -> Self {
        Self {
            adapter: SuiteAdapter::new(suite),
            mode,
            debounce,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.adapter.is_configured()
    }

    pub fn mode(&self) -> RootMode {
        self.mode
    }

    /// Whether a snapshot change should trigger root validation.
    pub fn is_armed(&self, submitted: bool) -> bool {
        self.is_enabled() && (self.mode == RootMode::Live || submitted)
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Evaluate cross-field rules against `snapshot`.
    ///
    /// Resolves to `Settled(None)` without touching the suite when disabled,
    /// or when in submit mode and the form has not been submitted yet.
    pub async fn validate(&self, snapshot: &Snapshot, submitted: bool) -> RootRun {
        if !self.is_armed(submitted) {
            return RootRun::Settled(None);
        }
        if self.closed.load(Ordering::SeqCst) {
            return RootRun::Superseded;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.debounce.is_zero() {
            tokio::time::sleep(self.debounce).await;
        }
        if !self.is_current(generation) {
            return RootRun::Superseded;
        }

        let root = root_path();
        let run = self.adapter.run(snapshot, Some(&root)).await;
        if !self.is_current(generation) {
            debug!(generation, "Discarding stale root validation result");
            return RootRun::Superseded;
        }

        let outcome = match run {
            SuiteRun::Completed(result) => result.outcome_for(&root),
            // Detail was logged by the adapter
            SuiteRun::Faulted(_) => Outcome::errors([INTERNAL_ERROR_MESSAGE]),
        };
        debug!(
            key = ROOT_KEY,
            errors = outcome.errors.len(),
            warnings = outcome.warnings.len(),
            "Root validation settled"
        );
        RootRun::Settled((!outcome.is_empty()).then_some(outcome))
    }

    /// Invalidate any in-flight root run.
    pub fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.supersede();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::{suite_fn, SuiteResult};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn password_suite(calls: Arc<AtomicUsize>) -> Arc<dyn ValidationSuite> {
        suite_fn(move |snapshot, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = snapshot.value();
            let mut result = SuiteResult::new();
            if value.get("password") != value.get("confirmPassword") {
                result.add_error(ROOT_KEY, "Passwords must match");
            }
            Ok(result)
        })
    }

    fn mismatched() -> Snapshot {
        Snapshot::new(json!({"password": "a", "confirmPassword": "b"}))
    }

    #[tokio::test]
    async fn test_submit_mode_gated_until_submitted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = RootValidator::new(
            Some(password_suite(calls.clone())),
            RootMode::Submit,
            Duration::ZERO,
        );

        assert_eq!(root.validate(&mismatched(), false).await, RootRun::Settled(None));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            root.validate(&mismatched(), true).await,
            RootRun::Settled(Some(Outcome::errors(["Passwords must match"])))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_live_mode_runs_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = RootValidator::new(
            Some(password_suite(calls.clone())),
            RootMode::Live,
            Duration::ZERO,
        );
        assert!(matches!(
            root.validate(&mismatched(), false).await,
            RootRun::Settled(Some(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_root_suite_is_disabled() {
        let root = RootValidator::new(None, RootMode::Live, Duration::ZERO);
        assert!(!root.is_enabled());
        assert_eq!(root.validate(&mismatched(), true).await, RootRun::Settled(None));
    }

    #[tokio::test]
    async fn test_fault_surfaces_generic_error() {
        let root = RootValidator::new(
            Some(suite_fn(|_, _| Err(anyhow::anyhow!("boom")))),
            RootMode::Live,
            Duration::ZERO,
        );
        assert_eq!(
            root.validate(&mismatched(), false).await,
            RootRun::Settled(Some(Outcome::errors([INTERNAL_ERROR_MESSAGE])))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_runs_take_latest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = Arc::new(RootValidator::new(
            Some(password_suite(calls.clone())),
            RootMode::Live,
            Duration::from_millis(50),
        ));
        let first = {
            let root = root.clone();
            tokio::spawn(async move { root.validate(&mismatched(), false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let matched = Snapshot::new(json!({"password": "a", "confirmPassword": "a"}));
        assert_eq!(root.validate(&matched, false).await, RootRun::Settled(None));
        assert_eq!(first.await.unwrap(), RootRun::Superseded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
