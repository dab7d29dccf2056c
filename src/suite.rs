//! Validation suite adapter.
//!
//! The rule language is not ours. Whatever evaluates rules is plugged in
//! behind [`ValidationSuite`] and called through [`SuiteAdapter`], which
//! gives every caller the same contract:
//!
//! - no suite configured → empty result, never blocks, never fails
//! - suite returns `Err` or panics → [`SuiteRun::Faulted`] with the detail,
//!   never an escaped error
//! - a field path scopes evaluation to the rules for that field; no path
//!   evaluates the whole form

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::outcome::Outcome;
use crate::path::FieldPath;
use crate::snapshot::Snapshot;

/// Messages produced by one suite evaluation, keyed by field path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteResult {
    #[serde(default)]
    errors: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    warnings: BTreeMap<String, Vec<String>>,
}

impl SuiteResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`add_error`](Self::add_error).
    pub fn with_error(mut self, field: &str, message: impl Into<String>) -> Self {
        self.add_error(field, message);
        self
    }

    /// Builder-style [`add_warning`](Self::add_warning).
    pub fn with_warning(mut self, field: &str, message: impl Into<String>) -> Self {
        self.add_warning(field, message);
        self
    }

    pub fn add_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(normalise_key(field))
            .or_default()
            .push(message.into());
    }

    pub fn add_warning(&mut self, field: &str, message: impl Into<String>) {
        self.warnings
            .entry(normalise_key(field))
            .or_default()
            .push(message.into());
    }

    pub fn errors_for(&self, field: &FieldPath) -> Option<&[String]> {
        self.errors.get(field.as_str()).map(Vec::as_slice)
    }

    pub fn warnings_for(&self, field: &FieldPath) -> Option<&[String]> {
        self.warnings.get(field.as_str()).map(Vec::as_slice)
    }

    /// The errors and warnings for one field as an [`Outcome`].
    pub fn outcome_for(&self, field: &FieldPath) -> Outcome {
        Outcome::new(
            self.errors_for(field).map(<[String]>::to_vec).unwrap_or_default(),
            self.warnings_for(field).map(<[String]>::to_vec).unwrap_or_default(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.errors.values().all(Vec::is_empty) && self.warnings.values().all(Vec::is_empty)
    }
}

fn normalise_key(field: &str) -> String {
    FieldPath::parse(field)
        .map(String::from)
        .unwrap_or_else(|_| field.to_string())
}

/// An externally supplied rule-evaluation capability.
///
/// When `field` is `Some`, implementations should only run rules relevant to
/// that field. Results for other fields in the returned [`SuiteResult`] are
/// ignored by per-field callers.
#[async_trait]
pub trait ValidationSuite: Send + Sync {
    async fn evaluate(
        &self,
        snapshot: &Snapshot,
        field: Option<&FieldPath>,
    ) -> anyhow::Result<SuiteResult>;
}

/// Result of running a suite through the adapter.
#[derive(Clone, Debug, PartialEq)]
pub enum SuiteRun {
    Completed(SuiteResult),
    /// The suite errored or panicked. Carries the diagnostic message.
    Faulted(String),
}

/// Uniform call contract around an optional [`ValidationSuite`].
#[derive(Clone, Default)]
pub struct SuiteAdapter {
    suite: Option<Arc<dyn ValidationSuite>>,
}

impl SuiteAdapter {
    pub fn new(suite: Option<Arc<dyn ValidationSuite>>) -> Self {
        Self { suite }
    }

    pub fn is_configured(&self) -> bool {
        self.suite.is_some()
    }

    /// Evaluate the suite, scoped to `field` when given.
    pub async fn run(&self, snapshot: &Snapshot, field: Option<&FieldPath>) -> SuiteRun {
        let Some(suite) = &self.suite else {
            return SuiteRun::Completed(SuiteResult::default());
        };

        let scope = field.map(FieldPath::as_str).unwrap_or("<form>");
        debug!(scope, "Evaluating validation suite");

        match AssertUnwindSafe(suite.evaluate(snapshot, field))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => SuiteRun::Completed(result),
            Ok(Err(e)) => {
                let message = format!("{e:#}");
                warn!(scope, error = %message, "Validation suite failed");
                SuiteRun::Faulted(message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(scope, error = %message, "Validation suite panicked");
                SuiteRun::Faulted(message)
            }
        }
    }
}

impl std::fmt::Debug for SuiteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteAdapter")
            .field("configured", &self.is_configured())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "suite panicked".to_string()
    }
}

// ─── Closure adapters ─────────────────────────────────────────

/// Suite backed by a synchronous closure.
pub struct FnSuite<F>(F);

/// Wrap a synchronous closure as a [`ValidationSuite`].
pub fn suite_fn<F>(f: F) -> Arc<dyn ValidationSuite>
where
    F: Fn(&Snapshot, Option<&FieldPath>) -> anyhow::Result<SuiteResult> + Send + Sync + 'static,
{
    Arc::new(FnSuite(f))
}

#[async_trait]
impl<F> ValidationSuite for FnSuite<F>
where
    F: Fn(&Snapshot, Option<&FieldPath>) -> anyhow::Result<SuiteResult> + Send + Sync,
{
    async fn evaluate(
        &self,
        snapshot: &Snapshot,
        field: Option<&FieldPath>,
    ) -> anyhow::Result<SuiteResult> {
        (self.0)(snapshot, field)
    }
}

/// Suite backed by a closure returning a future.
pub struct AsyncFnSuite<F>(F);

/// Wrap an async closure as a [`ValidationSuite`]. Arguments are passed by
/// value so the returned future can be `'static`.
pub fn async_suite_fn<F, Fut>(f: F) -> Arc<dyn ValidationSuite>
where
    F: Fn(Snapshot, Option<FieldPath>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<SuiteResult>> + Send + 'static,
{
    Arc::new(AsyncFnSuite(f))
}

#[async_trait]
impl<F, Fut> ValidationSuite for AsyncFnSuite<F>
where
    F: Fn(Snapshot, Option<FieldPath>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<SuiteResult>> + Send + 'static,
{
    async fn evaluate(
        &self,
        snapshot: &Snapshot,
        field: Option<&FieldPath>,
    ) -> anyhow::Result<SuiteResult> {
        (self.0)(snapshot.clone(), field.cloned()).await
    }
}
