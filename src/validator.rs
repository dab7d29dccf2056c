//! Per-field async validation.
//!
//! Each field path gets one lazily created pipeline that lives as long as the
//! field does. A pipeline is little more than a generation counter: every
//! [`FieldValidator::validate`] call takes the next generation, waits out the
//! debounce window and checks that it is still the newest before calling the
//! suite, and checks again before reporting. Anything older is reported as
//! [`ValidationRun::Superseded`] and must be ignored by the caller, so a
//! consumer never observes a result older than the latest submitted value.
//!
//! Warnings do not affect validity. They are written to the
//! [`WarningChannel`] keyed by path, alongside whatever verdict the field
//! gets, and cleared when a later run produces none.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::outcome::FieldVerdict;
use crate::path::FieldPath;
use crate::snapshot::Snapshot;
use crate::suite::{SuiteAdapter, SuiteRun};

/// Side channel of advisory warnings, keyed by field path.
#[derive(Debug, Default)]
pub struct WarningChannel {
    entries: Mutex<BTreeMap<FieldPath, Vec<String>>>,
}

impl WarningChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<FieldPath, Vec<String>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record warnings for `path`; an empty list clears the entry.
    pub fn set(&self, path: &FieldPath, warnings: Vec<String>) {
        let mut entries = self.lock();
        if warnings.is_empty() {
            entries.remove(path);
        } else {
            entries.insert(path.clone(), warnings);
        }
    }

    pub fn get(&self, path: &FieldPath) -> Option<Vec<String>> {
        self.lock().get(path).cloned()
    }

    pub fn remove(&self, path: &FieldPath) {
        self.lock().remove(path);
    }

    pub fn all(&self) -> BTreeMap<FieldPath, Vec<String>> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// What a single `validate` call ended with.
#[derive(Clone, Debug, PartialEq)]
pub enum ValidationRun {
    /// This run is the newest for its field; apply the verdict.
    Settled(FieldVerdict),
    /// A newer run (or teardown) overtook this one; drop it.
    Superseded,
}

#[derive(Debug, Default)]
struct FieldPipeline {
    generation: AtomicU64,
}

impl FieldPipeline {
    fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Debounced, take-latest validation of individual fields.
#[derive(Debug)]
pub struct FieldValidator {
    adapter: SuiteAdapter,
    debounce: Duration,
    pipelines: Mutex<HashMap<FieldPath, Arc<FieldPipeline>>>,
    warnings: Arc<WarningChannel>,
    closed: AtomicBool,
}

impl FieldValidator {
    pub fn new(adapter: SuiteAdapter, debounce: Duration, warnings: Arc<WarningChannel>) -> Self {
        Self {
            adapter,
            debounce,
            pipelines: Mutex::new(HashMap::new()),
            warnings,
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FieldPath, Arc<FieldPipeline>>> {
        self.pipelines.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pipeline(&self, path: &FieldPath) -> Arc<FieldPipeline> {
        self.lock().entry(path.clone()).or_default().clone()
    }

    fn still_current(&self, pipeline: &FieldPipeline, generation: u64) -> bool {
        !self.closed.load(Ordering::SeqCst) && pipeline.is_current(generation)
    }

    /// Validate `candidate` as the value of `path`.
    ///
    /// The suite sees `base` with `path` overwritten by `candidate`.
    pub async fn validate(
        &self,
        path: &FieldPath,
        candidate: Value,
        base: &Snapshot,
    ) -> ValidationRun {
        if self.closed.load(Ordering::SeqCst) {
            return ValidationRun::Superseded;
        }

        let pipeline = self.pipeline(path);
        let generation = pipeline.advance();
        let snapshot = base.with_value(path, candidate);

        if !self.debounce.is_zero() {
            tokio::time::sleep(self.debounce).await;
        }
        if !self.still_current(&pipeline, generation) {
            debug!(field = %path, generation, "Dropping debounced candidate");
            return ValidationRun::Superseded;
        }

        let run = self.adapter.run(&snapshot, Some(path)).await;

        if !self.still_current(&pipeline, generation) {
            debug!(field = %path, generation, "Discarding stale validation result");
            return ValidationRun::Superseded;
        }

        let verdict = match run {
            SuiteRun::Completed(result) => {
                let outcome = result.outcome_for(path);
                self.warnings.set(path, outcome.warnings.clone());
                FieldVerdict::from_outcome(&outcome)
            }
            SuiteRun::Faulted(message) => {
                self.warnings.remove(path);
                FieldVerdict::InternalError { message }
            }
        };
        ValidationRun::Settled(verdict)
    }

    /// Invalidate any in-flight run for `path` without starting a new one.
    ///
    /// Returns the generation now current, for callers that evaluate the
    /// field by other means and must check they were not overtaken.
    pub fn supersede(&self, path: &FieldPath) -> u64 {
        self.pipeline(path).advance()
    }

    pub fn is_current(&self, path: &FieldPath, generation: u64) -> bool {
        match self.lock().get(path) {
            Some(pipeline) => self.still_current(pipeline, generation),
            None => false,
        }
    }

    /// Drop the pipeline and warnings of a field that went away.
    pub fn forget(&self, path: &FieldPath) {
        if let Some(pipeline) = self.lock().remove(path) {
            pipeline.advance();
        }
        self.warnings.remove(path);
    }

    pub fn pipeline_count(&self) -> usize {
        self.lock().len()
    }

    /// Stop every pipeline. In-flight runs resolve as superseded.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut pipelines = self.lock();
        for pipeline in pipelines.values() {
            pipeline.advance();
        }
        pipelines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::{async_suite_fn, suite_fn, SuiteResult};
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    fn counting_required_suite(calls: Arc<AtomicUsize>) -> SuiteAdapter {
        SuiteAdapter::new(Some(suite_fn(move |snapshot, field| {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut result = SuiteResult::new();
            let field = field.expect("scoped call");
            match snapshot.get(field) {
                Some(Value::String(s)) if !s.is_empty() => {
                    if s.len() < 3 {
                        result.add_warning(field.as_str(), "Rather short");
                    }
                }
                _ => result.add_error(field.as_str(), "Required"),
            }
            Ok(result)
        })))
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_with_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let validator = FieldValidator::new(
            counting_required_suite(calls.clone()),
            Duration::ZERO,
            Arc::new(WarningChannel::new()),
        );
        let run = validator
            .validate(&p("name"), json!(""), &Snapshot::empty())
            .await;
        assert_eq!(
            run,
            ValidationRun::Settled(FieldVerdict::Invalid {
                errors: vec!["Required".into()]
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(validator.pipeline_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warnings_go_to_side_channel() {
        let warnings = Arc::new(WarningChannel::new());
        let validator = FieldValidator::new(
            counting_required_suite(Arc::new(AtomicUsize::new(0))),
            Duration::ZERO,
            warnings.clone(),
        );

        let run = validator
            .validate(&p("name"), json!("ab"), &Snapshot::empty())
            .await;
        assert_eq!(run, ValidationRun::Settled(FieldVerdict::Valid));
        assert_eq!(warnings.get(&p("name")), Some(vec!["Rather short".into()]));

        validator
            .validate(&p("name"), json!("abcdef"), &Snapshot::empty())
            .await;
        assert_eq!(warnings.get(&p("name")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_to_latest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let validator = Arc::new(FieldValidator::new(
            counting_required_suite(calls.clone()),
            Duration::from_millis(100),
            Arc::new(WarningChannel::new()),
        ));

        let mut handles = Vec::new();
        for value in ["", "a", "abc"] {
            let validator = validator.clone();
            handles.push(tokio::spawn(async move {
                validator
                    .validate(&p("name"), json!(value), &Snapshot::empty())
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results[0], ValidationRun::Superseded);
        assert_eq!(results[1], ValidationRun::Superseded);
        assert_eq!(results[2], ValidationRun::Settled(FieldVerdict::Valid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_stale_result_is_discarded() {
        // First value resolves slowly, second quickly; only the second counts
        let suite = async_suite_fn(|snapshot, _field| async move {
            let name = snapshot
                .value()
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name == "slow" {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(SuiteResult::new().with_error("name", "From slow"))
            } else {
                Ok(SuiteResult::new())
            }
        });
        let validator = Arc::new(FieldValidator::new(
            SuiteAdapter::new(Some(suite)),
            Duration::ZERO,
            Arc::new(WarningChannel::new()),
        ));

        let first = {
            let validator = validator.clone();
            tokio::spawn(async move {
                validator
                    .validate(&p("name"), json!("slow"), &Snapshot::empty())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = validator
            .validate(&p("name"), json!("fast"), &Snapshot::empty())
            .await;

        assert_eq!(second, ValidationRun::Settled(FieldVerdict::Valid));
        assert_eq!(first.await.unwrap(), ValidationRun::Superseded);
    }

    #[tokio::test]
    async fn test_fault_becomes_internal_error() {
        let validator = FieldValidator::new(
            SuiteAdapter::new(Some(suite_fn(|_, _| Err(anyhow!("lookup service down"))))),
            Duration::ZERO,
            Arc::new(WarningChannel::new()),
        );
        let run = validator
            .validate(&p("email"), json!("a@b.c"), &Snapshot::empty())
            .await;
        assert_eq!(
            run,
            ValidationRun::Settled(FieldVerdict::InternalError {
                message: "lookup service down".into()
            })
        );
    }

    #[tokio::test]
    async fn test_candidate_overrides_base() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in_suite = seen.clone();
        let validator = FieldValidator::new(
            SuiteAdapter::new(Some(suite_fn(move |snapshot, _| {
                *seen_in_suite.lock().unwrap() = Some(snapshot.value().clone());
                Ok(SuiteResult::new())
            }))),
            Duration::ZERO,
            Arc::new(WarningChannel::new()),
        );
        let base = Snapshot::new(json!({"a": 1, "b": 2}));
        validator.validate(&p("b"), json!(3), &base).await;

        assert_eq!(*seen.lock().unwrap(), Some(json!({"a": 1, "b": 3})));
        assert_eq!(base.value(), &json!({"a": 1, "b": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_supersede_drops_in_flight_run() {
        let validator = Arc::new(FieldValidator::new(
            counting_required_suite(Arc::new(AtomicUsize::new(0))),
            Duration::from_millis(50),
            Arc::new(WarningChannel::new()),
        ));
        let in_flight = {
            let validator = validator.clone();
            tokio::spawn(async move {
                validator
                    .validate(&p("name"), json!("abc"), &Snapshot::empty())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let generation = validator.supersede(&p("name"));
        assert!(validator.is_current(&p("name"), generation));
        assert_eq!(in_flight.await.unwrap(), ValidationRun::Superseded);
        assert!(!validator.is_current(&p("other"), generation));
    }

    #[tokio::test]
    async fn test_shutdown_supersedes_everything() {
        let validator = FieldValidator::new(
            counting_required_suite(Arc::new(AtomicUsize::new(0))),
            Duration::ZERO,
            Arc::new(WarningChannel::new()),
        );
        validator
            .validate(&p("a"), json!("x"), &Snapshot::empty())
            .await;
        validator.shutdown();
        assert_eq!(validator.pipeline_count(), 0);
        assert_eq!(
            validator
                .validate(&p("a"), json!("x"), &Snapshot::empty())
                .await,
            ValidationRun::Superseded
        );
    }
}
