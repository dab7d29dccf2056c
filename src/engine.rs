//! The form engine.
//!
//! [`FormEngine`] owns the control tree, the published snapshot, the
//! validators and every background task:
//!
//! - an event loop over the tree's value events, which runs the sync tick
//!   and starts field validation for user edits and newly mounted nodes
//! - one dependency watcher per trigger (see [`crate::scheduler`])
//! - short-lived field and root validation tasks
//!
//! All of them are aborted by [`FormEngine::shutdown`], which also runs on
//! drop. Consumers observe the engine through [`FormEngine::subscribe`].

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, AggregateInput, AggregatedState, StatePublisher};
use crate::config::{DependencyMap, EngineConfig};
use crate::control::{ChangeOrigin, ControlEvent, ControlTree, FormStatus};
use crate::error::{FormSyncError, Result};
use crate::in_progress::InProgressSet;
use crate::outcome::{FieldVerdict, Outcome};
use crate::path::{get_in, set_in, FieldPath};
use crate::root::{RootRun, RootValidator};
use crate::scheduler::{DependencyScheduler, Revalidate, SchedulerSettings};
use crate::snapshot::Snapshot;
use crate::suite::{SuiteAdapter, SuiteRun, ValidationSuite};
use crate::sync::{SnapshotSynchronizer, SyncAction};
use crate::validator::{FieldValidator, ValidationRun, WarningChannel};

// ─── Builder ───────────────────────────────────────────────────────────

/// Configures and starts a [`FormEngine`].
pub struct FormEngineBuilder {
    config: EngineConfig,
    suite: Option<Arc<dyn ValidationSuite>>,
    root_suite: Option<Arc<dyn ValidationSuite>>,
    snapshot: Value,
}

impl Default for FormEngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            suite: None,
            root_suite: None,
            snapshot: Value::Object(Default::default()),
        }
    }
}

impl FormEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Per-field rules. Without one every field validates clean.
    pub fn suite(mut self, suite: Arc<dyn ValidationSuite>) -> Self {
        self.suite = Some(suite);
        self
    }

    /// Cross-field rules, evaluated under the root key. Never defaults to the
    /// per-field suite.
    pub fn root_suite(mut self, suite: Arc<dyn ValidationSuite>) -> Self {
        self.root_suite = Some(suite);
        self
    }

    /// Initial model value.
    pub fn snapshot(mut self, value: Value) -> Self {
        self.snapshot = value;
        self
    }

    /// Start the engine. Must be called from within a tokio runtime.
    pub fn build(self) -> FormEngine {
        let config = self.config;
        let tree = Arc::new(ControlTree::new(config.event_buffer));
        let warnings = Arc::new(WarningChannel::new());
        let in_progress = Arc::new(InProgressSet::new());
        let snapshot = Snapshot::new(self.snapshot);
        let (snapshot_tx, _rx) = watch::channel(snapshot.clone());
        let adapter = SuiteAdapter::new(self.suite);

        // Subscribe before anything can be registered
        let events = tree.subscribe_values();

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let revalidator: Weak<dyn Revalidate> = weak.clone();
            EngineInner {
                scheduler: DependencyScheduler::new(
                    SchedulerSettings {
                        debounce: config.dependency_debounce(),
                        idle_timeout: config.idle_timeout(),
                        in_progress_ttl: config.in_progress_ttl(),
                    },
                    tree.clone(),
                    in_progress.clone(),
                    revalidator,
                ),
                field_validator: FieldValidator::new(
                    adapter.clone(),
                    config.field_debounce(),
                    warnings.clone(),
                ),
                root: RootValidator::new(
                    self.root_suite,
                    config.root_mode,
                    config.root_debounce(),
                ),
                adapter,
                sync: Mutex::new(SnapshotSynchronizer::new(tree.leaf_values(), snapshot)),
                snapshot: snapshot_tx,
                publisher: StatePublisher::new(),
                root_outcome: Mutex::new(None),
                root_pending: AtomicBool::new(false),
                submitted: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                dependencies: Mutex::new(config.dependencies.clone()),
                tasks: Mutex::new(Vec::new()),
                tree,
                warnings,
                in_progress,
                config,
            }
        });

        let event_loop = tokio::spawn(run_event_loop(Arc::downgrade(&inner), events));
        inner.track(event_loop);
        inner.scheduler.start(&inner.config.dependencies);
        inner.republish();

        info!(
            root_mode = ?inner.config.root_mode,
            root_enabled = inner.root.is_enabled(),
            triggers = inner.config.dependencies.len(),
            "Form engine started"
        );

        FormEngine { inner }
    }
}

// ─── Shared state ──────────────────────────────────────────────────────

struct EngineInner {
    config: EngineConfig,
    tree: Arc<ControlTree>,
    adapter: SuiteAdapter,
    field_validator: FieldValidator,
    root: RootValidator,
    scheduler: DependencyScheduler,
    warnings: Arc<WarningChannel>,
    in_progress: Arc<InProgressSet>,
    sync: Mutex<SnapshotSynchronizer>,
    snapshot: watch::Sender<Snapshot>,
    publisher: StatePublisher,
    root_outcome: Mutex<Option<Outcome>>,
    root_pending: AtomicBool,
    submitted: AtomicBool,
    closed: AtomicBool,
    dependencies: Mutex<DependencyMap>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EngineInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(FormSyncError::Closed)
        } else {
            Ok(())
        }
    }

    fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Returns whether the published snapshot actually changed.
    fn publish_snapshot(&self, next: Snapshot) -> bool {
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    /// Reconcile tree and snapshot, then follow up on whatever moved.
    fn sync_tick(self: &Arc<Self>) {
        let (patched, snapshot_moved) = {
            // Held across the reads so concurrent ticks cannot publish stale values
            let mut sync = lock(&self.sync);
            let leaves = self.tree.leaf_values();
            let snapshot = self.snapshot();
            match sync.reconcile(&leaves, &snapshot) {
                SyncAction::Idle => (Vec::new(), false),
                SyncAction::Settled => (Vec::new(), true),
                SyncAction::Publish(next) => (Vec::new(), self.publish_snapshot(next)),
                SyncAction::PatchTree(next) => {
                    let patched = self.tree.patch_values(next.value());
                    sync.acknowledge_tree(self.tree.leaf_values());
                    (patched, true)
                }
            }
        };

        if !patched.is_empty() {
            debug!(fields = patched.len(), "Patched tree from snapshot");
        }
        for path in patched {
            self.spawn_validation(path);
        }
        if snapshot_moved {
            self.schedule_root();
        }
        self.republish();
    }

    fn republish(&self) {
        let nodes = self.tree.nodes();
        let warnings = self.warnings.all();
        let root = lock(&self.root_outcome).clone();
        let state = aggregate(AggregateInput {
            value: self.snapshot().into_value(),
            nodes: &nodes,
            warnings: &warnings,
            root: root.as_ref(),
            root_pending: self.root_pending.load(Ordering::SeqCst),
            submitted: self.submitted.load(Ordering::SeqCst),
        });
        self.publisher.publish(state);
    }

    fn spawn_validation(self: &Arc<Self>, path: FieldPath) {
        if self.is_closed() {
            return;
        }
        let engine = self.clone();
        self.track(tokio::spawn(async move {
            engine.validate_path(&path).await;
        }));
    }

    /// Validate `path` against its current value. `None` if it is not mounted.
    async fn validate_path(&self, path: &FieldPath) -> Option<ValidationRun> {
        let node = self.tree.node(path)?;
        if node.disabled {
            return Some(ValidationRun::Settled(FieldVerdict::Valid));
        }

        self.tree.set_pending(path);
        self.republish();

        let base = self.snapshot();
        let run = self.field_validator.validate(path, node.value, &base).await;
        if let ValidationRun::Settled(verdict) = &run {
            // The node may have been removed meanwhile; nothing to apply then
            self.tree.apply_verdict(path, verdict.clone());
            self.republish();
        }
        Some(run)
    }

    /// Evaluate the suite once for the whole form and apply it to every
    /// enabled field that was not edited again in the meantime.
    async fn validate_all(&self) {
        let targets: Vec<(FieldPath, u64)> = self
            .tree
            .nodes()
            .into_iter()
            .filter(|(_, node)| !node.disabled)
            .map(|(path, _)| {
                let generation = self.field_validator.supersede(&path);
                self.tree.set_pending(&path);
                (path, generation)
            })
            .collect();
        self.republish();

        let snapshot = self.snapshot();
        let run = self.adapter.run(&snapshot, None).await;

        let mut applied = 0usize;
        for (path, generation) in targets {
            if !self.field_validator.is_current(&path, generation) {
                continue;
            }
            let verdict = match &run {
                SuiteRun::Completed(result) => {
                    let outcome = result.outcome_for(&path);
                    self.warnings.set(&path, outcome.warnings.clone());
                    FieldVerdict::from_outcome(&outcome)
                }
                SuiteRun::Faulted(message) => {
                    self.warnings.remove(&path);
                    FieldVerdict::InternalError {
                        message: message.clone(),
                    }
                }
            };
            if self.tree.apply_verdict(&path, verdict) {
                applied += 1;
            }
        }
        debug!(fields = applied, "Whole-form validation applied");
        self.republish();
    }

    fn schedule_root(self: &Arc<Self>) {
        if self.is_closed() || !self.root.is_armed(self.submitted.load(Ordering::SeqCst)) {
            return;
        }
        let engine = self.clone();
        self.track(tokio::spawn(async move { engine.run_root().await }));
    }

    async fn run_root(&self) {
        let submitted = self.submitted.load(Ordering::SeqCst);
        if !self.root.is_armed(submitted) {
            return;
        }
        self.root_pending.store(true, Ordering::SeqCst);
        self.republish();

        let snapshot = self.snapshot();
        match self.root.validate(&snapshot, submitted).await {
            RootRun::Settled(outcome) => {
                *lock(&self.root_outcome) = outcome;
                self.root_pending.store(false, Ordering::SeqCst);
                self.republish();
            }
            // A newer run owns the pending flag now
            RootRun::Superseded => {}
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.stop();
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
        self.field_validator.shutdown();
        self.root.shutdown();
        self.in_progress.clear();
        info!("Form engine shut down");
    }
}

#[async_trait]
impl Revalidate for EngineInner {
    async fn revalidate(&self, path: &FieldPath, emit: bool) -> bool {
        if self.is_closed() || !self.tree.contains(path) {
            return false;
        }
        if emit {
            self.tree.emit_revalidated(path);
        }
        self.validate_path(path).await.is_some()
    }
}

async fn run_event_loop(engine: Weak<EngineInner>, mut events: broadcast::Receiver<ControlEvent>) {
    loop {
        let event = events.recv().await;
        let Some(inner) = engine.upgrade() else {
            break;
        };
        match event {
            Ok(ControlEvent::ValueChanged {
                path,
                origin: ChangeOrigin::User,
            }) => {
                inner.sync_tick();
                inner.spawn_validation(path);
            }
            // Forced revalidations validate themselves; status is republished
            // by whoever changed it
            Ok(ControlEvent::ValueChanged { .. } | ControlEvent::StatusChanged(_)) => {}
            Ok(ControlEvent::NodeAdded(path)) => {
                inner.sync_tick();
                inner.spawn_validation(path);
            }
            Ok(ControlEvent::NodeRemoved(path)) => {
                inner.field_validator.forget(&path);
                inner.sync_tick();
            }
            Err(RecvError::Lagged(skipped)) => {
                // The skipped edits are unknown, so every field is revalidated
                warn!(skipped, "Engine event loop lagged, resynchronising");
                inner.sync_tick();
                for path in inner.tree.paths() {
                    inner.spawn_validation(path);
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Engine event loop stopped");
}

// ─── Public handle ─────────────────────────────────────────────────────

/// Synchronises a control tree with an immutable snapshot and orchestrates
/// field, dependency and root validation over it.
pub struct FormEngine {
    inner: Arc<EngineInner>,
}

impl FormEngine {
    pub fn builder() -> FormEngineBuilder {
        FormEngineBuilder::default()
    }

    fn known(&self, path: impl AsRef<str>) -> Result<FieldPath> {
        let path = FieldPath::parse(path.as_ref())?;
        if self.inner.tree.contains(&path) {
            Ok(path)
        } else {
            Err(FormSyncError::UnknownField(path.to_string()))
        }
    }

    // ── Field lifecycle ──

    /// Mount a field. Its value is seeded from the current snapshot, or
    /// `null` when the snapshot has nothing at that path.
    pub fn register_field(&self, path: impl AsRef<str>) -> Result<FieldPath> {
        self.inner.ensure_open()?;
        let path = FieldPath::parse(path.as_ref())?;
        let initial = self.inner.snapshot().get(&path).cloned().unwrap_or(Value::Null);
        if self.inner.tree.register(path.clone(), initial) {
            debug!(field = %path, "Field registered");
            self.inner.sync_tick();
        }
        Ok(path)
    }

    /// Unmount a field, dropping its pipeline and warnings. Returns whether
    /// it was registered.
    pub fn remove_field(&self, path: impl AsRef<str>) -> Result<bool> {
        self.inner.ensure_open()?;
        let path = FieldPath::parse(path.as_ref())?;
        if self.inner.tree.remove(&path).is_none() {
            return Ok(false);
        }
        self.inner.field_validator.forget(&path);
        self.inner.sync_tick();
        Ok(true)
    }

    /// A user edit. The snapshot is republished immediately; validation
    /// follows asynchronously.
    pub fn set_value(&self, path: impl AsRef<str>, value: Value) -> Result<()> {
        self.inner.ensure_open()?;
        let path = self.known(path)?;
        self.inner.tree.set_value(&path, value)?;
        self.inner.sync_tick();
        Ok(())
    }

    /// Replace the external model. Matching nodes are patched without
    /// emitting user-change events, then revalidated.
    pub fn set_snapshot(&self, value: Value) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.snapshot.send_replace(Snapshot::new(value));
        self.inner.sync_tick();
        Ok(())
    }

    pub fn mark_touched(&self, path: impl AsRef<str>) -> Result<()> {
        self.inner.ensure_open()?;
        let path = self.known(path)?;
        self.inner.tree.mark_touched(&path);
        self.inner.republish();
        Ok(())
    }

    /// Disabled fields drop out of the value, carry no errors or warnings
    /// and are skipped by validation. Re-enabling revalidates.
    pub fn set_disabled(&self, path: impl AsRef<str>, disabled: bool) -> Result<()> {
        self.inner.ensure_open()?;
        let path = self.known(path)?;
        self.inner.tree.set_disabled(&path, disabled);
        if disabled {
            self.inner.field_validator.supersede(&path);
            self.inner.warnings.remove(&path);
        } else {
            self.inner.spawn_validation(path);
        }
        self.inner.sync_tick();
        Ok(())
    }

    // ── Validation ──

    pub async fn validate_field(&self, path: impl AsRef<str>) -> Result<ValidationRun> {
        self.inner.ensure_open()?;
        let path = self.known(path)?;
        self.inner
            .validate_path(&path)
            .await
            .ok_or_else(|| FormSyncError::UnknownField(path.to_string()))
    }

    /// Validate every field at or below `prefix`.
    pub async fn validate_group(
        &self,
        prefix: impl AsRef<str>,
    ) -> Result<Vec<(FieldPath, ValidationRun)>> {
        self.inner.ensure_open()?;
        let prefix = FieldPath::parse(prefix.as_ref())?;
        let paths = self.inner.tree.paths_within(&prefix);
        let runs = join_all(paths.iter().map(|path| self.inner.validate_path(path))).await;
        Ok(paths
            .into_iter()
            .zip(runs)
            .filter_map(|(path, run)| run.map(|run| (path, run)))
            .collect())
    }

    /// Evaluate the suite once for the whole form.
    pub async fn validate_form(&self) -> Result<Arc<AggregatedState>> {
        self.inner.ensure_open()?;
        self.inner.validate_all().await;
        Ok(self.state())
    }

    /// Mark the form submitted, touch every field and run whole-form and
    /// root validation. Root validation in submit mode is armed from here on.
    pub async fn submit(&self) -> Result<Arc<AggregatedState>> {
        self.inner.ensure_open()?;
        self.inner.submitted.store(true, Ordering::SeqCst);
        self.inner.tree.mark_all_touched();
        info!("Form submitted");

        self.inner.validate_all().await;
        self.inner.run_root().await;
        self.inner.republish();
        Ok(self.state())
    }

    /// Reset to `value`: fields missing from it become `null`, and flags,
    /// verdicts, warnings and the root outcome are cleared.
    pub fn reset(&self, value: Value) -> Result<()> {
        self.inner.ensure_open()?;
        let inner = &self.inner;

        let mut paths = inner.tree.paths();
        for path in &paths {
            inner.field_validator.supersede(path);
        }
        inner.root.supersede();

        paths.sort_by_key(FieldPath::depth);
        let mut patch = Value::Object(Default::default());
        for path in &paths {
            let reset_to = get_in(&value, path).cloned().unwrap_or(Value::Null);
            set_in(&mut patch, path, reset_to);
        }

        {
            let mut sync = lock(&inner.sync);
            inner.tree.patch_values(&patch);
            inner.tree.reset_state();
            let leaves = inner.tree.leaf_values();
            let snapshot = Snapshot::new(value).with_values(&leaves);
            inner.publish_snapshot(snapshot.clone());
            *sync = SnapshotSynchronizer::new(leaves, snapshot);
        }

        inner.warnings.clear();
        *lock(&inner.root_outcome) = None;
        inner.root_pending.store(false, Ordering::SeqCst);
        inner.submitted.store(false, Ordering::SeqCst);
        info!(fields = paths.len(), "Form reset");

        inner.schedule_root();
        inner.republish();
        Ok(())
    }

    /// Swap the dependency map wholesale.
    pub fn replace_dependencies(&self, dependencies: DependencyMap) -> Result<()> {
        self.inner.ensure_open()?;
        let dependencies = dependencies.normalised();
        self.inner.scheduler.replace(&dependencies);
        info!(triggers = dependencies.len(), "Dependency map replaced");
        *lock(&self.inner.dependencies) = dependencies;
        Ok(())
    }

    // ── Observation ──

    pub fn subscribe(&self) -> watch::Receiver<Arc<AggregatedState>> {
        self.inner.publisher.subscribe()
    }

    pub fn snapshot_watch(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn state(&self) -> Arc<AggregatedState> {
        self.inner.publisher.current()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    pub fn status(&self) -> FormStatus {
        self.state().status
    }

    pub fn group_status(&self, prefix: impl AsRef<str>) -> Result<FormStatus> {
        let prefix = FieldPath::parse(prefix.as_ref())?;
        Ok(self.inner.tree.group_status(&prefix))
    }

    pub fn dependencies(&self) -> DependencyMap {
        lock(&self.inner.dependencies).clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The underlying control tree, for presentation layers that mount and
    /// edit nodes directly.
    pub fn tree(&self) -> &ControlTree {
        &self.inner.tree
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Abort every background task and pipeline. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for FormEngine {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for FormEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormEngine")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}
