//! Dependency revalidation scheduler.
//!
//! For every trigger in the [`DependencyMap`] one task watches the trigger's
//! value changes and forces its dependents to revalidate:
//!
//! 1. wait for a change of the trigger (the node may mount later; only its
//!    own events count)
//! 2. debounce, then skip if the trigger is itself in the in-progress set
//! 3. wait (bounded) for the form to leave `PENDING`
//! 4. wait (bounded) for the dependents to mount; missing ones are logged
//!    and skipped
//! 5. mark trigger and dependents in-progress, revalidate every dependent
//!    with `emit = true`
//! 6. the marks expire on their own after the configured TTL
//!
//! Step 2 is what breaks `A → B → A`: B's forced revalidation re-announces
//! B, but B is still marked, so B's trigger stays quiet.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::config::DependencyMap;
use crate::control::{ControlEvent, ControlTree, FormStatus};
use crate::in_progress::{deadline_after, InProgressSet};
use crate::path::FieldPath;

/// Forced revalidation of one field, provided by the engine.
#[async_trait]
pub trait Revalidate: Send + Sync {
    /// Re-run `path`'s validator against its current value. With `emit`,
    /// re-announce the value so downstream listeners observe the result.
    /// Returns `false` when no node is registered at `path`.
    async fn revalidate(&self, path: &FieldPath, emit: bool) -> bool;
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerSettings {
    pub debounce: Duration,
    pub idle_timeout: Duration,
    pub in_progress_ttl: Duration,
}

#[derive(Clone)]
struct TriggerContext {
    settings: SchedulerSettings,
    tree: Arc<ControlTree>,
    in_progress: Arc<InProgressSet>,
    revalidator: Weak<dyn Revalidate>,
}

pub struct DependencyScheduler {
    ctx: TriggerContext,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DependencyScheduler {
    pub fn new(
        settings: SchedulerSettings,
        tree: Arc<ControlTree>,
        in_progress: Arc<InProgressSet>,
        revalidator: Weak<dyn Revalidate>,
    ) -> Self {
        Self {
            ctx: TriggerContext {
                settings,
                tree,
                in_progress,
                revalidator,
            },
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one watcher per trigger in `map`. Must run inside a tokio runtime.
    pub fn start(&self, map: &DependencyMap) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for (trigger, dependents) in map.iter() {
            // Subscribe before spawning so no change between now and the
            // task's first poll is missed
            let events = self.ctx.tree.subscribe_values();
            let ctx = self.ctx.clone();
            let trigger = trigger.clone();
            let dependents = dependents.to_vec();
            handles.push(tokio::spawn(watch_trigger(ctx, events, trigger, dependents)));
        }
        if !map.is_empty() {
            info!(triggers = map.len(), "Dependency scheduler started");
        }
    }

    /// Swap the dependency map wholesale.
    pub fn replace(&self, map: &DependencyMap) {
        self.stop();
        self.start(map);
    }

    pub fn stop(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    pub fn trigger_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }
}

impl Drop for DependencyScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DependencyScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyScheduler")
            .field("settings", &self.ctx.settings)
            .field("triggers", &self.trigger_count())
            .finish()
    }
}

/// Wait for the next value change of `trigger`. `false` once the tree is gone.
async fn next_change(events: &mut broadcast::Receiver<ControlEvent>, trigger: &FieldPath) -> bool {
    loop {
        match events.recv().await {
            Ok(ControlEvent::ValueChanged { path, .. }) if &path == trigger => return true,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                // Cannot tell whether the trigger was among the lost events
                warn!(field = %trigger, skipped, "Dependency trigger lagged behind");
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

async fn watch_trigger(
    ctx: TriggerContext,
    mut events: broadcast::Receiver<ControlEvent>,
    trigger: FieldPath,
    dependents: Vec<FieldPath>,
) {
    debug!(field = %trigger, dependents = dependents.len(), "Watching dependency trigger");

    loop {
        if !next_change(&mut events, &trigger).await {
            break;
        }

        if !ctx.settings.debounce.is_zero() {
            let mut deadline = deadline_after(ctx.settings.debounce);
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    more = next_change(&mut events, &trigger) => {
                        if !more {
                            return;
                        }
                        deadline = deadline_after(ctx.settings.debounce);
                    }
                }
            }
        }

        if ctx.in_progress.contains(&trigger) {
            debug!(field = %trigger, "Trigger is being revalidated, not re-arming");
            continue;
        }

        wait_for_idle(&ctx, &trigger).await;

        let present = wait_for_nodes(&ctx, &trigger, &dependents).await;
        if present.is_empty() {
            continue;
        }

        ctx.in_progress.mark(
            std::iter::once(&trigger).chain(present.iter()),
            ctx.settings.in_progress_ttl,
        );

        let Some(revalidator) = ctx.revalidator.upgrade() else {
            break;
        };
        debug!(field = %trigger, dependents = present.len(), "Forcing dependent revalidation");
        join_all(present.iter().map(|dependent| revalidator.revalidate(dependent, true))).await;
    }

    debug!(field = %trigger, "Dependency trigger watcher stopped");
}

async fn wait_for_idle(ctx: &TriggerContext, trigger: &FieldPath) {
    let mut status = ctx.tree.status_watch();
    let settled = timeout(
        ctx.settings.idle_timeout,
        status.wait_for(|s| *s != FormStatus::Pending),
    )
    .await
    .is_ok();
    if !settled {
        warn!(
            field = %trigger,
            timeout_ms = ctx.settings.idle_timeout.as_millis() as u64,
            "Form still pending, revalidating dependents anyway"
        );
    }
}

/// Wait (bounded) for `dependents` to mount; returns the ones that did.
async fn wait_for_nodes(
    ctx: &TriggerContext,
    trigger: &FieldPath,
    dependents: &[FieldPath],
) -> Vec<FieldPath> {
    let mut added = ctx.tree.subscribe_values();
    let deadline = deadline_after(ctx.settings.idle_timeout);

    loop {
        let missing: Vec<&FieldPath> = dependents
            .iter()
            .filter(|d| !ctx.tree.contains(d))
            .collect();
        if missing.is_empty() {
            return dependents.to_vec();
        }

        let arrived = tokio::select! {
            _ = sleep_until(deadline) => false,
            event = added.recv() => !matches!(event, Err(RecvError::Closed)),
        };
        if !arrived {
            for dependent in missing {
                warn!(
                    trigger = %trigger,
                    dependent = %dependent,
                    "Dependent field has no control, skipping"
                );
            }
            return dependents
                .iter()
                .filter(|d| ctx.tree.contains(d))
                .cloned()
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FieldVerdict;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    /// Records calls and re-announces like the engine does.
    struct Recorder {
        tree: Arc<ControlTree>,
        calls: StdMutex<Vec<FieldPath>>,
    }

    #[async_trait]
    impl Revalidate for Recorder {
        async fn revalidate(&self, path: &FieldPath, emit: bool) -> bool {
            if !self.tree.contains(path) {
                return false;
            }
            self.calls.lock().unwrap().push(path.clone());
            if emit {
                self.tree.emit_revalidated(path);
            }
            true
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            debounce: Duration::ZERO,
            idle_timeout: Duration::from_secs(2),
            in_progress_ttl: Duration::from_millis(500),
        }
    }

    fn setup(map: &DependencyMap) -> (Arc<ControlTree>, Arc<Recorder>, DependencyScheduler) {
        setup_with_buffer(map, 64)
    }

    fn setup_with_buffer(
        map: &DependencyMap,
        event_buffer: usize,
    ) -> (Arc<ControlTree>, Arc<Recorder>, DependencyScheduler) {
        let tree = Arc::new(ControlTree::new(event_buffer));
        let recorder = Arc::new(Recorder {
            tree: tree.clone(),
            calls: StdMutex::new(Vec::new()),
        });
        let weak: Weak<dyn Revalidate> = {
            let as_dyn: Arc<dyn Revalidate> = recorder.clone();
            Arc::downgrade(&as_dyn)
        };
        let scheduler = DependencyScheduler::new(
            settings(),
            tree.clone(),
            Arc::new(InProgressSet::new()),
            weak,
        );
        scheduler.start(map);
        (tree, recorder, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_revalidates_dependent() {
        let map = DependencyMap::builder().when("a").revalidate(["b"]).build().unwrap();
        let (tree, recorder, _scheduler) = setup(&map);
        tree.register(p("a"), json!(1));
        tree.register(p("b"), json!(2));

        tree.set_value(&p("a"), json!(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*recorder.calls.lock().unwrap(), vec![p("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_churn_does_not_fire_triggers() {
        let map = DependencyMap::builder().when("a").revalidate(["b"]).build().unwrap();
        let (tree, recorder, _scheduler) = setup_with_buffer(&map, 4);
        tree.register(p("a"), json!(1));
        tree.register(p("b"), json!(2));

        // Far more status events than the buffer holds, and no value change
        for round in 0..20 {
            tree.set_pending(&p("b"));
            let verdict = if round % 2 == 0 {
                FieldVerdict::Valid
            } else {
                FieldVerdict::Invalid {
                    errors: vec!["Required".into()],
                }
            };
            tree.apply_verdict(&p("b"), verdict);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bidirectional_dependency_converges() {
        let map = DependencyMap::builder()
            .bidirectional("a", "b")
            .build()
            .unwrap();
        let (tree, recorder, _scheduler) = setup(&map);
        tree.register(p("a"), json!(1));
        tree.register(p("b"), json!(2));

        tree.set_value(&p("a"), json!(3)).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        // B was forced once; its re-announcement did not bounce back to A
        assert_eq!(*recorder.calls.lock().unwrap(), vec![p("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearms_after_ttl() {
        let map = DependencyMap::builder()
            .bidirectional("a", "b")
            .build()
            .unwrap();
        let (tree, recorder, _scheduler) = setup(&map);
        tree.register(p("a"), json!(1));
        tree.register(p("b"), json!(2));

        tree.set_value(&p("a"), json!(3)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tree.set_value(&p("b"), json!(4)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*recorder.calls.lock().unwrap(), vec![p("b"), p("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_dependent_is_skipped() {
        let map = DependencyMap::builder()
            .when("a")
            .revalidate(["ghost", "b"])
            .build()
            .unwrap();
        let (tree, recorder, _scheduler) = setup(&map);
        tree.register(p("a"), json!(1));
        tree.register(p("b"), json!(2));

        tree.set_value(&p("a"), json!(3)).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*recorder.calls.lock().unwrap(), vec![p("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_late_dependent() {
        let map = DependencyMap::builder().when("a").revalidate(["b"]).build().unwrap();
        let (tree, recorder, _scheduler) = setup(&map);
        tree.register(p("a"), json!(1));

        tree.set_value(&p("a"), json!(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(recorder.calls.lock().unwrap().is_empty());

        tree.register(p("b"), json!(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*recorder.calls.lock().unwrap(), vec![p("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_idle_form() {
        let map = DependencyMap::builder().when("a").revalidate(["b"]).build().unwrap();
        let (tree, recorder, _scheduler) = setup(&map);
        tree.register(p("a"), json!(1));
        tree.register(p("b"), json!(2));
        tree.set_pending(&p("a"));

        tree.set_value(&p("a"), json!(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(recorder.calls.lock().unwrap().is_empty());

        tree.apply_verdict(&p("a"), crate::outcome::FieldVerdict::Valid);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*recorder.calls.lock().unwrap(), vec![p("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_wait_is_bounded() {
        let map = DependencyMap::builder().when("a").revalidate(["b"]).build().unwrap();
        let (tree, recorder, _scheduler) = setup(&map);
        tree.register(p("a"), json!(1));
        tree.register(p("b"), json!(2));
        tree.register(p("stuck"), json!(null));
        tree.set_pending(&p("stuck"));

        tree.set_value(&p("a"), json!(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(recorder.calls.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*recorder.calls.lock().unwrap(), vec![p("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_watchers() {
        let map = DependencyMap::builder().when("a").revalidate(["b"]).build().unwrap();
        let (tree, recorder, scheduler) = setup(&map);
        tree.register(p("a"), json!(1));
        tree.register(p("b"), json!(2));
        assert_eq!(scheduler.trigger_count(), 1);

        scheduler.stop();
        tree.set_value(&p("a"), json!(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(recorder.calls.lock().unwrap().is_empty());
        assert_eq!(scheduler.trigger_count(), 0);
    }
}
