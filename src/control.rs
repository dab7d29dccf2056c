//! Control tree.
//!
//! An arena of mutable [`ControlNode`]s keyed by [`FieldPath`], with explicit
//! change notification. Nodes come and go as the presentation layer mounts
//! and unmounts fields, so every lookup here is fallible and every consumer
//! must tolerate a path disappearing between two calls.
//!
//! Two channels leave the tree:
//!
//! - a `broadcast` of [`ControlEvent`]s (value, status and lifecycle changes)
//! - a `watch` of the aggregate [`FormStatus`], for "wait until idle" callers
//!
//! Programmatic patches ([`ControlTree::patch_values`]) deliberately emit no
//! value events so that model→tree synchronisation cannot echo back into the
//! tree→model path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};

use crate::error::FormSyncError;
use crate::outcome::FieldVerdict;
use crate::path::{get_in, set_in, FieldPath};

/// Status of a node, a group or the whole form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FormStatus {
    Valid,
    Invalid,
    Pending,
    Disabled,
}

/// Who caused a value change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A user or programmatic edit through [`ControlTree::set_value`].
    User,
    /// A forced revalidation re-announcing the current value.
    Revalidation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlEvent {
    NodeAdded(FieldPath),
    NodeRemoved(FieldPath),
    ValueChanged {
        path: FieldPath,
        origin: ChangeOrigin,
    },
    StatusChanged(FieldPath),
}

/// Live state of one field.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlNode {
    pub value: Value,
    pub verdict: FieldVerdict,
    pub pending: bool,
    pub disabled: bool,
    pub touched: bool,
    pub dirty: bool,
}

impl ControlNode {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            verdict: FieldVerdict::Valid,
            pending: false,
            disabled: false,
            touched: false,
            dirty: false,
        }
    }

    pub fn status(&self) -> FormStatus {
        if self.disabled {
            FormStatus::Disabled
        } else if self.pending {
            FormStatus::Pending
        } else if !self.verdict.is_valid() {
            FormStatus::Invalid
        } else {
            FormStatus::Valid
        }
    }
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<FieldPath, ControlNode>,
    /// Registration order; drives `firstInvalidField`.
    order: Vec<FieldPath>,
}

impl TreeState {
    fn status_of<'a>(nodes: impl Iterator<Item = &'a ControlNode>) -> FormStatus {
        let mut any = false;
        let mut any_enabled = false;
        let mut pending = false;
        let mut invalid = false;
        for node in nodes {
            any = true;
            match node.status() {
                FormStatus::Disabled => continue,
                FormStatus::Pending => pending = true,
                FormStatus::Invalid => invalid = true,
                FormStatus::Valid => {}
            }
            any_enabled = true;
        }
        if any && !any_enabled {
            FormStatus::Disabled
        } else if pending {
            FormStatus::Pending
        } else if invalid {
            FormStatus::Invalid
        } else {
            FormStatus::Valid
        }
    }

    fn form_status(&self) -> FormStatus {
        Self::status_of(self.nodes.values())
    }

    /// `(path, value)` per node, parents first so a nested node's value
    /// survives a group-level value written over the same subtree.
    fn leaves(&self, include_disabled: bool) -> Vec<(FieldPath, Value)> {
        let mut paths: Vec<&FieldPath> = self.order.iter().collect();
        paths.sort_by_key(|p| p.depth());
        paths
            .into_iter()
            .filter_map(|path| {
                let node = self.nodes.get(path)?;
                (include_disabled || !node.disabled).then(|| (path.clone(), node.value.clone()))
            })
            .collect()
    }

    fn merged(&self, include_disabled: bool) -> Value {
        let mut value = Value::Object(Default::default());
        for (path, leaf) in self.leaves(include_disabled) {
            set_in(&mut value, &path, leaf);
        }
        value
    }
}

/// Arena of control nodes with publish/subscribe change notification.
pub struct ControlTree {
    state: Mutex<TreeState>,
    events: broadcast::Sender<ControlEvent>,
    // Value and lifecycle events only; status churn never lands here
    values: broadcast::Sender<ControlEvent>,
    status: watch::Sender<FormStatus>,
}

impl ControlTree {
    /// Create an empty tree; `event_buffer` bounds each subscriber's backlog.
    pub fn new(event_buffer: usize) -> Self {
        let (events, _rx) = broadcast::channel(event_buffer.max(1));
        let (values, _rx) = broadcast::channel(event_buffer.max(1));
        let (status, _rx) = watch::channel(FormStatus::Valid);
        Self {
            state: Mutex::new(TreeState::default()),
            events,
            values,
            status,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ControlEvent) {
        // No subscribers is fine
        if !matches!(event, ControlEvent::StatusChanged(_)) {
            let _ = self.values.send(event.clone());
        }
        let _ = self.events.send(event);
    }

    fn refresh_status(&self, state: &TreeState) {
        let next = state.form_status();
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Every event, status changes included.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Value changes and node additions/removals only.
    pub fn subscribe_values(&self) -> broadcast::Receiver<ControlEvent> {
        self.values.subscribe()
    }

    pub fn status_watch(&self) -> watch::Receiver<FormStatus> {
        self.status.subscribe()
    }

    // ── Lifecycle ──

    /// Mount a node. Returns `false` (and leaves the node alone) if one is
    /// already registered at `path`.
    pub fn register(&self, path: FieldPath, value: Value) -> bool {
        {
            let mut state = self.lock();
            if state.nodes.contains_key(&path) {
                return false;
            }
            state.nodes.insert(path.clone(), ControlNode::new(value));
            state.order.push(path.clone());
            self.refresh_status(&state);
        }
        self.emit(ControlEvent::NodeAdded(path));
        true
    }

    pub fn remove(&self, path: &FieldPath) -> Option<ControlNode> {
        let removed = {
            let mut state = self.lock();
            let removed = state.nodes.remove(path)?;
            state.order.retain(|p| p != path);
            self.refresh_status(&state);
            removed
        };
        self.emit(ControlEvent::NodeRemoved(path.clone()));
        Some(removed)
    }

    pub fn contains(&self, path: &FieldPath) -> bool {
        self.lock().nodes.contains_key(path)
    }

    pub fn node(&self, path: &FieldPath) -> Option<ControlNode> {
        self.lock().nodes.get(path).cloned()
    }

    /// All registered paths in registration order.
    pub fn paths(&self) -> Vec<FieldPath> {
        self.lock().order.clone()
    }

    /// Registered paths at or below `prefix`, in registration order.
    pub fn paths_within(&self, prefix: &FieldPath) -> Vec<FieldPath> {
        self.lock()
            .order
            .iter()
            .filter(|p| p.is_within(prefix))
            .cloned()
            .collect()
    }

    /// Every node in registration order.
    pub fn nodes(&self) -> Vec<(FieldPath, ControlNode)> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|p| state.nodes.get(p).map(|n| (p.clone(), n.clone())))
            .collect()
    }

    // ── Values ──

    /// User edit: store the value, mark dirty, announce the change.
    pub fn set_value(&self, path: &FieldPath, value: Value) -> Result<(), FormSyncError> {
        {
            let mut state = self.lock();
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| FormSyncError::UnknownField(path.to_string()))?;
            node.value = value;
            node.dirty = true;
        }
        self.emit(ControlEvent::ValueChanged {
            path: path.clone(),
            origin: ChangeOrigin::User,
        });
        Ok(())
    }

    /// Copy values from `source` onto matching nodes without announcing
    /// value changes. Returns the paths whose value actually changed.
    pub fn patch_values(&self, source: &Value) -> Vec<FieldPath> {
        let mut state = self.lock();
        let order = state.order.clone();
        let mut changed = Vec::new();
        for path in order {
            let Some(incoming) = get_in(source, &path) else {
                continue;
            };
            if let Some(node) = state.nodes.get_mut(&path) {
                if node.value != *incoming {
                    node.value = incoming.clone();
                    changed.push(path);
                }
            }
        }
        changed
    }

    /// Re-announce `path`'s current value as a revalidation-driven change.
    pub fn emit_revalidated(&self, path: &FieldPath) {
        if self.contains(path) {
            self.emit(ControlEvent::ValueChanged {
                path: path.clone(),
                origin: ChangeOrigin::Revalidation,
            });
        }
    }

    /// Merged value of all enabled nodes.
    pub fn value(&self) -> Value {
        self.lock().merged(false)
    }

    /// Merged value of all nodes, disabled ones included.
    pub fn raw_value(&self) -> Value {
        self.lock().merged(true)
    }

    /// Each enabled node's own `(path, value)`, parents before children.
    pub fn leaf_values(&self) -> Vec<(FieldPath, Value)> {
        self.lock().leaves(false)
    }

    // ── Validation state ──

    pub fn set_pending(&self, path: &FieldPath) -> bool {
        self.update_status(path, |node| {
            node.pending = true;
        })
    }

    /// Store a verdict and clear `pending`.
    pub fn apply_verdict(&self, path: &FieldPath, verdict: FieldVerdict) -> bool {
        self.update_status(path, move |node| {
            node.pending = false;
            node.verdict = if node.disabled {
                FieldVerdict::Valid
            } else {
                verdict
            };
        })
    }

    /// Disabled nodes carry no errors and drop out of [`value`](Self::value).
    pub fn set_disabled(&self, path: &FieldPath, disabled: bool) -> bool {
        self.update_status(path, |node| {
            node.disabled = disabled;
            if disabled {
                node.verdict = FieldVerdict::Valid;
                node.pending = false;
            }
        })
    }

    fn update_status(&self, path: &FieldPath, f: impl FnOnce(&mut ControlNode)) -> bool {
        let changed = {
            let mut state = self.lock();
            let Some(node) = state.nodes.get_mut(path) else {
                return false;
            };
            let before = node.clone();
            f(node);
            let changed = *node != before;
            self.refresh_status(&state);
            changed
        };
        if changed {
            self.emit(ControlEvent::StatusChanged(path.clone()));
        }
        true
    }

    // ── Interaction flags ──

    pub fn mark_touched(&self, path: &FieldPath) -> bool {
        self.update_status(path, |node| node.touched = true)
    }

    pub fn mark_all_touched(&self) {
        for path in self.paths() {
            self.mark_touched(&path);
        }
    }

    /// Clear dirty/touched flags, verdicts and pending markers.
    pub fn reset_state(&self) {
        let paths = {
            let mut state = self.lock();
            for node in state.nodes.values_mut() {
                node.dirty = false;
                node.touched = false;
                node.pending = false;
                node.verdict = FieldVerdict::Valid;
            }
            self.refresh_status(&state);
            state.order.clone()
        };
        for path in paths {
            self.emit(ControlEvent::StatusChanged(path));
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().nodes.values().any(|n| n.dirty)
    }

    pub fn is_touched(&self) -> bool {
        self.lock().nodes.values().any(|n| n.touched)
    }

    // ── Status ──

    pub fn status(&self) -> FormStatus {
        self.lock().form_status()
    }

    /// Aggregate status of the nodes at or below `prefix`.
    pub fn group_status(&self, prefix: &FieldPath) -> FormStatus {
        let state = self.lock();
        TreeState::status_of(
            state
                .nodes
                .iter()
                .filter(|(p, _)| p.is_within(prefix))
                .map(|(_, n)| n),
        )
    }
}

impl std::fmt::Debug for ControlTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ControlTree")
            .field("nodes", &state.order)
            .finish()
    }
}
