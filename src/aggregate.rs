//! Error/warning aggregation.
//!
//! [`aggregate`] is a pure function of the tree's nodes, the warning side
//! channel and the root outcome. [`StatePublisher`] pushes its result to
//! subscribers, skipping states that are deeply equal to the last one.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::control::{ControlNode, FormStatus};
use crate::outcome::{root_path, Outcome};
use crate::path::FieldPath;

/// Everything a presentation layer needs to render the form's validity.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedState {
    pub value: Value,
    pub errors: BTreeMap<FieldPath, Vec<String>>,
    pub warnings: BTreeMap<FieldPath, Vec<String>>,
    pub root: Option<Outcome>,
    pub status: FormStatus,
    pub dirty: bool,
    pub touched: bool,
    pub valid: bool,
    pub pending: bool,
    pub submitted: bool,
    pub error_count: usize,
    pub warning_count: usize,
    pub first_invalid_field: Option<FieldPath>,
}

impl Default for AggregatedState {
    fn default() -> Self {
        Self {
            value: Value::Object(Default::default()),
            errors: BTreeMap::new(),
            warnings: BTreeMap::new(),
            root: None,
            status: FormStatus::Valid,
            dirty: false,
            touched: false,
            valid: true,
            pending: false,
            submitted: false,
            error_count: 0,
            warning_count: 0,
            first_invalid_field: None,
        }
    }
}

impl AggregatedState {
    pub fn errors_for(&self, path: &FieldPath) -> &[String] {
        self.errors.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn warnings_for(&self, path: &FieldPath) -> &[String] {
        self.warnings.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn root_errors(&self) -> &[String] {
        self.root.as_ref().map(|r| r.errors.as_slice()).unwrap_or(&[])
    }
}

/// Inputs to one recomputation.
#[derive(Debug)]
pub struct AggregateInput<'a> {
    /// Merged value of the enabled nodes.
    pub value: Value,
    /// Nodes in registration order.
    pub nodes: &'a [(FieldPath, ControlNode)],
    pub warnings: &'a BTreeMap<FieldPath, Vec<String>>,
    pub root: Option<&'a Outcome>,
    pub root_pending: bool,
    pub submitted: bool,
}

pub fn aggregate(input: AggregateInput<'_>) -> AggregatedState {
    let mut errors = BTreeMap::new();
    let mut warnings = BTreeMap::new();
    let mut first_invalid_field = None;
    let mut any_enabled = false;
    let mut tree_pending = false;
    let (mut dirty, mut touched) = (false, false);

    for (path, node) in input.nodes {
        dirty |= node.dirty;
        touched |= node.touched;
        if node.disabled {
            continue;
        }
        any_enabled = true;
        tree_pending |= node.pending;

        let messages = node.verdict.display_errors();
        if !messages.is_empty() {
            first_invalid_field.get_or_insert_with(|| path.clone());
            errors.insert(path.clone(), messages);
        }
        if let Some(advisory) = input.warnings.get(path).filter(|w| !w.is_empty()) {
            warnings.insert(path.clone(), advisory.clone());
        }
    }

    let root = input.root.filter(|r| !r.is_empty()).cloned();
    let root_errors = root.as_ref().map_or(0, |r| r.errors.len());
    let root_warnings = root.as_ref().map_or(0, |r| r.warnings.len());

    let error_count = root_errors + errors.values().map(Vec::len).sum::<usize>();
    let warning_count = root_warnings + warnings.values().map(Vec::len).sum::<usize>();

    if first_invalid_field.is_none() && root_errors > 0 {
        first_invalid_field = Some(root_path());
    }

    let status = if !input.nodes.is_empty() && !any_enabled {
        FormStatus::Disabled
    } else if tree_pending || input.root_pending {
        FormStatus::Pending
    } else if error_count > 0 {
        FormStatus::Invalid
    } else {
        FormStatus::Valid
    };

    AggregatedState {
        value: input.value,
        errors,
        warnings,
        root,
        status,
        dirty,
        touched,
        valid: error_count == 0,
        pending: status == FormStatus::Pending,
        submitted: input.submitted,
        error_count,
        warning_count,
        first_invalid_field,
    }
}

/// Push-based publication of [`AggregatedState`].
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<Arc<AggregatedState>>,
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatePublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(AggregatedState::default()));
        Self { tx }
    }

    /// Publish `state` unless it equals the current one. Returns whether
    /// subscribers were notified.
    pub fn publish(&self, state: AggregatedState) -> bool {
        self.tx.send_if_modified(|current| {
            if **current == state {
                false
            } else {
                *current = Arc::new(state);
                true
            }
        })
    }

    pub fn current(&self) -> Arc<AggregatedState> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AggregatedState>> {
        self.tx.subscribe()
    }
}
