//! Snapshot synchronizer.
//!
//! Keeps the mutable control tree and the immutable external snapshot
//! convergent. The tree side is the list of `(path, value)` pairs of its
//! enabled nodes; each side is compared against the last value both sides
//! were known to agree on, and the reconcile step is a pure decision: the
//! engine applies the returned [`SyncAction`]. Nothing here suspends.
//!
//! Publishing writes each tree leaf into the snapshot at its own path, so
//! array elements and keys no node is mounted on are preserved.
//!
//! | tree changed | snapshot changed | action |
//! |---|---|---|
//! | no  | no  | [`SyncAction::Idle`] |
//! | yes | no  | publish snapshot with tree leaves written in (tree wins) |
//! | no  | yes | patch the tree from the snapshot (model wins) |
//! | yes | yes, agreeing | [`SyncAction::Settled`] |
//! | yes | yes, conflicting | tree wins |

use serde_json::Value;
use tracing::debug;

use crate::path::FieldPath;
use crate::snapshot::Snapshot;

/// `(path, value)` per enabled node, parents first.
pub type TreeLeaves = Vec<(FieldPath, Value)>;

#[derive(Clone, Debug, PartialEq)]
pub enum SyncAction {
    Idle,
    /// Publish this snapshot as the new external value.
    Publish(Snapshot),
    /// Patch the tree from this snapshot without emitting value events,
    /// then call [`SnapshotSynchronizer::acknowledge_tree`].
    PatchTree(Snapshot),
    /// Both sides moved to the same values; trackers updated, nothing to do.
    Settled,
}

#[derive(Debug, Clone)]
pub struct SnapshotSynchronizer {
    last_tree: TreeLeaves,
    last_snapshot: Snapshot,
}

impl SnapshotSynchronizer {
    pub fn new(tree: TreeLeaves, snapshot: Snapshot) -> Self {
        Self {
            last_tree: tree,
            last_snapshot: snapshot,
        }
    }

    pub fn last_snapshot(&self) -> &Snapshot {
        &self.last_snapshot
    }

    /// Decide how to bring `tree` and `snapshot` back into agreement.
    pub fn reconcile(&mut self, tree: &[(FieldPath, Value)], snapshot: &Snapshot) -> SyncAction {
        let tree_changed = tree != self.last_tree.as_slice();
        let snapshot_changed =
            !snapshot.ptr_eq(&self.last_snapshot) && snapshot != &self.last_snapshot;

        match (tree_changed, snapshot_changed) {
            (false, false) => SyncAction::Idle,
            (true, false) => {
                let published = snapshot.with_values(tree);
                debug!("Tree changed, publishing snapshot");
                self.last_tree = tree.to_vec();
                self.last_snapshot = published.clone();
                SyncAction::Publish(published)
            }
            (false, true) => {
                debug!("Snapshot replaced, patching tree");
                self.last_snapshot = snapshot.clone();
                SyncAction::PatchTree(snapshot.clone())
            }
            (true, true) => {
                let merged = snapshot.with_values(tree);
                self.last_tree = tree.to_vec();
                if merged == *snapshot {
                    self.last_snapshot = snapshot.clone();
                    SyncAction::Settled
                } else {
                    // Same-tick conflict: the tree reflects direct interaction
                    debug!("Tree and snapshot diverged in one tick, tree wins");
                    self.last_snapshot = merged.clone();
                    SyncAction::Publish(merged)
                }
            }
        }
    }

    /// Record the tree's value after a [`SyncAction::PatchTree`] was applied.
    pub fn acknowledge_tree(&mut self, tree: TreeLeaves) {
        self.last_tree = tree;
    }
}
