//! In-progress set for dependency-forced revalidation.
//!
//! Paths are marked while a scheduler-forced revalidation involving them is
//! underway. A trigger whose path is marked does not fire, which is what
//! stops `A → B → A` from looping. Every mark carries a deadline; once it
//! passes the path counts as absent again even if nobody removed it, so a
//! stalled evaluation can never wedge a field out of future triggering.
//!
//! Entries are only ever added or expired. [`InProgressSet::clear`] is for
//! engine teardown.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::path::FieldPath;

// Roughly 30 years; stands in for "never" when a configured duration
// would overflow the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, saturating to a far-future instant instead of panicking.
pub(crate) fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug, Default)]
pub struct InProgressSet {
    entries: Mutex<HashMap<FieldPath, Instant>>,
}

impl InProgressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every path in `paths` for `ttl` from now.
    ///
    /// Re-marking a path extends its deadline, never shortens it.
    pub fn mark<'a>(&self, paths: impl IntoIterator<Item = &'a FieldPath>, ttl: Duration) {
        let deadline = deadline_after(ttl);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for path in paths {
            entries
                .entry(path.clone())
                .and_modify(|d| *d = (*d).max(deadline))
                .or_insert(deadline);
        }
    }

    pub fn contains(&self, path: &FieldPath) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(path) {
            Some(deadline) if *deadline > now => true,
            Some(_) => {
                entries.remove(path);
                false
            }
            None => false,
        }
    }

    /// Drop expired entries; returns how many remain live.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, deadline| *deadline > now);
        entries.len()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let set = InProgressSet::new();
        set.mark([&p("a"), &p("b")], Duration::from_millis(500));
        assert!(set.contains(&p("a")));
        assert!(!set.contains(&p("c")));

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(set.contains(&p("b")));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!set.contains(&p("a")));
        assert_eq!(set.prune(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remark_extends_deadline() {
        let set = InProgressSet::new();
        set.mark([&p("a")], Duration::from_millis(500));
        tokio::time::advance(Duration::from_millis(300)).await;
        set.mark([&p("a")], Duration::from_millis(500));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(set.contains(&p("a")));

        // A shorter mark does not cut an existing one short
        set.mark([&p("a")], Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(set.contains(&p("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_saturates() {
        let set = InProgressSet::new();
        set.mark([&p("a")], Duration::MAX);
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(set.contains(&p("a")));
    }

    #[tokio::test]
    async fn test_clear() {
        let set = InProgressSet::new();
        set.mark([&p("a")], Duration::from_secs(10));
        set.clear();
        assert!(!set.contains(&p("a")));
    }
}
