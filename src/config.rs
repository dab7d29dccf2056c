//! Engine configuration.
//!
//! All durations are milliseconds and default to the values below. A
//! configuration file may be YAML or JSON:
//!
//! ```yaml
//! field_debounce_ms: 150
//! root_mode: live
//! dependencies:
//!   password: [confirmPassword]
//!   confirmPassword: [password]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{FormSyncError, Result};
use crate::path::FieldPath;
use crate::root::RootMode;

/// Trigger field → fields to revalidate when it changes.
///
/// Read-only for an engine's lifetime; replace it wholesale with
/// `FormEngine::replace_dependencies`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyMap(BTreeMap<FieldPath, Vec<FieldPath>>);

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> DependencyMapBuilder {
        DependencyMapBuilder::default()
    }

    pub fn dependents_of(&self, trigger: &FieldPath) -> &[FieldPath] {
        self.0.get(trigger).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &[FieldPath])> {
        self.0.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop self-references and duplicate dependents.
    pub(crate) fn normalised(self) -> Self {
        let mut out = BTreeMap::new();
        for (trigger, dependents) in self.0 {
            let mut kept: Vec<FieldPath> = Vec::new();
            for dependent in dependents {
                if dependent == trigger {
                    debug!(field = %trigger, "Ignoring self-dependency");
                    continue;
                }
                if !kept.contains(&dependent) {
                    kept.push(dependent);
                }
            }
            if !kept.is_empty() {
                out.insert(trigger, kept);
            }
        }
        Self(out)
    }
}

/// Fluent construction of a [`DependencyMap`].
///
/// ```ignore
/// let deps = DependencyMap::builder()
///     .when("country").revalidate(["postcode"])
///     .bidirectional("password", "confirmPassword")
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct DependencyMapBuilder {
    entries: BTreeMap<FieldPath, Vec<FieldPath>>,
    error: Option<FormSyncError>,
}

/// Pending `when(trigger)` clause.
#[derive(Debug)]
pub struct WhenClause {
    builder: DependencyMapBuilder,
    trigger: Option<FieldPath>,
}

impl DependencyMapBuilder {
    fn parse(&mut self, raw: &str) -> Option<FieldPath> {
        match FieldPath::parse(raw) {
            Ok(path) => Some(path),
            Err(e) => {
                self.error.get_or_insert(e);
                None
            }
        }
    }

    fn add(&mut self, trigger: FieldPath, dependent: FieldPath) {
        self.entries.entry(trigger).or_default().push(dependent);
    }

    pub fn when(mut self, trigger: &str) -> WhenClause {
        let trigger = self.parse(trigger);
        WhenClause {
            builder: self,
            trigger,
        }
    }

    /// Each of `a` and `b` revalidates the other.
    pub fn bidirectional(mut self, a: &str, b: &str) -> Self {
        if let (Some(a), Some(b)) = (self.parse(a), self.parse(b)) {
            self.add(a.clone(), b.clone());
            self.add(b, a);
        }
        self
    }

    /// Fails on the first unparseable path.
    pub fn build(self) -> Result<DependencyMap> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(DependencyMap(self.entries).normalised()),
        }
    }
}

impl WhenClause {
    pub fn revalidate<'a>(mut self, dependents: impl IntoIterator<Item = &'a str>) -> DependencyMapBuilder {
        for raw in dependents {
            if let (Some(trigger), Some(dependent)) = (self.trigger.clone(), self.builder.parse(raw)) {
                self.builder.add(trigger, dependent);
            }
        }
        self.builder
    }
}

/// Tunables for a `FormEngine`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Debounce before a field's suite evaluation.
    pub field_debounce_ms: u64,
    /// Debounce before root evaluation.
    pub root_debounce_ms: u64,
    /// Debounce on dependency trigger changes.
    pub dependency_debounce_ms: u64,
    /// Upper bound on waiting for the form to leave `PENDING` (and for
    /// dependents to mount) before forcing revalidation anyway.
    pub idle_timeout_ms: u64,
    /// How long a forced revalidation keeps its paths in the in-progress set.
    pub in_progress_ttl_ms: u64,
    pub root_mode: RootMode,
    pub dependencies: DependencyMap,
    /// Per-subscriber backlog of control-tree events.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            field_debounce_ms: 0,
            root_debounce_ms: 0,
            dependency_debounce_ms: 0,
            idle_timeout_ms: 2000,
            in_progress_ttl_ms: 500,
            root_mode: RootMode::Submit,
            dependencies: DependencyMap::default(),
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        Ok(config.normalised())
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(content)?;
        Ok(config.normalised())
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| FormSyncError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(FormSyncError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    fn normalised(mut self) -> Self {
        self.dependencies = std::mem::take(&mut self.dependencies).normalised();
        self
    }

    pub fn with_field_debounce(mut self, debounce: Duration) -> Self {
        self.field_debounce_ms = millis(debounce);
        self
    }

    pub fn with_root_debounce(mut self, debounce: Duration) -> Self {
        self.root_debounce_ms = millis(debounce);
        self
    }

    pub fn with_dependency_debounce(mut self, debounce: Duration) -> Self {
        self.dependency_debounce_ms = millis(debounce);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = millis(timeout);
        self
    }

    pub fn with_in_progress_ttl(mut self, ttl: Duration) -> Self {
        self.in_progress_ttl_ms = millis(ttl);
        self
    }

    pub fn with_root_mode(mut self, mode: RootMode) -> Self {
        self.root_mode = mode;
        self
    }

    pub fn with_dependencies(mut self, dependencies: DependencyMap) -> Self {
        self.dependencies = dependencies.normalised();
        self
    }

    pub fn field_debounce(&self) -> Duration {
        Duration::from_millis(self.field_debounce_ms)
    }

    pub fn root_debounce(&self) -> Duration {
        Duration::from_millis(self.root_debounce_ms)
    }

    pub fn dependency_debounce(&self) -> Duration {
        Duration::from_millis(self.dependency_debounce_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn in_progress_ttl(&self) -> Duration {
        Duration::from_millis(self.in_progress_ttl_ms)
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
