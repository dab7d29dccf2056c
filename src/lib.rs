//! Form synchronisation and validation orchestration.
//!
//! A [`FormEngine`] keeps a mutable [`ControlTree`] and an immutable
//! [`Snapshot`] of the same form data convergent, and runs validation
//! against the snapshot:
//!
//! - per field, debounced and take-latest ([`validator`])
//! - for dependents of a changed field, without feedback loops ([`scheduler`])
//! - across fields under the root key ([`root`])
//!
//! Every result is folded into one [`AggregatedState`] that subscribers
//! receive whenever it changes.
//!
//! ```ignore
//! let engine = FormEngine::builder()
//!     .suite(suite_fn(|snapshot, field| { /* rules */ Ok(SuiteResult::new()) }))
//!     .config(EngineConfig::default().with_dependencies(
//!         DependencyMap::builder().bidirectional("password", "confirmPassword").build()?,
//!     ))
//!     .build();
//! engine.register_field("password")?;
//! engine.set_value("password", json!("hunter2"))?;
//! let mut state = engine.subscribe();
//! ```

pub mod aggregate;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod in_progress;
pub mod outcome;
pub mod path;
pub mod root;
pub mod scheduler;
pub mod snapshot;
pub mod suite;
pub mod sync;
pub mod telemetry;
pub mod validator;

pub use aggregate::AggregatedState;
pub use config::{DependencyMap, EngineConfig};
pub use control::{ControlEvent, ControlNode, ControlTree, FormStatus};
pub use engine::{FormEngine, FormEngineBuilder};
pub use error::{FormSyncError, Result};
pub use outcome::{FieldVerdict, Outcome, INTERNAL_ERROR_MESSAGE, ROOT_KEY};
pub use path::{FieldPath, MAX_INDEX};
pub use root::RootMode;
pub use snapshot::Snapshot;
pub use suite::{async_suite_fn, suite_fn, SuiteResult, ValidationSuite};
pub use validator::ValidationRun;
