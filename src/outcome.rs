//! Validation outcomes.

use serde::{Deserialize, Serialize};

use crate::path::{FieldPath, PathSegment};

/// Reserved key under which cross-field (root) results are stored.
pub const ROOT_KEY: &str = "rootForm";

/// Message shown in place of a field's normal messages when its suite faulted.
pub const INTERNAL_ERROR_MESSAGE: &str = "Validation failed";

/// The [`ROOT_KEY`] as a path.
pub fn root_path() -> FieldPath {
    FieldPath::from_segments(vec![PathSegment::Key(ROOT_KEY.to_string())])
}

/// Errors and warnings produced by evaluating one field or the root.
///
/// Warnings are advisory: an outcome with only warnings never makes
/// anything invalid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Outcome {
    pub fn new(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { errors, warnings }
    }

    pub fn errors<I, S>(errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            errors: errors.into_iter().map(Into::into).collect(),
            warnings: Vec::new(),
        }
    }

    pub fn warnings<I, S>(warnings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            errors: Vec::new(),
            warnings: warnings.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Validity-level result of one field evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldVerdict {
    /// No errors. Warnings, if any, travel in the warning side channel.
    Valid,
    /// At least one rule failed.
    Invalid { errors: Vec<String> },
    /// The suite itself failed. `message` is diagnostic detail; users see
    /// [`INTERNAL_ERROR_MESSAGE`].
    InternalError { message: String },
}

impl FieldVerdict {
    pub fn from_outcome(outcome: &Outcome) -> Self {
        if outcome.has_errors() {
            FieldVerdict::Invalid {
                errors: outcome.errors.clone(),
            }
        } else {
            FieldVerdict::Valid
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, FieldVerdict::Valid)
    }

    /// Messages a user should see for this verdict.
    pub fn display_errors(&self) -> Vec<String> {
        match self {
            FieldVerdict::Valid => Vec::new(),
            FieldVerdict::Invalid { errors } => errors.clone(),
            FieldVerdict::InternalError { .. } => vec![INTERNAL_ERROR_MESSAGE.to_string()],
        }
    }
}
