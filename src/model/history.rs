use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ObjectIdentity;

/// A schema change recorded against a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ObjectChange {
    Upsert {
        identity: ObjectIdentity,
        definition: String,
    },
    Drop {
        identity: ObjectIdentity,
    },
}

impl ObjectChange {
    pub fn upsert(identity: ObjectIdentity, definition: impl Into<String>) -> Self {
        ObjectChange::Upsert {
            identity,
            definition: definition.into(),
        }
    }

    pub fn identity(&self) -> &ObjectIdentity {
        match self {
            ObjectChange::Upsert { identity, .. } => identity,
            ObjectChange::Drop { identity } => identity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Create,
    Alter,
    Drop,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Create => "create",
            HistoryAction::Alter => "alter",
            HistoryAction::Drop => "drop",
        }
    }
}

/// One tracked DDL event on a branch. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectHistoryEntry {
    pub branch_name: String,
    pub identity: ObjectIdentity,
    pub action: HistoryAction,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub commit_sha: String,
    pub author: String,
    pub recorded_at: DateTime<Utc>,
}

/// Failure of a best-effort side effect, kept for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingErrorRecord {
    pub operation: String,
    pub branch_name: Option<String>,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl TrackingErrorRecord {
    pub fn new(operation: &str, branch_name: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            branch_name: branch_name.map(str::to_string),
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}
