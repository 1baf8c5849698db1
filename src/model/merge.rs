use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::VcsError;
use crate::model::{generate_id, Id, ObjectIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    ConflictsDetected,
    MergeSuccess,
    /// Conflicts were resolved and the result applied to the target
    Resolved,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::ConflictsDetected => "CONFLICTS_DETECTED",
            MergeStatus::MergeSuccess => "MERGE_SUCCESS",
            MergeStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for MergeStatus {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONFLICTS_DETECTED" => Ok(MergeStatus::ConflictsDetected),
            "MERGE_SUCCESS" => Ok(MergeStatus::MergeSuccess),
            "RESOLVED" => Ok(MergeStatus::Resolved),
            other => Err(VcsError::invalid(
                "merge status",
                format!("unknown merge status '{}'", other),
            )),
        }
    }
}

/// Persisted record of one merge attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: Id,
    pub source_branch: String,
    pub target_branch: String,
    /// Common ancestor commit; None when the histories share no commit
    pub base_commit_sha: Option<String>,
    pub source_commit_sha: Option<String>,
    pub target_commit_sha: Option<String>,
    /// Commit the target points at after the merge was applied
    pub result_commit_sha: Option<String>,
    pub status: MergeStatus,
    pub message: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MergeRecord {
    pub fn new(
        source_branch: &str,
        target_branch: &str,
        base_commit_sha: Option<String>,
        source_commit_sha: Option<String>,
        target_commit_sha: Option<String>,
        message: Option<String>,
        created_by: &str,
    ) -> Self {
        Self {
            id: generate_id(),
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            base_commit_sha,
            source_commit_sha,
            target_commit_sha,
            result_commit_sha: None,
            status: MergeStatus::ConflictsDetected,
            message,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete(&mut self, status: MergeStatus, result_commit_sha: Option<String>) {
        self.status = status;
        self.result_commit_sha = result_commit_sha;
        self.completed_at = Some(Utc::now());
    }
}

/// Result of `merge_branches`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeOutcome {
    MergeSuccess {
        merge_id: Id,
        result_commit_sha: Option<String>,
        fast_forward: bool,
    },
    ConflictsDetected {
        merge_id: Id,
        conflicts: usize,
    },
}

impl MergeOutcome {
    pub fn merge_id(&self) -> &str {
        match self {
            MergeOutcome::MergeSuccess { merge_id, .. } => merge_id,
            MergeOutcome::ConflictsDetected { merge_id, .. } => merge_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MergeOutcome::MergeSuccess { .. })
    }
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeOutcome::MergeSuccess { merge_id, .. } => write!(f, "MERGE_SUCCESS:{}", merge_id),
            MergeOutcome::ConflictsDetected { merge_id, .. } => {
                write!(f, "CONFLICTS_DETECTED:{}", merge_id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Both sides changed an existing object differently
    ModifyModify,
    /// Both sides added the same object with different content
    AddAdd,
    /// Source changed the object, target dropped it
    ModifyDelete,
    /// Source dropped the object, target changed it
    DeleteModify,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ModifyModify => "modify-modify",
            ConflictType::AddAdd => "add-add",
            ConflictType::ModifyDelete => "modify-delete",
            ConflictType::DeleteModify => "delete-modify",
        }
    }

    /// Classify a conflicting triple of hashes (None = absent).
    pub fn classify(base: Option<&str>, source: Option<&str>, target: Option<&str>) -> Self {
        match (base, source, target) {
            (None, _, _) => ConflictType::AddAdd,
            (Some(_), Some(_), None) => ConflictType::ModifyDelete,
            (Some(_), None, Some(_)) => ConflictType::DeleteModify,
            _ => ConflictType::ModifyModify,
        }
    }
}

impl FromStr for ConflictType {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "modify-modify" => Ok(ConflictType::ModifyModify),
            "add-add" => Ok(ConflictType::AddAdd),
            "modify-delete" => Ok(ConflictType::ModifyDelete),
            "delete-modify" => Ok(ConflictType::DeleteModify),
            other => Err(VcsError::invalid(
                "conflict type",
                format!("unknown conflict type '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    TakeSource,
    TakeTarget,
    TakeBase,
    Manual { definition: String },
}

impl ResolutionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionStrategy::TakeSource => "TAKE_SOURCE",
            ResolutionStrategy::TakeTarget => "TAKE_TARGET",
            ResolutionStrategy::TakeBase => "TAKE_BASE",
            ResolutionStrategy::Manual { .. } => "MANUAL",
        }
    }
}

/// Schema-level conflict found by a merge. Only the resolution fields ever
/// change, and only once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaConflict {
    pub id: Id,
    pub merge_id: Id,
    pub branch_a: String, // source
    pub branch_b: String, // target
    /// Commit the three-way comparison used as ancestor
    pub base_ref: Option<String>,
    pub conflict_object: ObjectIdentity,
    pub conflict_type: ConflictType,
    pub base_hash: Option<String>,
    pub source_hash: Option<String>,
    pub target_hash: Option<String>,
    pub resolution: Option<ResolutionStrategy>,
    /// Blob sha chosen by the resolution; None means the object is dropped
    pub resolved_hash: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SchemaConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub resolved: bool,
    pub remaining_conflicts: usize,
    /// Set when the resolution also materialized the merge
    pub applied_commit_sha: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_renders_status_and_id() {
        let ok = MergeOutcome::MergeSuccess {
            merge_id: "m1".into(),
            result_commit_sha: None,
            fast_forward: false,
        };
        assert_eq!(ok.to_string(), "MERGE_SUCCESS:m1");

        let conflicted = MergeOutcome::ConflictsDetected {
            merge_id: "m2".into(),
            conflicts: 3,
        };
        assert_eq!(conflicted.to_string(), "CONFLICTS_DETECTED:m2");
        assert!(!conflicted.is_success());
    }

    #[test]
    fn test_conflict_classification() {
        assert_eq!(
            ConflictType::classify(Some("h1"), Some("h2"), Some("h3")),
            ConflictType::ModifyModify
        );
        assert_eq!(
            ConflictType::classify(None, Some("h2"), Some("h3")),
            ConflictType::AddAdd
        );
        assert_eq!(
            ConflictType::classify(Some("h1"), Some("h2"), None),
            ConflictType::ModifyDelete
        );
        assert_eq!(
            ConflictType::classify(Some("h1"), None, Some("h3")),
            ConflictType::DeleteModify
        );
    }

    #[test]
    fn test_strategy_serialization() {
        let manual: ResolutionStrategy =
            serde_json::from_str(r#"{"strategy":"MANUAL","definition":"CREATE TABLE t()"}"#)
                .unwrap();
        assert_eq!(manual.name(), "MANUAL");
        let take: ResolutionStrategy = serde_json::from_str(r#"{"strategy":"TAKE_BASE"}"#).unwrap();
        assert_eq!(take, ResolutionStrategy::TakeBase);
    }
}
