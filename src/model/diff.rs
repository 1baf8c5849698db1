use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::VcsError;
use crate::model::{ObjectIdentity, ObjectType};

/// One active object of a branch at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub identity: ObjectIdentity,
    pub content_hash: String,
    pub definition: String,
}

/// A branch's active objects, keyed by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub branch: String,
    pub commit_sha: Option<String>,
    pub taken_at: DateTime<Utc>,
    /// Serialized as a list of entries; JSON maps need string keys
    #[serde(with = "entry_list")]
    pub objects: BTreeMap<ObjectIdentity, SnapshotEntry>,
}

mod entry_list {
    use super::{ObjectIdentity, SnapshotEntry};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        objects: &BTreeMap<ObjectIdentity, SnapshotEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(objects.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ObjectIdentity, SnapshotEntry>, D::Error> {
        let entries = Vec::<SnapshotEntry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.identity.clone(), entry))
            .collect())
    }
}

impl SchemaSnapshot {
    pub fn empty(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            commit_sha: None,
            taken_at: Utc::now(),
            objects: BTreeMap::new(),
        }
    }

    pub fn get(&self, identity: &ObjectIdentity) -> Option<&SnapshotEntry> {
        self.objects.get(identity)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Removed => "removed",
        }
    }
}

impl FromStr for ChangeType {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "added" => Ok(ChangeType::Added),
            "modified" => Ok(ChangeType::Modified),
            "removed" => Ok(ChangeType::Removed),
            other => Err(VcsError::invalid(
                "change type",
                format!("unknown change type '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub identity: ObjectIdentity,
    pub change_type: ChangeType,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub old_definition: Option<String>,
    pub new_definition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub total: usize,
}

impl DiffSummary {
    /// Tally a change list; the counts always reconcile with it.
    pub fn from_changes(changes: &[SchemaChange]) -> Self {
        let mut summary = DiffSummary::default();
        for change in changes {
            match change.change_type {
                ChangeType::Added => summary.added += 1,
                ChangeType::Removed => summary.removed += 1,
                ChangeType::Modified => summary.modified += 1,
            }
        }
        summary.total = changes.len();
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffDocument {
    pub from_branch: String,
    pub to_branch: String,
    pub from_commit: Option<String>,
    pub to_commit: Option<String>,
    pub changes: Vec<SchemaChange>,
    pub summary: DiffSummary,
}

impl DiffDocument {
    pub fn added(&self) -> impl Iterator<Item = &SchemaChange> {
        self.of_type(ChangeType::Added)
    }

    pub fn removed(&self) -> impl Iterator<Item = &SchemaChange> {
        self.of_type(ChangeType::Removed)
    }

    pub fn modified(&self) -> impl Iterator<Item = &SchemaChange> {
        self.of_type(ChangeType::Modified)
    }

    fn of_type(&self, change_type: ChangeType) -> impl Iterator<Item = &SchemaChange> {
        self.changes
            .iter()
            .filter(move |c| c.change_type == change_type)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeCategory {
    Optional,
    Compatible,
    Risky,
    Breaking,
}

impl fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeCategory::Optional => "OPTIONAL",
            ChangeCategory::Compatible => "COMPATIBLE",
            ChangeCategory::Risky => "RISKY",
            ChangeCategory::Breaking => "BREAKING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorizedChange {
    pub category: ChangeCategory,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl From<ChangeCategory> for RiskLevel {
    fn from(category: ChangeCategory) -> Self {
        match category {
            ChangeCategory::Breaking => RiskLevel::High,
            ChangeCategory::Risky => RiskLevel::Medium,
            ChangeCategory::Compatible | ChangeCategory::Optional => RiskLevel::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Feasibility {
    Automatic,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub order: usize,
    pub identity: ObjectIdentity,
    pub change_type: ChangeType,
    pub category: ChangeCategory,
    pub description: String,
    /// Definition to apply; None for removals
    pub definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub source_branch: String,
    pub target_branch: String,
    pub steps: Vec<MigrationStep>,
    pub feasibility: Feasibility,
    pub risk_level: RiskLevel,
    pub summary: DiffSummary,
    pub generated_at: DateTime<Utc>,
}

impl MigrationPlan {
    pub fn breaking_steps(&self) -> impl Iterator<Item = &MigrationStep> {
        self.steps
            .iter()
            .filter(|s| s.category == ChangeCategory::Breaking)
    }

    pub fn count_by_type(&self, object_type: ObjectType) -> usize {
        self.steps
            .iter()
            .filter(|s| s.identity.object_type == object_type)
            .count()
    }
}
