use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{VcsError, VcsResult};
use crate::model::{generate_id, Id, MAIN_BRANCH};

pub const DEFAULT_MAX_BRANCH_NAME_LENGTH: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchStatus {
    Active,     // Branch is accepting changes
    Merged,     // Branch has been merged into another branch
    Conflicted, // Last merge attempt stopped on conflicts
    Deleted,    // Soft deleted, row kept for the audit trail
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Active => "ACTIVE",
            BranchStatus::Merged => "MERGED",
            BranchStatus::Conflicted => "CONFLICTED",
            BranchStatus::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchStatus {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(BranchStatus::Active),
            "MERGED" => Ok(BranchStatus::Merged),
            "CONFLICTED" => Ok(BranchStatus::Conflicted),
            "DELETED" => Ok(BranchStatus::Deleted),
            other => Err(VcsError::invalid(
                "branch status",
                format!("unknown status '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchType {
    #[default]
    SchemaOnly,
    Full,
    Temporal,
    Compressed,
}

impl BranchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchType::SchemaOnly => "schema-only",
            BranchType::Full => "full",
            BranchType::Temporal => "temporal",
            BranchType::Compressed => "compressed",
        }
    }
}

impl FromStr for BranchType {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema-only" => Ok(BranchType::SchemaOnly),
            "full" => Ok(BranchType::Full),
            "temporal" => Ok(BranchType::Temporal),
            "compressed" => Ok(BranchType::Compressed),
            other => Err(VcsError::invalid(
                "branch type",
                format!("unknown branch type '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Id,
    pub name: String,
    pub parent_branch_id: Option<Id>, // None only for main
    pub parent_branch_name: Option<String>,
    pub status: BranchStatus,
    pub branch_type: BranchType,
    /// Latest commit made on this branch; None until its first commit
    pub head_commit_sha: Option<String>,
    /// Parent's head at creation time
    pub fork_commit_sha: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub merged_by: Option<String>,
    pub merged_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Branch {
    pub fn new_main_branch(created_by: &str) -> Self {
        Self {
            id: generate_id(),
            name: MAIN_BRANCH.to_string(),
            parent_branch_id: None,
            parent_branch_name: None,
            status: BranchStatus::Active,
            branch_type: BranchType::Full,
            head_commit_sha: None,
            fork_commit_sha: None,
            description: Some("Default main branch".to_string()),
            metadata: serde_json::Value::Null,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            merged_by: None,
            merged_at: None,
            deleted_at: None,
        }
    }

    pub fn new_from_branch(
        parent: &Branch,
        name: String,
        branch_type: BranchType,
        description: Option<String>,
        metadata: serde_json::Value,
        created_by: &str,
    ) -> Self {
        Self {
            id: generate_id(),
            name,
            parent_branch_id: Some(parent.id.clone()),
            parent_branch_name: Some(parent.name.clone()),
            status: BranchStatus::Active,
            branch_type,
            head_commit_sha: None,
            fork_commit_sha: parent.effective_head().map(str::to_string),
            description,
            metadata,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            merged_by: None,
            merged_at: None,
            deleted_at: None,
        }
    }

    pub fn is_main(&self) -> bool {
        self.name == MAIN_BRANCH
    }

    /// Commit the branch currently resolves to: its own head, or the
    /// parent's commit it was forked from.
    pub fn effective_head(&self) -> Option<&str> {
        self.head_commit_sha
            .as_deref()
            .or(self.fork_commit_sha.as_deref())
    }

    pub fn is_deleted(&self) -> bool {
        self.status == BranchStatus::Deleted
    }

    pub fn can_accept_changes(&self) -> bool {
        self.status == BranchStatus::Active
    }

    pub fn can_be_merged(&self) -> bool {
        matches!(self.status, BranchStatus::Active | BranchStatus::Conflicted)
    }

    pub fn mark_as_merged(&mut self, merged_by: &str) {
        if self.is_main() {
            return;
        }
        self.status = BranchStatus::Merged;
        self.merged_by = Some(merged_by.to_string());
        self.merged_at = Some(Utc::now());
    }

    pub fn mark_as_deleted(&mut self, deleted_by: &str) {
        let now = Utc::now();
        self.status = BranchStatus::Deleted;
        self.deleted_at = Some(now);
        if self.merged_at.is_none() {
            self.merged_at = Some(now);
        }
        if self.merged_by.is_none() {
            self.merged_by = Some(deleted_by.to_string());
        }
    }
}

/// Check a branch name against the allowed character set and length.
pub fn validate_branch_name(name: &str, max_length: usize) -> VcsResult<()> {
    crate::error::require_non_empty("branch name", name)?;

    if name.chars().count() > max_length {
        return Err(VcsError::invalid(
            "branch name",
            format!("'{}' is longer than {} characters", name, max_length),
        ));
    }

    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(VcsError::invalid(
            "branch name",
            format!("'{}' must start with an ASCII letter", name),
        ));
    }

    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/'))) {
        return Err(VcsError::invalid(
            "branch name",
            format!("'{}' contains disallowed character '{}'", name, bad),
        ));
    }

    if name.contains("//") || name.ends_with('/') {
        return Err(VcsError::invalid(
            "branch name",
            format!("'{}' has an empty path segment", name),
        ));
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Branch => "branch",
            RefKind::Tag => "tag",
        }
    }
}

impl FromStr for RefKind {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch" => Ok(RefKind::Branch),
            "tag" => Ok(RefKind::Tag),
            other => Err(VcsError::invalid("ref kind", format!("unknown ref kind '{}'", other))),
        }
    }
}

/// Named pointer to a commit. Branch refs move; tag refs never do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ref {
    pub name: String,
    pub kind: RefKind,
    pub target_commit_sha: String,
    pub updated_at: DateTime<Utc>,
}

impl Ref {
    pub fn new(kind: RefKind, name: &str, target_commit_sha: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            target_commit_sha: target_commit_sha.to_string(),
            updated_at: Utc::now(),
        }
    }
}

/// Aggregates shown next to each branch in listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchMetrics {
    pub object_count: usize,
    pub storage_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchInfo {
    #[serde(flatten)]
    pub branch: Branch,
    pub metrics: BranchMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOrderField {
    CreatedAt,
    Name,
    Status,
}

/// Listing order, parsed from an allow-list only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOrder {
    pub field: BranchOrderField,
    pub descending: bool,
}

impl Default for BranchOrder {
    fn default() -> Self {
        Self {
            field: BranchOrderField::CreatedAt,
            descending: true,
        }
    }
}

impl FromStr for BranchOrder {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let mut parts = normalized.split_whitespace();
        let field = match parts.next() {
            Some("created_at") => BranchOrderField::CreatedAt,
            Some("name") => BranchOrderField::Name,
            Some("status") => BranchOrderField::Status,
            _ => {
                return Err(VcsError::invalid(
                    "order_by",
                    format!("'{}' is not an allowed ordering", s),
                ))
            }
        };
        let descending = match parts.next() {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(_) => {
                return Err(VcsError::invalid(
                    "order_by",
                    format!("'{}' is not an allowed direction", s),
                ))
            }
        };
        if parts.next().is_some() {
            return Err(VcsError::invalid(
                "order_by",
                format!("'{}' is not an allowed ordering", s),
            ));
        }
        Ok(Self { field, descending })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListBranchesOptions {
    pub status: Option<BranchStatus>,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub order_by: BranchOrder,
}

/// Input for creating a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBranch {
    pub name: String,
    #[serde(default = "default_parent")]
    pub parent: String,
    #[serde(default)]
    pub branch_type: BranchType,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_parent() -> String {
    MAIN_BRANCH.to_string()
}

impl NewBranch {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: default_parent(),
            branch_type: BranchType::default(),
            description: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn from_parent(name: &str, parent: &str) -> Self {
        Self {
            parent: parent.to_string(),
            ..Self::new(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteBranchResult {
    pub success: bool,
    pub message: String,
    pub branch_id: Id,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutResult {
    pub success: bool,
    pub previous_branch: String,
    pub current_branch: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_name_rules() {
        let max = DEFAULT_MAX_BRANCH_NAME_LENGTH;
        assert!(validate_branch_name("feature/add-orders_2", max).is_ok());
        assert!(matches!(
            validate_branch_name("", max),
            Err(VcsError::NullOrEmptyParameter(_))
        ));
        for bad in ["1feature", "feat ure", "feat;drop", "a//b", "a/", "ünicode"] {
            assert!(
                matches!(validate_branch_name(bad, max), Err(VcsError::InvalidFormat { .. })),
                "expected '{}' to be rejected",
                bad
            );
        }
        assert!(validate_branch_name(&"a".repeat(max + 1), max).is_err());
    }

    #[test]
    fn test_order_by_allow_list() {
        assert_eq!(
            "created_at DESC".parse::<BranchOrder>().unwrap(),
            BranchOrder::default()
        );
        assert_eq!(
            "name".parse::<BranchOrder>().unwrap(),
            BranchOrder {
                field: BranchOrderField::Name,
                descending: false
            }
        );
        assert!("name; DROP TABLE x".parse::<BranchOrder>().is_err());
        assert!("id asc".parse::<BranchOrder>().is_err());
        assert!("status sideways".parse::<BranchOrder>().is_err());
    }

    #[test]
    fn test_deleting_backfills_merge_fields() {
        let main = Branch::new_main_branch("alice");
        let mut branch = Branch::new_from_branch(
            &main,
            "feature".into(),
            BranchType::SchemaOnly,
            None,
            serde_json::Value::Null,
            "alice",
        );
        branch.mark_as_deleted("bob");
        assert_eq!(branch.status, BranchStatus::Deleted);
        assert_eq!(branch.merged_by.as_deref(), Some("bob"));
        assert!(branch.merged_at.is_some());
        assert!(branch.deleted_at.is_some());
    }

    #[test]
    fn test_main_never_becomes_merged() {
        let mut main = Branch::new_main_branch("alice");
        main.mark_as_merged("bob");
        assert_eq!(main.status, BranchStatus::Active);
    }
}
