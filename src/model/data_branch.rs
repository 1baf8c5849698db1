use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{VcsError, VcsResult};
use crate::model::{generate_id, Id};

/// Namespace holding base tables once routing is set up.
pub const BASE_NAMESPACE: &str = "_vcs_base";
/// Prefix of per-branch namespaces holding branch copies.
pub const BRANCH_NAMESPACE_PREFIX: &str = "_vcs_br_";
/// Longest identifier the host database keeps without truncating.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const READABLE_PART_LEN: usize = 24;
const DIGEST_PART_LEN: usize = 16;

/// A row as a JSON object keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// `schema.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub table: String,
}

impl QualifiedName {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    /// Where the original table lives once routing is active.
    pub fn base_location(&self) -> Self {
        Self::new(BASE_NAMESPACE, &self.flattened())
    }

    /// Where a branch keeps its copy of this table.
    pub fn branch_location(&self, branch: &str) -> Self {
        Self::new(&branch_namespace(branch), &self.flattened())
    }

    /// `schema__table` for reading, made unique by a digest of the exact
    /// (schema, table) pair
    fn flattened(&self) -> String {
        physical_identifier(
            &format!("{}__{}", self.schema, self.table),
            &format!("{}\0{}", self.schema, self.table),
        )
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for QualifiedName {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(schema, table))
            }
            None if !s.is_empty() => Ok(Self::new("public", s)),
            _ => Err(VcsError::invalid(
                "table name",
                format!("'{}' is not [schema.]table", s),
            )),
        }
    }
}

/// Identifier-safe namespace for a branch name. Names that sanitize to the
/// same text still get distinct namespaces.
pub fn branch_namespace(branch: &str) -> String {
    format!("{}{}", BRANCH_NAMESPACE_PREFIX, physical_identifier(branch, branch))
}

/// `<readable>_<digest>`: a lowercased, identifier-safe prefix of `readable`
/// followed by the leading hex digits of sha256(`key`). Bounded well below
/// `MAX_IDENTIFIER_LEN` even with a namespace prefix in front.
fn physical_identifier(readable: &str, key: &str) -> String {
    use sha2::{Digest, Sha256};

    let prefix: String = readable
        .chars()
        .take(READABLE_PART_LEN)
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{}_{}", prefix, &digest[..DIGEST_PART_LEN])
}

/// Values of the primary key columns of a row, in key order.
pub fn row_key(row: &Row, primary_key: &[String]) -> VcsResult<Vec<serde_json::Value>> {
    primary_key
        .iter()
        .map(|column| {
            row.get(column).cloned().ok_or_else(|| {
                VcsError::invalid("row", format!("missing primary key column '{}'", column))
            })
        })
        .collect()
}

/// Primary key values as a `{column: value}` object.
pub fn key_object(primary_key: &[String], key: &[serde_json::Value]) -> serde_json::Value {
    let map: Row = primary_key
        .iter()
        .cloned()
        .zip(key.iter().cloned())
        .collect();
    serde_json::Value::Object(map)
}

/// A table whose reads and writes are routed by the session's branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedTable {
    pub table: QualifiedName,
    pub base: QualifiedName,
    pub primary_key: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

/// Physical isolation record for one (branch, table) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBranchTable {
    pub branch_name: String,
    pub source: QualifiedName,
    pub branch_table: QualifiedName,
    pub uses_cow: bool,
    pub rows_copied: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataConflictType {
    UpdateUpdate,
    UpdateDelete,
    DeleteUpdate,
}

impl DataConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataConflictType::UpdateUpdate => "update-update",
            DataConflictType::UpdateDelete => "update-delete",
            DataConflictType::DeleteUpdate => "delete-update",
        }
    }
}

impl FromStr for DataConflictType {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update-update" => Ok(DataConflictType::UpdateUpdate),
            "update-delete" => Ok(DataConflictType::UpdateDelete),
            "delete-update" => Ok(DataConflictType::DeleteUpdate),
            other => Err(VcsError::invalid(
                "data conflict type",
                format!("unknown data conflict type '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataResolution {
    Pending,
    Source,
    Target,
    Manual,
}

impl DataResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataResolution::Pending => "pending",
            DataResolution::Source => "source",
            DataResolution::Target => "target",
            DataResolution::Manual => "manual",
        }
    }
}

impl FromStr for DataResolution {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DataResolution::Pending),
            "source" => Ok(DataResolution::Source),
            "target" => Ok(DataResolution::Target),
            "manual" => Ok(DataResolution::Manual),
            other => Err(VcsError::invalid(
                "resolution",
                format!("unknown data resolution '{}'", other),
            )),
        }
    }
}

/// Row-level conflict between two branch copies of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConflict {
    pub id: Id,
    pub merge_id: Id,
    pub table_name: QualifiedName,
    pub source_branch: String,
    pub target_branch: String,
    pub primary_key_value: serde_json::Value,
    pub source_data: Option<Row>,
    pub target_data: Option<Row>,
    pub conflict_type: DataConflictType,
    pub resolution: DataResolution,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set once the resolution has been written into the target copy
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
}

impl DataConflict {
    pub fn new(
        merge_id: &str,
        table_name: QualifiedName,
        source_branch: &str,
        target_branch: &str,
        primary_key_value: serde_json::Value,
        source_data: Option<Row>,
        target_data: Option<Row>,
        conflict_type: DataConflictType,
    ) -> Self {
        Self {
            id: generate_id(),
            merge_id: merge_id.to_string(),
            table_name,
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            primary_key_value,
            source_data,
            target_data,
            conflict_type,
            resolution: DataResolution::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            applied_at: None,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataMergeSummary {
    pub tables: usize,
    pub rows_upserted: u64,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    pub rows_skipped: u64,
}
