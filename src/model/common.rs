use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{VcsError, VcsResult};

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Name of the root branch. It has no parent and can never be deleted.
pub const MAIN_BRANCH: &str = "main";

/// Kind of database object tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Table,
    View,
    Function,
    Index,
    Sequence,
    Type,
    Trigger,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Table => "table",
            ObjectType::View => "view",
            ObjectType::Function => "function",
            ObjectType::Index => "index",
            ObjectType::Sequence => "sequence",
            ObjectType::Type => "type",
            ObjectType::Trigger => "trigger",
        }
    }

    /// Creation order: objects that others may reference come first.
    pub fn dependency_rank(&self) -> u8 {
        match self {
            ObjectType::Type => 0,
            ObjectType::Sequence => 1,
            ObjectType::Table => 2,
            ObjectType::Index => 3,
            ObjectType::View => 4,
            ObjectType::Function => 5,
            ObjectType::Trigger => 6,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(ObjectType::Table),
            "view" => Ok(ObjectType::View),
            "function" => Ok(ObjectType::Function),
            "index" => Ok(ObjectType::Index),
            "sequence" => Ok(ObjectType::Sequence),
            "type" => Ok(ObjectType::Type),
            "trigger" => Ok(ObjectType::Trigger),
            other => Err(VcsError::invalid(
                "object type",
                format!("unknown object type '{}'", other),
            )),
        }
    }
}

/// Identity of a schema object: (type, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub object_type: ObjectType,
    pub schema_name: String,
    pub object_name: String,
}

impl ObjectIdentity {
    pub fn new(object_type: ObjectType, schema_name: &str, object_name: &str) -> Self {
        Self {
            object_type,
            schema_name: schema_name.to_string(),
            object_name: object_name.to_string(),
        }
    }

    pub fn table(schema_name: &str, object_name: &str) -> Self {
        Self::new(ObjectType::Table, schema_name, object_name)
    }

    /// Tree path of this object: `<type>/<schema>/<name>`.
    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}",
            self.object_type, self.schema_name, self.object_name
        )
    }

    pub fn from_path(path: &str) -> VcsResult<Self> {
        let mut parts = path.splitn(3, '/');
        let (Some(object_type), Some(schema_name), Some(object_name)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(VcsError::invalid(
                "tree path",
                format!("'{}' is not <type>/<schema>/<name>", path),
            ));
        };

        if schema_name.is_empty() || object_name.is_empty() {
            return Err(VcsError::invalid(
                "tree path",
                format!("'{}' has an empty component", path),
            ));
        }

        Ok(Self {
            object_type: object_type.parse()?,
            schema_name: schema_name.to_string(),
            object_name: object_name.to_string(),
        })
    }

    pub fn validate(&self) -> VcsResult<()> {
        crate::error::require_non_empty("schema_name", &self.schema_name)?;
        crate::error::require_non_empty("object_name", &self.object_name)?;
        if self.schema_name.contains('/') {
            return Err(VcsError::invalid("schema_name", "must not contain '/'"));
        }
        Ok(())
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}",
            self.object_type, self.schema_name, self.object_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_path_roundtrip_keeps_slashes_in_name() {
        let identity = ObjectIdentity::new(ObjectType::Function, "public", "calc/total");
        assert_eq!(identity.path(), "function/public/calc/total");
        assert_eq!(ObjectIdentity::from_path(&identity.path()).unwrap(), identity);
    }

    #[test]
    fn test_identity_from_bad_path() {
        assert!(ObjectIdentity::from_path("table/public").is_err());
        assert!(ObjectIdentity::from_path("widget/public/x").is_err());
        assert!(ObjectIdentity::from_path("table//x").is_err());
    }

    #[test]
    fn test_dependency_rank_orders_types_before_tables_before_views() {
        assert!(ObjectType::Type.dependency_rank() < ObjectType::Table.dependency_rank());
        assert!(ObjectType::Table.dependency_rank() < ObjectType::View.dependency_rank());
        assert!(ObjectType::View.dependency_rank() < ObjectType::Trigger.dependency_rank());
    }
}
