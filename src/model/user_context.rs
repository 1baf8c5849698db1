use serde::{Deserialize, Serialize};

use crate::model::MAIN_BRANCH;

/// User context extracted from request headers for the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
}

impl UserContext {
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            user_email: None,
            user_name: None,
        }
    }

    pub fn with_details(user_id: String, email: Option<String>, name: Option<String>) -> Self {
        Self {
            user_id,
            user_email: email,
            user_name: name,
        }
    }

    /// Context for internal operations such as bootstrap
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            user_email: None,
            user_name: Some("System".to_string()),
        }
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::system()
    }
}

/// Per-session state. Routed reads and writes resolve their physical table
/// from `current_branch`; nothing else consults it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub current_branch: String,
    pub user: UserContext,
}

impl Session {
    pub fn new(id: &str, user: UserContext) -> Self {
        Self {
            id: id.to_string(),
            current_branch: MAIN_BRANCH.to_string(),
            user,
        }
    }

    pub fn on_main(&self) -> bool {
        self.current_branch == MAIN_BRANCH
    }

    /// Point the session at another branch, returning the previous one.
    pub fn set_branch(&mut self, branch: &str) -> String {
        std::mem::replace(&mut self.current_branch, branch.to_string())
    }
}
