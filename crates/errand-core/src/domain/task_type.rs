//! TaskType - the closed set of background task kinds.
//!
//! The type selects the handler from the registry. Because the set is closed,
//! an unknown type can only come from outside (API input, config), and is
//! rejected when parsed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Organize,
    Search,
    Cleanup,
    FolderOperation,
    Backup,
    Analysis,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::Organize,
        TaskType::Search,
        TaskType::Cleanup,
        TaskType::FolderOperation,
        TaskType::Backup,
        TaskType::Analysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organize => "organize",
            Self::Search => "search",
            Self::Cleanup => "cleanup",
            Self::FolderOperation => "folder_operation",
            Self::Backup => "backup",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task type: {0}")]
pub struct UnknownTaskType(pub String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    /// Case-insensitive; accepts `FOLDER_OPERATION` as well as `folder_operation`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == lowered)
            .ok_or_else(|| UnknownTaskType(s.to_string()))
    }
}
