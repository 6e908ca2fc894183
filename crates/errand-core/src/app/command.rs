//! Command strings typed into the chat, mapped to task types.
//!
//! Keywords match case-insensitively; extracted values keep the user's casing.

use serde_json::Value;

use crate::domain::{Parameters, TaskType};

const BACKGROUND_KEYWORDS: [&str; 11] = [
    "/organize",
    "/search",
    "/cleanup",
    "/backup",
    "analyze",
    "scan",
    "index",
    "process large",
    "batch",
    "bulk",
    "mass operation",
];

const FOLDER_ACTIONS: [&str; 2] = ["create", "navigate"];

/// Does this command warrant a background task?
pub fn is_background_command(command: &str) -> bool {
    let lowered = command.to_lowercase();
    BACKGROUND_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Derive the task type from `command` and merge extracted arguments into
/// `parameters`. Extracted values overwrite caller-supplied ones.
pub fn parse_command(command: &str, mut parameters: Parameters) -> (TaskType, Parameters) {
    let trimmed = command.trim();
    let lowered = trimmed.to_lowercase();
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    let rest = || words.get(1..).map(|w| w.join(" ")).filter(|s| !s.is_empty());

    let task_type = if lowered.starts_with("/organize") {
        if let Some(path) = rest() {
            parameters.insert("path".into(), Value::String(path));
        }
        TaskType::Organize
    } else if lowered.starts_with("/search") {
        if let Some(query) = rest() {
            parameters.insert("query".into(), Value::String(query));
        }
        TaskType::Search
    } else if lowered.starts_with("/cleanup") {
        if words.len() > 1 {
            let options = words[1..].iter().map(|w| Value::String((*w).into())).collect();
            parameters.insert("options".into(), Value::Array(options));
        }
        TaskType::Cleanup
    } else if lowered.starts_with("/folder") {
        if let Some((_, after)) = trimmed.split_once(':')
            && let Some(name) = after.split_whitespace().next()
        {
            parameters.insert("folder_name".into(), Value::String(name.into()));
        }
        let action = words
            .last()
            .filter(|_| words.len() > 1)
            .map(|w| w.to_lowercase())
            .filter(|w| FOLDER_ACTIONS.contains(&w.as_str()))
            .unwrap_or_else(|| "create".to_string());
        parameters.insert("action".into(), Value::String(action));
        TaskType::FolderOperation
    } else if lowered.contains("backup") {
        TaskType::Backup
    } else {
        TaskType::Analysis
    };

    (task_type, parameters)
}
