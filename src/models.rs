use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// One entry of a snapshot. `relative_path` is always root-relative with `/`
/// separators; the host's absolute layout never leaves the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub relative_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Finds a descendant by its root-relative path.
    #[cfg(test)]
    pub fn find(&self, relative_path: &str) -> Option<&TreeNode> {
        if self.relative_path == relative_path {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(relative_path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub relative_path: String,
    pub content: Option<String>,
}

/// What an observer receives on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PushMessage {
    Snapshot(std::sync::Arc<TreeNode>),
    Change(ChangeEvent),
}

impl PushMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            PushMessage::Snapshot(_) => "snapshot",
            PushMessage::Change(_) => "change",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub requester_id: String,
    /// `None` when the caller sent something that is not text.
    pub source_text: Option<String>,
    pub size_bytes: usize,
    pub label: String,
}

impl ExecutionRequest {
    #[cfg(test)]
    pub fn new(requester_id: impl Into<String>, source_text: impl Into<String>, label: impl Into<String>) -> Self {
        let source_text = source_text.into();
        ExecutionRequest {
            requester_id: requester_id.into(),
            size_bytes: source_text.len(),
            source_text: Some(source_text),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    RateLimited,
    InvalidInput,
    TooLarge,
    SpawnError,
    RuntimeError,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub failure_kind: Option<FailureKind>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn failed(kind: FailureKind, stderr: impl Into<String>) -> Self {
        ExecutionResult {
            succeeded: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: None,
            failure_kind: Some(kind),
            duration_ms: 0,
        }
    }
}

#[derive(Deserialize)]
pub struct FileQuery {
    pub path: Option<String>,
}

#[derive(Serialize)]
pub struct FileContent {
    pub content: String,
    pub extension: Option<String>,
}

/// Body of `POST /api/execute`. `code` stays untyped so a non-string payload
/// is reported as invalid input rather than a deserialization failure.
#[derive(Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    pub code: serde_json::Value,
    pub label: Option<String>,
}
