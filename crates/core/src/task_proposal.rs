use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const JSON_FENCE: &str = r"(?s)```json\n(.*?)\n```";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

/// A task an assistant reply proposes to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProposal {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

fn json_fence() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(JSON_FENCE).ok()).as_ref()
}

/// Reads the first fenced `json` block of `reply` as a task proposal.
///
/// Missing fences, invalid JSON and payloads that do not match the proposal
/// shape all yield `None`. Unknown fields are ignored.
pub fn parse_task_proposal(reply: &str) -> Option<TaskProposal> {
    let payload = json_fence()?.captures(reply)?.get(1)?.as_str();
    serde_json::from_str(payload).ok()
}
