use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeableState {
    Behind,
    Blocked,
    Clean,
    Dirty,
    Unstable,

    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestAction {
    Opened,
    Labeled,
    Unlabeled,
    Closed,
    Synchronize,

    #[serde(other)]
    Other,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub login: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    #[serde(rename = "ref")]
    pub name: String,

    pub sha: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,

    #[serde(rename = "user")]
    pub author: User,

    pub labels: Vec<Label>,

    #[serde(rename = "head")]
    pub source: Branch,

    #[serde(rename = "base")]
    pub target: Branch,
}

impl PullRequest {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|label| label.name == name)
    }

    pub fn is_top_priority(&self, top_priority_labels: &[String]) -> bool {
        self.labels
            .iter()
            .any(|label| top_priority_labels.contains(&label.name))
    }
}

/// A pull request plus the mergeability fields only the detail endpoint carries.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PullRequestMetadata {
    #[serde(flatten)]
    pub reference: PullRequest,

    pub merged: bool,

    #[serde(rename = "mergeable_state")]
    pub merge_state: MergeableState,
}

impl PullRequestMetadata {
    pub fn number(&self) -> u64 {
        self.reference.number
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,

    #[serde(alias = "error")]
    Failure,
}

/// Aggregates check states the way the host does: any failure wins, then any
/// pending, then success.
pub fn combined_state<I>(states: I) -> StatusState
where
    I: IntoIterator<Item = StatusState>,
{
    let mut outcome = StatusState::Success;
    for state in states {
        match state {
            StatusState::Failure => return StatusState::Failure,
            StatusState::Pending => outcome = StatusState::Pending,
            StatusState::Success => (),
        }
    }
    outcome
}

/// A status delivery for a commit on some branch.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub context: String,
    pub state: StatusState,
    pub sha: String,
    pub branch_ref: String,
}

impl StatusEvent {
    pub fn is_relative(&self, branch: &str) -> bool {
        self.branch_ref == branch
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StatusCheck {
    pub context: String,
    pub state: StatusState,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CommitStatusItem {
    pub context: String,
    pub state: StatusState,
}

/// The combined commit status for a ref: host-side aggregate plus the
/// individual contexts that produced it.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CommitState {
    pub state: StatusState,
    pub statuses: Vec<CommitStatusItem>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RequiredStatusChecks {
    pub contexts: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct IssueComment {
    pub id: u64,
    pub user: User,
    pub body: String,

    #[serde(rename = "created_at")]
    pub creation_date: DateTime<Utc>,
}

/// Outcome of merging one branch head into another, mapped from the HTTP
/// status of the merges endpoint rather than a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchMergeResult {
    Success,
    UpToDate,
    Conflict,
}
