use crate::github::{PullRequest, PullRequestMetadata};
use serde_derive::Serialize;
use std::fmt;

/// Why an integration attempt was abandoned. The display form is the failure
/// code quoted back to the author in the cleanup comment.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    Conflicts,
    MergeFailed,
    SynchronizationFailed,
    CheckingCommitChecksFailed,
    ChecksFailing,
    TimedOut,
    Blocked,
    Unknown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            FailureReason::Conflicts => "conflicts",
            FailureReason::MergeFailed => "mergeFailed",
            FailureReason::SynchronizationFailed => "synchronizationFailed",
            FailureReason::CheckingCommitChecksFailed => "checkingCommitChecksFailed",
            FailureReason::ChecksFailing => "checksFailing",
            FailureReason::TimedOut => "timedOut",
            FailureReason::Blocked => "blocked",
            FailureReason::Unknown => "unknown",
        };
        write!(f, "{}", code)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Status {
    Starting,
    Idle,
    Ready,
    Integrating {
        metadata: PullRequestMetadata,
    },
    RunningStatusChecks {
        metadata: PullRequestMetadata,
    },
    IntegrationFailed {
        metadata: PullRequestMetadata,
        error: FailureReason,
    },
}

impl Status {
    /// The pull request currently being prepared for merge, if any.
    pub fn in_flight(&self) -> Option<&PullRequestMetadata> {
        match self {
            Status::Integrating { metadata } | Status::RunningStatusChecks { metadata } => {
                Some(metadata)
            }
            _ => None,
        }
    }

    pub fn is_integrating(&self) -> bool {
        self.in_flight().is_some()
    }
}

/// The whole visible state of one target branch's merge machinery.
///
/// The queue keeps a stable two-tier partition: every top-priority pull
/// request precedes every normal one, and arrival order is preserved within
/// each tier.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub target_branch: String,
    pub queue: Vec<PullRequest>,
    pub status: Status,
}

impl State {
    pub fn new(target_branch: String) -> Self {
        Self {
            target_branch,
            queue: Vec::new(),
            status: Status::Starting,
        }
    }

    pub fn position_of(&self, number: u64) -> Option<usize> {
        self.queue.iter().position(|pr| pr.number == number)
    }

    /// Inserts or refreshes a queued pull request. An update keeps its
    /// position unless its priority tier changed, in which case it re-enters
    /// at the tail of the new tier.
    pub fn enqueue(&mut self, pull_request: PullRequest, top_priority_labels: &[String]) {
        let top_priority = pull_request.is_top_priority(top_priority_labels);
        if let Some(index) = self.position_of(pull_request.number) {
            if self.queue[index].is_top_priority(top_priority_labels) == top_priority {
                self.queue[index] = pull_request;
                return;
            }
            self.queue.remove(index);
        }
        let index = if top_priority {
            self.queue
                .iter()
                .position(|pr| !pr.is_top_priority(top_priority_labels))
                .unwrap_or(self.queue.len())
        } else {
            self.queue.len()
        };
        self.queue.insert(index, pull_request);
    }

    pub fn remove(&mut self, number: u64) -> Option<PullRequest> {
        self.position_of(number).map(|index| self.queue.remove(index))
    }
}
