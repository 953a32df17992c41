use super::state::FailureReason;
use crate::github::{PullRequest, PullRequestAction, PullRequestMetadata};

/// The inclusion/exclusion effect a host-side pull request change has on a
/// queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Include(PullRequestMetadata),
    Exclude(PullRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntegrationUpdate {
    Updating,
    Done,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksOutcome {
    Passed,
    Failed,
    TimedOut,
}

/// Everything the merge state machine can react to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NoMorePullRequests,
    PullRequestsLoaded(Vec<PullRequest>),
    PullRequestDidChange(Change),
    Integrate(PullRequestMetadata),
    RetryIntegration(PullRequestMetadata),
    IntegrationDidChangeStatus(IntegrationUpdate, PullRequestMetadata),
    StatusChecksDidComplete(ChecksOutcome, PullRequestMetadata),
    IntegrationFailureHandled,
}

/// Maps a host-side action to its queue effect, if it has one.
pub fn classify(
    integration_label: &str,
    metadata: &PullRequestMetadata,
    action: PullRequestAction,
) -> Option<Change> {
    match action {
        PullRequestAction::Opened if metadata.reference.has_label(integration_label) => {
            Some(Change::Include(metadata.clone()))
        }
        PullRequestAction::Labeled
            if metadata.reference.has_label(integration_label) && !metadata.merged =>
        {
            Some(Change::Include(metadata.clone()))
        }
        PullRequestAction::Unlabeled if !metadata.reference.has_label(integration_label) => {
            Some(Change::Exclude(metadata.reference.clone()))
        }
        PullRequestAction::Closed => Some(Change::Exclude(metadata.reference.clone())),
        _ => None,
    }
}
