pub mod client;
pub mod models;

#[cfg(test)]
pub use client::MockGithubClient;
pub use client::{DefaultGithubClient, GithubClient};
pub use models::{
    combined_state, Branch, BranchMergeResult, CommitState, CommitStatusItem, IssueComment,
    Label, MergeableState, PullRequest, PullRequestAction, PullRequestMetadata,
    RequiredStatusChecks, StatusCheck, StatusEvent, StatusState, User,
};
