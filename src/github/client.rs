use super::models::{
    BranchMergeResult, CommitState, IssueComment, PullRequest, PullRequestMetadata,
    RequiredStatusChecks, StatusCheck,
};
use crate::client::{ApiClient, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use serde_derive::Serialize;

/// The host operations the merge machinery depends on. Kept behind a trait so
/// the processing layer can run against a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GithubClient {
    async fn pull_request(&self, number: u64) -> Result<PullRequestMetadata>;
    async fn open_pull_requests(&self) -> Result<Vec<PullRequest>>;
    async fn issue_comments(&self, pull_request: &PullRequest) -> Result<Vec<IssueComment>>;
    async fn all_status_checks(&self, pull_request: &PullRequest) -> Result<Vec<StatusCheck>>;
    async fn commit_status(&self, git_ref: &str) -> Result<CommitState>;
    async fn required_status_checks(&self, branch: &str) -> Result<RequiredStatusChecks>;
    async fn post_comment(&self, pull_request: &PullRequest, body: &str) -> Result<()>;
    async fn remove_label(&self, pull_request: &PullRequest, label: &str) -> Result<()>;
    async fn merge_pull_request(&self, pull_request: &PullRequest) -> Result<()>;
    async fn merge_branches(&self, base: &str, head: &str) -> Result<BranchMergeResult>;
    async fn delete_branch(&self, branch: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct DefaultGithubClient {
    client: ApiClient,
    repo_url: String,
}

impl DefaultGithubClient {
    pub fn new<O, R, U, T>(owner: O, repo: R, username: U, token: T) -> Self
    where
        O: AsRef<str>,
        R: AsRef<str>,
        U: Into<String>,
        T: Into<String>,
    {
        Self {
            client: ApiClient::from_credentials(username, token),
            repo_url: format!(
                "https://api.github.com/repos/{}/{}",
                owner.as_ref(),
                repo.as_ref()
            ),
        }
    }

    fn pulls_url(&self, number: u64) -> String {
        format!("{}/pulls/{}", self.repo_url, number)
    }

    fn issues_url(&self, number: u64) -> String {
        format!("{}/issues/{}", self.repo_url, number)
    }
}

#[async_trait]
impl GithubClient for DefaultGithubClient {
    async fn pull_request(&self, number: u64) -> Result<PullRequestMetadata> {
        self.client.get(&self.pulls_url(number)).await
    }

    async fn open_pull_requests(&self) -> Result<Vec<PullRequest>> {
        let url = format!("{}/pulls?state=open&per_page=100", self.repo_url);
        self.client.get(&url).await
    }

    async fn issue_comments(&self, pull_request: &PullRequest) -> Result<Vec<IssueComment>> {
        let url = format!("{}/comments", self.issues_url(pull_request.number));
        self.client.get(&url).await
    }

    async fn all_status_checks(&self, pull_request: &PullRequest) -> Result<Vec<StatusCheck>> {
        let url = format!(
            "{}/commits/{}/statuses",
            self.repo_url, pull_request.source.sha
        );
        self.client.get(&url).await
    }

    async fn commit_status(&self, git_ref: &str) -> Result<CommitState> {
        let url = format!("{}/commits/{}/status", self.repo_url, git_ref);
        self.client.get(&url).await
    }

    async fn required_status_checks(&self, branch: &str) -> Result<RequiredStatusChecks> {
        let url = format!(
            "{}/branches/{}/protection/required_status_checks",
            self.repo_url, branch
        );
        self.client.get(&url).await
    }

    async fn post_comment(&self, pull_request: &PullRequest, body: &str) -> Result<()> {
        let url = format!("{}/comments", self.issues_url(pull_request.number));
        let body = CommentRequest { body: body.into() };
        self.client.post_for_status(&url, &body).await.map(|_| ())
    }

    async fn remove_label(&self, pull_request: &PullRequest, label: &str) -> Result<()> {
        let url = format!("{}/labels/{}", self.issues_url(pull_request.number), label);
        self.client.delete_for_status(&url).await.map(|_| ())
    }

    async fn merge_pull_request(&self, pull_request: &PullRequest) -> Result<()> {
        let url = format!("{}/merge", self.pulls_url(pull_request.number));
        let body = MergePullRequestRequest {
            sha: pull_request.source.sha.clone(),
        };
        self.client.put_for_status(&url, &body).await.map(|_| ())
    }

    async fn merge_branches(&self, base: &str, head: &str) -> Result<BranchMergeResult> {
        let url = format!("{}/merges", self.repo_url);
        let body = MergeBranchesRequest {
            base: base.into(),
            head: head.into(),
        };
        match self.client.post_for_status(&url, &body).await {
            Ok(StatusCode::NO_CONTENT) => Ok(BranchMergeResult::UpToDate),
            Ok(_) => Ok(BranchMergeResult::Success),
            Err(e) if e.conflict() => Ok(BranchMergeResult::Conflict),
            Err(e) => Err(e),
        }
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        let url = format!("{}/git/refs/heads/{}", self.repo_url, branch);
        self.client.delete_for_status(&url).await.map(|_| ())
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct CommentRequest {
    body: String,
}

#[derive(Serialize, Debug, PartialEq)]
struct MergePullRequestRequest {
    sha: String,
}

#[derive(Serialize, Debug, PartialEq)]
struct MergeBranchesRequest {
    base: String,
    head: String,
}
