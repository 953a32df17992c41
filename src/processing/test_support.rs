use crate::github::{Branch, Label, MergeableState, PullRequest, PullRequestMetadata, User};

pub(crate) fn pull_request(number: u64, labels: &[&str]) -> PullRequest {
    PullRequest {
        number,
        title: format!("PR #{}", number),
        author: User {
            id: number,
            login: format!("author-{}", number),
        },
        labels: labels
            .iter()
            .map(|name| Label {
                name: name.to_string(),
            })
            .collect(),
        source: Branch {
            name: format!("feature/{}", number),
            sha: format!("sha-{}", number),
        },
        target: Branch {
            name: "develop".into(),
            sha: "base-sha".into(),
        },
    }
}

pub(crate) fn metadata(
    number: u64,
    labels: &[&str],
    state: MergeableState,
) -> PullRequestMetadata {
    PullRequestMetadata {
        reference: pull_request(number, labels),
        merged: false,
        merge_state: state,
    }
}
