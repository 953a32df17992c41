use super::events::{ChecksOutcome, Event, IntegrationUpdate};
use super::service::{Emitter, ServiceConfig};
use super::state::{FailureReason, State, Status};
use crate::client;
use crate::github::{
    combined_state, BranchMergeResult, GithubClient, IssueComment, MergeableState, PullRequest,
    PullRequestAction, PullRequestMetadata, RequiredStatusChecks, StatusEvent, StatusState,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

pub(crate) const ACCEPTED_PREFIX: &str = "accepted";
pub(crate) const REBOOT_PREFIX: &str = "WallE just started after a reboot.\n";

const SYNCHRONIZE_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_CHECKS_GRACE_PERIOD: Duration = Duration::from_secs(60);
const UNKNOWN_STATE_RETRIES: u32 = 4;
const UNKNOWN_STATE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Aborts the wrapped task when dropped, so replacing an effect cancels its
/// timers and in-flight fetches.
pub(crate) struct TaskGuard(pub(crate) JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Projection of the state an effect cares about. An unchanged key means the
/// running handler keeps going instead of being re-spawned.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EffectKey {
    None,
    Starting,
    Ready(Vec<u64>),
    Integrating(Box<PullRequestMetadata>),
    RunningStatusChecks(Box<PullRequestMetadata>),
    IntegrationFailed(u64),
}

pub(crate) fn key_for(state: &State) -> EffectKey {
    match &state.status {
        Status::Idle => EffectKey::None,
        Status::Starting => EffectKey::Starting,
        Status::Ready => EffectKey::Ready(state.queue.iter().map(|pr| pr.number).collect()),
        Status::Integrating { metadata } => EffectKey::Integrating(Box::new(metadata.clone())),
        Status::RunningStatusChecks { metadata } => {
            EffectKey::RunningStatusChecks(Box::new(metadata.clone()))
        }
        Status::IntegrationFailed { metadata, .. } => {
            EffectKey::IntegrationFailed(metadata.number())
        }
    }
}

pub(crate) struct EffectContext<G> {
    pub github: Arc<G>,
    pub config: Arc<ServiceConfig>,
    pub emitter: Emitter,
    pub initial_pull_requests: Vec<PullRequest>,
    pub pull_request_events: broadcast::Sender<(PullRequestMetadata, PullRequestAction)>,
    pub status_events: broadcast::Sender<StatusEvent>,
}

pub(crate) fn spawn<G>(context: &EffectContext<G>, state: &State) -> Option<TaskGuard>
where
    G: GithubClient + Send + Sync + 'static,
{
    let task = match &state.status {
        Status::Idle => return None,
        Status::Starting => tokio::spawn(load_initial(
            context.github.clone(),
            context.config.clone(),
            context.initial_pull_requests.clone(),
            context.emitter.clone(),
        )),
        Status::Ready => tokio::spawn(drive_queue_head(
            context.github.clone(),
            state.queue.first().map(|pr| pr.number),
            context.emitter.clone(),
        )),
        // Subscriptions happen here, not inside the task, so an event raced
        // in right after the state change cannot be missed.
        Status::Integrating { metadata } => tokio::spawn(integrate(
            context.github.clone(),
            context.config.clone(),
            metadata.clone(),
            context.emitter.clone(),
            context.pull_request_events.subscribe(),
        )),
        Status::RunningStatusChecks { metadata } => tokio::spawn(run_status_checks(
            context.github.clone(),
            context.config.clone(),
            state.target_branch.clone(),
            metadata.clone(),
            context.emitter.clone(),
            context.status_events.subscribe(),
        )),
        Status::IntegrationFailed { metadata, error } => tokio::spawn(handle_failure(
            context.github.clone(),
            context.config.clone(),
            metadata.clone(),
            *error,
            context.emitter.clone(),
        )),
    };
    Some(TaskGuard(task))
}

pub(crate) fn acceptance_comment(
    position: usize,
    target_branch: &str,
    integration_in_progress: bool,
    rebooted: bool,
) -> String {
    let body = if position == 0 && !integration_in_progress {
        format!("{}, handled right away", ACCEPTED_PREFIX)
    } else {
        format!(
            "{}, currently #{} in the `{}` queue",
            ACCEPTED_PREFIX,
            position + 1,
            target_branch
        )
    };
    if rebooted {
        format!("{}{}", REBOOT_PREFIX, body)
    } else {
        body
    }
}

fn latest_accepted_comment(
    comments: &[IssueComment],
    bot_user: Option<&str>,
) -> Option<DateTime<Utc>> {
    comments
        .iter()
        .filter(|comment| comment.body.contains(ACCEPTED_PREFIX))
        .filter(|comment| bot_user.map_or(true, |login| comment.user.login == login))
        .map(|comment| comment.creation_date)
        .max()
}

/// Reorders the pull requests found at boot by the timestamp of this bot's
/// last acceptance comment, oldest acceptance first; never-accepted ones sort
/// last.
async fn load_initial<G>(
    github: Arc<G>,
    config: Arc<ServiceConfig>,
    initial: Vec<PullRequest>,
    emitter: Emitter,
) where
    G: GithubClient + Send + Sync,
{
    let mut dated = Vec::with_capacity(initial.len());
    for pull_request in initial {
        let accepted_at = match github.issue_comments(&pull_request).await {
            Ok(comments) => latest_accepted_comment(&comments, config.bot_user.as_deref()),
            Err(e) => {
                warn!(
                    "Failed to fetch comments for #{}: {}",
                    pull_request.number, e
                );
                None
            }
        };
        dated.push((
            accepted_at.unwrap_or(DateTime::<Utc>::MAX_UTC),
            pull_request,
        ));
    }
    dated.sort_by_key(|(accepted_at, _)| *accepted_at);
    let ordered = dated.into_iter().map(|(_, pr)| pr).collect();
    emitter.event(Event::PullRequestsLoaded(ordered));
}

/// Refreshes the queue head and asks the machine to integrate it. A fetch
/// failure emits nothing; the next queue change re-arms this handler.
async fn drive_queue_head<G>(github: Arc<G>, head: Option<u64>, emitter: Emitter)
where
    G: GithubClient + Send + Sync,
{
    match head {
        None => emitter.event(Event::NoMorePullRequests),
        Some(number) => match github.pull_request(number).await {
            Ok(metadata) => emitter.event(Event::Integrate(metadata)),
            Err(e) => debug!("Failed to refresh head pull request #{}: {}", number, e),
        },
    }
}

async fn integrate<G>(
    github: Arc<G>,
    config: Arc<ServiceConfig>,
    metadata: PullRequestMetadata,
    emitter: Emitter,
    pull_request_events: broadcast::Receiver<(PullRequestMetadata, PullRequestAction)>,
) where
    G: GithubClient + Send + Sync,
{
    if metadata.merged {
        emitter.event(Event::IntegrationDidChangeStatus(
            IntegrationUpdate::Done,
            metadata,
        ));
        return;
    }
    match metadata.merge_state {
        MergeableState::Clean => merge_and_clean_up(&*github, metadata, &emitter).await,
        MergeableState::Unstable if !config.requires_all_status_checks => {
            merge_and_clean_up(&*github, metadata, &emitter).await
        }
        MergeableState::Behind => {
            synchronize_with_target(&*github, metadata, &emitter, pull_request_events).await
        }
        MergeableState::Blocked | MergeableState::Unstable => {
            evaluate_blocked(&*github, metadata, &emitter).await
        }
        MergeableState::Dirty => emitter.event(Event::IntegrationDidChangeStatus(
            IntegrationUpdate::Failed(FailureReason::Conflicts),
            metadata,
        )),
        MergeableState::Unknown => resolve_unknown(&*github, metadata, &emitter).await,
    }
}

async fn merge_and_clean_up<G>(github: &G, metadata: PullRequestMetadata, emitter: &Emitter)
where
    G: GithubClient + Send + Sync,
{
    match github.merge_pull_request(&metadata.reference).await {
        Ok(()) => {
            info!("Pull request #{} merged", metadata.number());
            let branch = &metadata.reference.source.name;
            if let Err(e) = github.delete_branch(branch).await {
                warn!("Failed to delete branch {}: {}", branch, e);
            }
            emitter.event(Event::IntegrationDidChangeStatus(
                IntegrationUpdate::Done,
                metadata,
            ));
        }
        Err(e) => {
            warn!("Failed to merge pull request #{}: {}", metadata.number(), e);
            emitter.event(Event::IntegrationDidChangeStatus(
                IntegrationUpdate::Failed(FailureReason::MergeFailed),
                metadata,
            ));
        }
    }
}

/// Brings a pull request that fell behind its target up to date and waits for
/// the host to confirm the new head with a `synchronize` action.
async fn synchronize_with_target<G>(
    github: &G,
    metadata: PullRequestMetadata,
    emitter: &Emitter,
    mut events: broadcast::Receiver<(PullRequestMetadata, PullRequestAction)>,
) where
    G: GithubClient + Send + Sync,
{
    let source = metadata.reference.source.name.clone();
    let target = metadata.reference.target.name.clone();
    match github.merge_branches(&source, &target).await {
        Ok(BranchMergeResult::Conflict) => emitter.event(Event::IntegrationDidChangeStatus(
            IntegrationUpdate::Failed(FailureReason::Conflicts),
            metadata,
        )),
        Ok(BranchMergeResult::UpToDate) => emitter.event(Event::IntegrationDidChangeStatus(
            IntegrationUpdate::Updating,
            metadata,
        )),
        Ok(BranchMergeResult::Success) => {
            let synchronized = async {
                loop {
                    match events.recv().await {
                        Ok((changed, PullRequestAction::Synchronize))
                            if changed.reference.source.name == source =>
                        {
                            break true;
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break false,
                    }
                }
            };
            match timeout(SYNCHRONIZE_TIMEOUT, synchronized).await {
                Ok(true) => emitter.event(Event::IntegrationDidChangeStatus(
                    IntegrationUpdate::Updating,
                    metadata,
                )),
                _ => emitter.event(Event::IntegrationDidChangeStatus(
                    IntegrationUpdate::Failed(FailureReason::SynchronizationFailed),
                    metadata,
                )),
            }
        }
        Err(e) => {
            warn!("Failed to update branch {}: {}", source, e);
            emitter.event(Event::IntegrationDidChangeStatus(
                IntegrationUpdate::Failed(FailureReason::SynchronizationFailed),
                metadata,
            ));
        }
    }
}

/// Figures out whether a blocked pull request is only waiting on checks, has
/// already failed them, or became mergeable behind our back.
async fn evaluate_blocked<G>(github: &G, metadata: PullRequestMetadata, emitter: &Emitter)
where
    G: GithubClient + Send + Sync,
{
    fn failed(reason: FailureReason, metadata: &PullRequestMetadata) -> Event {
        Event::IntegrationDidChangeStatus(IntegrationUpdate::Failed(reason), metadata.clone())
    }
    let checks = match github.all_status_checks(&metadata.reference).await {
        Ok(checks) => checks,
        Err(e) => {
            warn!("Failed to fetch status checks: {}", e);
            emitter.event(failed(FailureReason::CheckingCommitChecksFailed, &metadata));
            return;
        }
    };
    if checks.iter().any(|check| check.state == StatusState::Pending) {
        emitter.event(Event::IntegrationDidChangeStatus(
            IntegrationUpdate::Updating,
            metadata,
        ));
        return;
    }
    let commit = match github.commit_status(&metadata.reference.source.name).await {
        Ok(commit) => commit,
        Err(e) => {
            warn!("Failed to fetch commit status: {}", e);
            emitter.event(failed(FailureReason::CheckingCommitChecksFailed, &metadata));
            return;
        }
    };
    match commit.state {
        StatusState::Pending => emitter.event(Event::IntegrationDidChangeStatus(
            IntegrationUpdate::Updating,
            metadata,
        )),
        StatusState::Failure => {
            emitter.event(failed(FailureReason::ChecksFailing, &metadata))
        }
        StatusState::Success => match github.pull_request(metadata.number()).await {
            Ok(fresh) if fresh.merge_state == MergeableState::Clean => {
                emitter.event(Event::RetryIntegration(fresh))
            }
            Ok(fresh) => emitter.event(Event::IntegrationDidChangeStatus(
                IntegrationUpdate::Failed(FailureReason::Blocked),
                fresh,
            )),
            Err(e) => {
                warn!("Failed to refresh pull request: {}", e);
                emitter.event(failed(FailureReason::CheckingCommitChecksFailed, &metadata));
            }
        },
    }
}

/// The host has not computed mergeability yet; poll a few times before giving
/// up.
async fn resolve_unknown<G>(github: &G, metadata: PullRequestMetadata, emitter: &Emitter)
where
    G: GithubClient + Send + Sync,
{
    for attempt in 1..=UNKNOWN_STATE_RETRIES {
        sleep(UNKNOWN_STATE_RETRY_DELAY).await;
        match github.pull_request(metadata.number()).await {
            Ok(fresh) if fresh.merge_state != MergeableState::Unknown => {
                emitter.event(Event::RetryIntegration(fresh));
                return;
            }
            Ok(_) => debug!(
                "Mergeability of #{} still unknown (attempt {})",
                metadata.number(),
                attempt
            ),
            Err(e) => debug!(
                "Failed to refresh pull request #{} (attempt {}): {}",
                metadata.number(),
                attempt,
                e
            ),
        }
    }
    emitter.event(Event::IntegrationDidChangeStatus(
        IntegrationUpdate::Failed(FailureReason::Unknown),
        metadata,
    ));
}

/// Waits for the source branch's checks to settle, debouncing bursts of
/// freshly appearing contexts, bounded by the configured timeout.
async fn run_status_checks<G>(
    github: Arc<G>,
    config: Arc<ServiceConfig>,
    target_branch: String,
    metadata: PullRequestMetadata,
    emitter: Emitter,
    mut events: broadcast::Receiver<StatusEvent>,
) where
    G: GithubClient + Send + Sync,
{
    let source = metadata.reference.source.name.clone();
    let deadline = sleep(config.status_checks_timeout);
    tokio::pin!(deadline);

    loop {
        // Wait for the first settled check on our branch.
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    emitter.event(Event::StatusChecksDidComplete(
                        ChecksOutcome::TimedOut,
                        metadata.clone(),
                    ));
                    return;
                }
                received = events.recv() => match received {
                    Ok(event) if event.state != StatusState::Pending
                        && event.is_relative(&source) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }

        // Grace window: another settled check re-arms it.
        let grace = sleep(STATUS_CHECKS_GRACE_PERIOD);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    emitter.event(Event::StatusChecksDidComplete(
                        ChecksOutcome::TimedOut,
                        metadata.clone(),
                    ));
                    return;
                }
                _ = &mut grace => break,
                received = events.recv() => match received {
                    Ok(event) if event.state != StatusState::Pending
                        && event.is_relative(&source) =>
                    {
                        grace.as_mut().reset(Instant::now() + STATUS_CHECKS_GRACE_PERIOD);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }

        match evaluate_status_checks(&*github, &config, &target_branch, &metadata).await {
            Ok((fresh, StatusState::Success)) => {
                emitter.event(Event::StatusChecksDidComplete(ChecksOutcome::Passed, fresh));
                return;
            }
            Ok((fresh, StatusState::Failure)) => {
                emitter.event(Event::StatusChecksDidComplete(ChecksOutcome::Failed, fresh));
                return;
            }
            Ok((_, StatusState::Pending)) => continue,
            Err(e) => {
                warn!("Failed to evaluate status checks for #{}: {}", metadata.number(), e);
                continue;
            }
        }
    }
}

async fn evaluate_status_checks<G>(
    github: &G,
    config: &ServiceConfig,
    target_branch: &str,
    metadata: &PullRequestMetadata,
) -> client::Result<(PullRequestMetadata, StatusState)>
where
    G: GithubClient + Send + Sync,
{
    let fresh = github.pull_request(metadata.number()).await?;
    let commit = github
        .commit_status(&metadata.reference.source.name)
        .await?;
    if config.requires_all_status_checks {
        return Ok((fresh, commit.state));
    }
    let required = match github.required_status_checks(target_branch).await {
        Ok(required) => required,
        Err(e) if e.not_found() => RequiredStatusChecks::default(),
        Err(e) => return Err(e),
    };
    let aggregate = combined_state(required.contexts.iter().map(|context| {
        commit
            .statuses
            .iter()
            .find(|status| &status.context == context)
            .map(|status| status.state)
            .unwrap_or(StatusState::Pending)
    }));
    Ok((fresh, aggregate))
}

/// Tells the author why the integration was abandoned and drops the label so
/// the pull request leaves the queue for good. Both calls are best-effort.
async fn handle_failure<G>(
    github: Arc<G>,
    config: Arc<ServiceConfig>,
    metadata: PullRequestMetadata,
    reason: FailureReason,
    emitter: Emitter,
) where
    G: GithubClient + Send + Sync,
{
    let body = format!(
        "@{} unfortunately the integration failed with code: `{}`.",
        metadata.reference.author.login, reason
    );
    if let Err(e) = github.post_comment(&metadata.reference, &body).await {
        warn!(
            "Failed to post failure comment on #{}: {}",
            metadata.number(),
            e
        );
    }
    if let Err(e) = github
        .remove_label(&metadata.reference, &config.integration_label)
        .await
    {
        warn!(
            "Failed to remove label from #{}: {}",
            metadata.number(),
            e
        );
    }
    emitter.event(Event::IntegrationFailureHandled);
}
