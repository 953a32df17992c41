use super::effects::{self, EffectContext, EffectKey, TaskGuard};
use super::events::{classify, Event};
use super::healthcheck::Healthcheck;
use super::reducer::reduce;
use super::state::{State, Status};
use crate::github::{GithubClient, PullRequest, PullRequestAction, PullRequestMetadata, StatusEvent};
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;

/// Per-service knobs, shared by every merge service the dispatcher creates.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub integration_label: String,
    pub top_priority_labels: Vec<String>,
    pub requires_all_status_checks: bool,
    pub status_checks_timeout: Duration,
    pub idle_merge_service_cleanup_delay: Duration,
    pub bot_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub previous: State,
    pub current: State,
}

pub(crate) enum Input {
    PullRequestDidChange(PullRequestMetadata, PullRequestAction),
    StatusEvent(StatusEvent),
    Event(Event),
    Shutdown,
}

/// Hands effect handlers a way to feed events back without a reference to the
/// service itself.
#[derive(Clone)]
pub(crate) struct Emitter {
    sender: mpsc::UnboundedSender<Input>,
}

impl Emitter {
    pub(crate) fn event(&self, event: Event) {
        let _ = self.sender.send(Input::Event(event));
    }
}

/// Owns the merge queue and state machine for one target branch.
///
/// All reductions happen on a single task fed by a mailbox, so events are
/// folded in strictly in submission order; effect handlers run on their own
/// tasks and feed their results back through the same mailbox.
pub struct MergeService {
    target_branch: String,
    mailbox: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<State>,
    transitions: broadcast::Sender<StateTransition>,
    healthcheck: Healthcheck,
    task: JoinHandle<()>,
}

impl MergeService {
    pub fn spawn<G>(
        github: Arc<G>,
        config: ServiceConfig,
        target_branch: String,
        initial_pull_requests: Vec<PullRequest>,
    ) -> Self
    where
        G: GithubClient + Send + Sync + 'static,
    {
        let config = Arc::new(config);
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let mut state = State::new(target_branch.clone());
        // A service created on the fly has no history to reorder; only a
        // bootstrap service goes through the starting status.
        if initial_pull_requests.is_empty() {
            state.status = Status::Idle;
        }
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (transitions_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (pull_request_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (status_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let healthcheck =
            Healthcheck::spawn(config.status_checks_timeout, transitions_tx.subscribe());
        let actor = ServiceActor {
            github,
            config,
            state,
            mailbox: mailbox_rx,
            emitter: Emitter {
                sender: mailbox_tx.clone(),
            },
            state_tx,
            transitions: transitions_tx.clone(),
            pull_request_events,
            status_events,
            initial_pull_requests,
            effect_key: EffectKey::None,
            effect: None,
            comment_tasks: Vec::new(),
        };
        let task = tokio::spawn(actor.run());
        Self {
            target_branch,
            mailbox: mailbox_tx,
            state: state_rx,
            transitions: transitions_tx,
            healthcheck,
            task,
        }
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    /// Current state plus a change signal; the received value is always the
    /// freshest one.
    pub fn state_changes(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    /// Every (previous, current) pair, in reduction order.
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub fn healthcheck(&self) -> &Healthcheck {
        &self.healthcheck
    }

    pub fn submit_pull_request_change(
        &self,
        metadata: PullRequestMetadata,
        action: PullRequestAction,
    ) {
        let _ = self
            .mailbox
            .send(Input::PullRequestDidChange(metadata, action));
    }

    pub fn submit_status_event(&self, event: StatusEvent) {
        let _ = self.mailbox.send(Input::StatusEvent(event));
    }

    /// Stops the service and aborts every pending effect. Events submitted
    /// afterwards are dropped.
    pub fn shutdown(&self) {
        let _ = self.mailbox.send(Input::Shutdown);
        self.task.abort();
        self.healthcheck.shutdown();
    }
}

impl Drop for MergeService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ServiceActor<G> {
    github: Arc<G>,
    config: Arc<ServiceConfig>,
    state: State,
    mailbox: mpsc::UnboundedReceiver<Input>,
    emitter: Emitter,
    state_tx: watch::Sender<State>,
    transitions: broadcast::Sender<StateTransition>,
    pull_request_events: broadcast::Sender<(PullRequestMetadata, PullRequestAction)>,
    status_events: broadcast::Sender<StatusEvent>,
    initial_pull_requests: Vec<PullRequest>,
    effect_key: EffectKey,
    effect: Option<TaskGuard>,
    comment_tasks: Vec<TaskGuard>,
}

impl<G> ServiceActor<G>
where
    G: GithubClient + Send + Sync + 'static,
{
    async fn run(mut self) {
        self.refresh_effect();
        while let Some(input) = self.mailbox.recv().await {
            match input {
                Input::PullRequestDidChange(metadata, action) => {
                    let _ = self.pull_request_events.send((metadata.clone(), action));
                    if let Some(change) =
                        classify(&self.config.integration_label, &metadata, action)
                    {
                        self.apply(Event::PullRequestDidChange(change));
                    }
                }
                Input::StatusEvent(event) => {
                    let _ = self.status_events.send(event);
                }
                Input::Event(event) => self.apply(event),
                Input::Shutdown => break,
            }
            self.comment_tasks.retain(|task| !task.0.is_finished());
        }
    }

    fn apply(&mut self, event: Event) {
        let previous = self.state.clone();
        let current = reduce(&self.config.top_priority_labels, previous.clone(), event);
        if current == previous {
            return;
        }
        self.state = current.clone();
        self.post_acceptance_comments(&previous, &current);
        self.refresh_effect();
        let _ = self.state_tx.send(current.clone());
        let _ = self.transitions.send(StateTransition { previous, current });
    }

    fn refresh_effect(&mut self) {
        let key = effects::key_for(&self.state);
        if key == self.effect_key {
            return;
        }
        self.effect_key = key;
        let context = EffectContext {
            github: self.github.clone(),
            config: self.config.clone(),
            emitter: self.emitter.clone(),
            initial_pull_requests: self.initial_pull_requests.clone(),
            pull_request_events: self.pull_request_events.clone(),
            status_events: self.status_events.clone(),
        };
        self.effect = effects::spawn(&context, &self.state);
    }

    /// Welcomes every pull request that just entered the queue. Comment
    /// failures are logged and forgotten.
    fn post_acceptance_comments(&mut self, previous: &State, current: &State) {
        let rebooted = matches!(previous.status, Status::Starting);
        let integration_in_progress = current.status.is_integrating();
        for (index, pull_request) in current.queue.iter().enumerate() {
            if previous.position_of(pull_request.number).is_some() {
                continue;
            }
            let body = effects::acceptance_comment(
                index,
                &current.target_branch,
                integration_in_progress,
                rebooted,
            );
            let github = self.github.clone();
            let pull_request = pull_request.clone();
            self.comment_tasks.push(TaskGuard(tokio::spawn(async move {
                if let Err(e) = github.post_comment(&pull_request, &body).await {
                    warn!(
                        "Failed to post acceptance comment on #{}: {}",
                        pull_request.number, e
                    );
                }
            })));
        }
    }
}
