use super::effects::TaskGuard;
use super::error::Error;
use super::events::{classify, Change};
use super::service::{MergeService, ServiceConfig, StateTransition};
use super::state::Status;
use crate::github::{GithubClient, PullRequest, PullRequestAction, PullRequestMetadata, StatusEvent};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const CHANNEL_CAPACITY: usize = 256;

/// The multicast streams the surrounding system feeds host events into.
pub struct EventSources {
    pub pull_request_actions: broadcast::Sender<(PullRequestMetadata, PullRequestAction)>,
    pub status_events: broadcast::Sender<StatusEvent>,
}

impl EventSources {
    pub fn new() -> Self {
        let (pull_request_actions, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (status_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            pull_request_actions,
            status_events,
        }
    }
}

impl Default for EventSources {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub enum LifecycleEvent {
    Created(Arc<MergeService>),
    StateChanged(Arc<MergeService>, StateTransition),
    Destroyed(Arc<MergeService>),
}

enum DispatcherInput {
    PullRequestEvent(PullRequestMetadata, PullRequestAction),
    StatusEvent(StatusEvent),
    IdleExpired(String),
    Shutdown,
}

/// Multiplexes host events over per-branch merge services: creates them
/// lazily, routes events by target branch and retires services that stayed
/// idle for the configured delay.
pub struct DispatchService {
    mailbox: mpsc::UnboundedSender<DispatcherInput>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    registry: Arc<RwLock<HashMap<String, Arc<MergeService>>>>,
    task: JoinHandle<()>,
    _pumps: Vec<TaskGuard>,
}

impl DispatchService {
    /// Boots the dispatcher: fetches the currently labeled pull requests,
    /// spins up one merge service per target branch found and starts routing.
    pub async fn spawn<G>(
        github: Arc<G>,
        config: ServiceConfig,
        sources: &EventSources,
    ) -> Result<Self, Error>
    where
        G: GithubClient + Send + Sync + 'static,
    {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let registry = Arc::new(RwLock::new(HashMap::new()));
        let mut actor = DispatcherActor {
            github,
            config,
            services: HashMap::new(),
            lifecycle: lifecycle_tx.clone(),
            registry: registry.clone(),
            mailbox_tx: mailbox_tx.clone(),
        };
        actor.bootstrap().await?;

        let pumps = vec![
            TaskGuard(tokio::spawn(pump_pull_request_actions(
                sources.pull_request_actions.subscribe(),
                mailbox_tx.clone(),
            ))),
            TaskGuard(tokio::spawn(pump_status_events(
                sources.status_events.subscribe(),
                mailbox_tx.clone(),
            ))),
        ];
        let task = tokio::spawn(actor.run(mailbox_rx));
        Ok(Self {
            mailbox: mailbox_tx,
            lifecycle: lifecycle_tx,
            registry,
            task,
            _pumps: pumps,
        })
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn service(&self, target_branch: &str) -> Option<Arc<MergeService>> {
        self.registry.read().unwrap().get(target_branch).cloned()
    }

    pub fn shutdown(&self) {
        let _ = self.mailbox.send(DispatcherInput::Shutdown);
    }
}

impl Drop for DispatchService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ServiceEntry {
    service: Arc<MergeService>,
    _watcher: TaskGuard,
}

struct DispatcherActor<G> {
    github: Arc<G>,
    config: ServiceConfig,
    services: HashMap<String, ServiceEntry>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    registry: Arc<RwLock<HashMap<String, Arc<MergeService>>>>,
    mailbox_tx: mpsc::UnboundedSender<DispatcherInput>,
}

impl<G> DispatcherActor<G>
where
    G: GithubClient + Send + Sync + 'static,
{
    async fn bootstrap(&mut self) -> Result<(), Error> {
        let open = self.github.open_pull_requests().await?;
        let mut groups: HashMap<String, Vec<PullRequest>> = HashMap::new();
        for pull_request in open {
            if !pull_request.has_label(&self.config.integration_label) {
                continue;
            }
            groups
                .entry(pull_request.target.name.clone())
                .or_default()
                .push(pull_request);
        }
        for (branch, initial) in groups {
            info!(
                "Bootstrapping merge service for `{}` with {} pull request(s)",
                branch,
                initial.len()
            );
            self.create_service(branch, initial);
        }
        Ok(())
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<DispatcherInput>) {
        while let Some(input) = mailbox.recv().await {
            match input {
                DispatcherInput::PullRequestEvent(metadata, action) => {
                    self.route_pull_request(metadata, action)
                }
                DispatcherInput::StatusEvent(event) => {
                    // Fanned out; services not watching the source ref ignore it.
                    for entry in self.services.values() {
                        entry.service.submit_status_event(event.clone());
                    }
                }
                DispatcherInput::IdleExpired(branch) => self.retire_if_idle(&branch),
                DispatcherInput::Shutdown => break,
            }
        }
        for (_, entry) in self.services.drain() {
            entry.service.shutdown();
        }
    }

    fn route_pull_request(&mut self, metadata: PullRequestMetadata, action: PullRequestAction) {
        let branch = metadata.reference.target.name.clone();
        if let Some(entry) = self.services.get(&branch) {
            entry.service.submit_pull_request_change(metadata, action);
            return;
        }
        let includes = matches!(
            classify(&self.config.integration_label, &metadata, action),
            Some(Change::Include(_))
        );
        if !includes {
            debug!("Dropping event for unmanaged branch `{}`", branch);
            return;
        }
        let service = self.create_service(branch, Vec::new());
        service.submit_pull_request_change(metadata, action);
    }

    fn create_service(&mut self, branch: String, initial: Vec<PullRequest>) -> Arc<MergeService> {
        let service = Arc::new(MergeService::spawn(
            self.github.clone(),
            self.config.clone(),
            branch.clone(),
            initial,
        ));
        let transitions = service.transitions();
        let watcher = TaskGuard(tokio::spawn(watch_service(
            service.clone(),
            transitions,
            self.config.idle_merge_service_cleanup_delay,
            self.lifecycle.clone(),
            self.mailbox_tx.clone(),
        )));
        self.registry
            .write()
            .unwrap()
            .insert(branch.clone(), service.clone());
        self.services.insert(
            branch,
            ServiceEntry {
                service: service.clone(),
                _watcher: watcher,
            },
        );
        let _ = self.lifecycle.send(LifecycleEvent::Created(service.clone()));
        service
    }

    fn retire_if_idle(&mut self, branch: &str) {
        let still_idle = self
            .services
            .get(branch)
            .map(|entry| entry.service.state().status == Status::Idle)
            .unwrap_or(false);
        if !still_idle {
            return;
        }
        if let Some(entry) = self.services.remove(branch) {
            self.registry.write().unwrap().remove(branch);
            entry.service.shutdown();
            info!("Retired idle merge service for `{}`", branch);
            let _ = self.lifecycle.send(LifecycleEvent::Destroyed(entry.service));
        }
    }
}

/// Forwards a service's transitions to the lifecycle stream and reports when
/// it has sat idle for the whole cleanup delay.
async fn watch_service(
    service: Arc<MergeService>,
    mut transitions: broadcast::Receiver<StateTransition>,
    idle_delay: Duration,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    dispatcher: mpsc::UnboundedSender<DispatcherInput>,
) {
    loop {
        let idle = service.state().status == Status::Idle;
        let received = if idle {
            tokio::select! {
                _ = sleep(idle_delay) => {
                    let _ = dispatcher.send(DispatcherInput::IdleExpired(
                        service.target_branch().to_string(),
                    ));
                    // The dispatcher re-checks; keep watching in case the
                    // service got busy again in between.
                    match transitions.recv().await {
                        Ok(transition) => Ok(transition),
                        other => other,
                    }
                }
                received = transitions.recv() => received,
            }
        } else {
            transitions.recv().await
        };
        match received {
            Ok(transition) => {
                let _ = lifecycle.send(LifecycleEvent::StateChanged(
                    service.clone(),
                    transition,
                ));
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn pump_pull_request_actions(
    mut source: broadcast::Receiver<(PullRequestMetadata, PullRequestAction)>,
    mailbox: mpsc::UnboundedSender<DispatcherInput>,
) {
    loop {
        match source.recv().await {
            Ok((metadata, action)) => {
                if mailbox
                    .send(DispatcherInput::PullRequestEvent(metadata, action))
                    .is_err()
                {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Pull request event stream lagged, skipped {}", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn pump_status_events(
    mut source: broadcast::Receiver<StatusEvent>,
    mailbox: mpsc::UnboundedSender<DispatcherInput>,
) {
    loop {
        match source.recv().await {
            Ok(event) => {
                if mailbox.send(DispatcherInput::StatusEvent(event)).is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Status event stream lagged, skipped {}", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
