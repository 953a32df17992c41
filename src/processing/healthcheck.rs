use super::service::StateTransition;
use super::state::{State, Status};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Unhealthy(UnhealthyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhealthyReason {
    PotentialDeadlock,
}

/// Liveness derived from a merge service's transitions: sitting in any busy
/// status for longer than 1.5x the status-checks timeout looks wedged.
pub struct Healthcheck {
    status: watch::Receiver<HealthStatus>,
    task: JoinHandle<()>,
}

impl Healthcheck {
    pub(crate) fn spawn(
        status_checks_timeout: Duration,
        transitions: broadcast::Receiver<StateTransition>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(HealthStatus::Ok);
        let degrade_after = status_checks_timeout.mul_f64(1.5);
        let task = tokio::spawn(watch_transitions(degrade_after, transitions, status_tx));
        Self {
            status: status_rx,
            task,
        }
    }

    pub fn status(&self) -> HealthStatus {
        *self.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<HealthStatus> {
        self.status.clone()
    }

    pub(crate) fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Healthcheck {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn settled(state: &State) -> bool {
    matches!(state.status, Status::Starting | Status::Idle)
}

async fn watch_transitions(
    degrade_after: Duration,
    mut transitions: broadcast::Receiver<StateTransition>,
    status: watch::Sender<HealthStatus>,
) {
    let mut last_seen: Option<State> = None;
    loop {
        let transition = match transitions.recv().await {
            Ok(transition) => transition,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if last_seen.as_ref() == Some(&transition.current) {
            continue;
        }
        last_seen = Some(transition.current.clone());
        if settled(&transition.current) {
            let _ = status.send(HealthStatus::Ok);
            continue;
        }

        // Busy: degrade unless a settled state shows up in time. Every
        // distinct busy state re-arms the deadline (latest wins).
        let deadline = sleep(degrade_after);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let _ = status.send(HealthStatus::Unhealthy(UnhealthyReason::PotentialDeadlock));
                    break;
                }
                received = transitions.recv() => match received {
                    Ok(transition) => {
                        if last_seen.as_ref() == Some(&transition.current) {
                            continue;
                        }
                        last_seen = Some(transition.current.clone());
                        if settled(&transition.current) {
                            let _ = status.send(HealthStatus::Ok);
                            break;
                        }
                        deadline.as_mut().reset(Instant::now() + degrade_after);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}
