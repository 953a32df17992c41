use super::events::{Change, ChecksOutcome, Event, IntegrationUpdate};
use super::state::{FailureReason, State, Status};

/// Folds one event into the state. Total: events that make no sense for the
/// current status leave the state untouched.
pub fn reduce(top_priority_labels: &[String], mut state: State, event: Event) -> State {
    let status = state.status.clone();
    match (status, event) {
        (Status::Starting, Event::PullRequestsLoaded(loaded)) => {
            let raced_in = std::mem::take(&mut state.queue);
            for pull_request in loaded {
                state.enqueue(pull_request, top_priority_labels);
            }
            for pull_request in raced_in {
                if state.position_of(pull_request.number).is_none() {
                    state.enqueue(pull_request, top_priority_labels);
                }
            }
            state.status = if state.queue.is_empty() {
                Status::Idle
            } else {
                Status::Ready
            };
            state
        }
        (Status::Ready, Event::NoMorePullRequests) if state.queue.is_empty() => {
            state.status = Status::Idle;
            state
        }
        (Status::Ready, Event::Integrate(metadata)) => {
            // A racing exclusion may have emptied the slot; the queue change
            // already re-armed the head driver, so a stale integrate is noise.
            if state.remove(metadata.number()).is_some() {
                state.status = Status::Integrating { metadata };
            }
            state
        }
        (Status::Integrating { metadata }, Event::IntegrationDidChangeStatus(update, fresh))
            if metadata.number() == fresh.number() =>
        {
            state.status = match update {
                IntegrationUpdate::Updating => Status::RunningStatusChecks { metadata: fresh },
                IntegrationUpdate::Done => Status::Ready,
                IntegrationUpdate::Failed(reason) => Status::IntegrationFailed {
                    metadata: fresh,
                    error: reason,
                },
            };
            state
        }
        (Status::Integrating { metadata }, Event::RetryIntegration(fresh))
            if metadata.number() == fresh.number() =>
        {
            state.status = Status::Integrating { metadata: fresh };
            state
        }
        (Status::RunningStatusChecks { metadata }, Event::StatusChecksDidComplete(outcome, fresh))
            if metadata.number() == fresh.number() =>
        {
            state.status = match outcome {
                ChecksOutcome::Passed => Status::Integrating { metadata: fresh },
                ChecksOutcome::Failed => Status::IntegrationFailed {
                    metadata: fresh,
                    error: FailureReason::ChecksFailing,
                },
                ChecksOutcome::TimedOut => Status::IntegrationFailed {
                    metadata: fresh,
                    error: FailureReason::TimedOut,
                },
            };
            state
        }
        (Status::IntegrationFailed { .. }, Event::IntegrationFailureHandled) => {
            state.status = Status::Ready;
            state
        }
        (_, Event::PullRequestDidChange(change)) => apply_change(top_priority_labels, state, change),
        _ => state,
    }
}

fn apply_change(top_priority_labels: &[String], mut state: State, change: Change) -> State {
    match change {
        Change::Include(metadata) => {
            let in_flight = state
                .status
                .in_flight()
                .map(|current| current.number())
                == Some(metadata.number());
            if in_flight {
                return state;
            }
            state.enqueue(metadata.reference, top_priority_labels);
            if matches!(state.status, Status::Idle) {
                state.status = Status::Ready;
            }
            state
        }
        Change::Exclude(pull_request) => {
            let in_flight = state
                .status
                .in_flight()
                .map(|current| current.number())
                == Some(pull_request.number);
            state.remove(pull_request.number);
            if in_flight {
                state.status = Status::Ready;
            }
            state
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{MergeableState, PullRequest};
    use crate::processing::test_support::{metadata, pull_request};

    const TOP: &str = "hotfix";

    fn top_priority_labels() -> Vec<String> {
        vec![TOP.to_string()]
    }

    fn starting() -> State {
        State::new("develop".into())
    }

    fn ready_with(queue: Vec<PullRequest>) -> State {
        let mut state = starting();
        state.status = Status::Ready;
        for pull_request in queue {
            state.enqueue(pull_request, &top_priority_labels());
        }
        state
    }

    fn step(state: State, event: Event) -> State {
        reduce(&top_priority_labels(), state, event)
    }

    fn include(number: u64, labels: &[&str]) -> Event {
        Event::PullRequestDidChange(Change::Include(metadata(
            number,
            labels,
            MergeableState::Clean,
        )))
    }

    fn exclude(number: u64) -> Event {
        Event::PullRequestDidChange(Change::Exclude(pull_request(number, &[])))
    }

    #[test]
    fn loading_nothing_goes_idle() {
        let state = step(starting(), Event::PullRequestsLoaded(vec![]));
        assert_eq!(state.status, Status::Idle);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn loading_pull_requests_goes_ready_in_order() {
        let loaded = vec![
            pull_request(3, &["merge"]),
            pull_request(1, &["merge"]),
            pull_request(2, &["merge", TOP]),
        ];
        let state = step(starting(), Event::PullRequestsLoaded(loaded));
        assert_eq!(state.status, Status::Ready);
        let numbers: Vec<_> = state.queue.iter().map(|pr| pr.number).collect();
        assert_eq!(numbers, vec![2, 3, 1]);
    }

    #[test]
    fn loading_keeps_pull_requests_that_raced_in_during_bootstrap() {
        let state = step(starting(), include(9, &["merge"]));
        assert_eq!(state.status, Status::Starting);
        let state = step(state, Event::PullRequestsLoaded(vec![pull_request(1, &["merge"])]));
        assert_eq!(state.status, Status::Ready);
        let numbers: Vec<_> = state.queue.iter().map(|pr| pr.number).collect();
        assert_eq!(numbers, vec![1, 9]);
    }

    #[test]
    fn including_while_idle_wakes_the_machine() {
        let mut idle = starting();
        idle.status = Status::Idle;
        let state = step(idle, include(1, &["merge"]));
        assert_eq!(state.status, Status::Ready);
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn no_more_pull_requests_only_applies_to_an_empty_queue() {
        let state = step(ready_with(vec![]), Event::NoMorePullRequests);
        assert_eq!(state.status, Status::Idle);

        let state = step(
            ready_with(vec![pull_request(1, &["merge"])]),
            Event::NoMorePullRequests,
        );
        assert_eq!(state.status, Status::Ready);
    }

    #[test]
    fn integrating_pops_the_pull_request_from_the_queue() {
        let meta = metadata(1, &["merge"], MergeableState::Clean);
        let state = step(
            ready_with(vec![pull_request(1, &["merge"]), pull_request(2, &["merge"])]),
            Event::Integrate(meta.clone()),
        );
        assert_eq!(state.status, Status::Integrating { metadata: meta });
        assert_eq!(state.position_of(1), None);
        assert_eq!(state.position_of(2), Some(0));
    }

    #[test]
    fn integrating_an_already_excluded_pull_request_is_a_no_op() {
        let state = step(
            ready_with(vec![pull_request(2, &["merge"])]),
            Event::Integrate(metadata(1, &["merge"], MergeableState::Clean)),
        );
        assert_eq!(state.status, Status::Ready);
    }

    #[test]
    fn integration_status_updates_move_the_machine() {
        let meta = metadata(1, &["merge"], MergeableState::Behind);
        let mut state = ready_with(vec![]);
        state.status = Status::Integrating {
            metadata: meta.clone(),
        };

        let updating = step(
            state.clone(),
            Event::IntegrationDidChangeStatus(IntegrationUpdate::Updating, meta.clone()),
        );
        assert_eq!(
            updating.status,
            Status::RunningStatusChecks {
                metadata: meta.clone()
            }
        );

        let done = step(
            state.clone(),
            Event::IntegrationDidChangeStatus(IntegrationUpdate::Done, meta.clone()),
        );
        assert_eq!(done.status, Status::Ready);

        let failed = step(
            state,
            Event::IntegrationDidChangeStatus(
                IntegrationUpdate::Failed(FailureReason::Conflicts),
                meta.clone(),
            ),
        );
        assert_eq!(
            failed.status,
            Status::IntegrationFailed {
                metadata: meta,
                error: FailureReason::Conflicts
            }
        );
    }

    #[test]
    fn stale_integration_updates_for_another_pull_request_are_ignored() {
        let meta = metadata(1, &["merge"], MergeableState::Clean);
        let mut state = ready_with(vec![]);
        state.status = Status::Integrating {
            metadata: meta.clone(),
        };
        let unchanged = step(
            state.clone(),
            Event::IntegrationDidChangeStatus(
                IntegrationUpdate::Done,
                metadata(2, &["merge"], MergeableState::Clean),
            ),
        );
        assert_eq!(unchanged, state);
    }

    #[test]
    fn status_check_outcomes_resolve_the_wait() {
        let meta = metadata(1, &["merge"], MergeableState::Blocked);
        let mut state = ready_with(vec![]);
        state.status = Status::RunningStatusChecks {
            metadata: meta.clone(),
        };

        let passed = step(
            state.clone(),
            Event::StatusChecksDidComplete(ChecksOutcome::Passed, meta.clone()),
        );
        assert_eq!(
            passed.status,
            Status::Integrating {
                metadata: meta.clone()
            }
        );

        let failed = step(
            state.clone(),
            Event::StatusChecksDidComplete(ChecksOutcome::Failed, meta.clone()),
        );
        assert_eq!(
            failed.status,
            Status::IntegrationFailed {
                metadata: meta.clone(),
                error: FailureReason::ChecksFailing
            }
        );

        let timed_out = step(
            state,
            Event::StatusChecksDidComplete(ChecksOutcome::TimedOut, meta.clone()),
        );
        assert_eq!(
            timed_out.status,
            Status::IntegrationFailed {
                metadata: meta,
                error: FailureReason::TimedOut
            }
        );
    }

    #[test]
    fn excluding_the_in_flight_pull_request_returns_to_ready() {
        let meta = metadata(1, &["merge"], MergeableState::Clean);
        for status in [
            Status::Integrating {
                metadata: meta.clone(),
            },
            Status::RunningStatusChecks {
                metadata: meta.clone(),
            },
        ] {
            let mut state = ready_with(vec![pull_request(2, &["merge"])]);
            state.status = status;
            let state = step(state, exclude(1));
            assert_eq!(state.status, Status::Ready);
            // Not re-enqueued.
            assert_eq!(state.position_of(1), None);
            assert_eq!(state.position_of(2), Some(0));
        }
    }

    #[test]
    fn excluding_a_queued_pull_request_is_a_pure_queue_operation() {
        let meta = metadata(1, &["merge"], MergeableState::Clean);
        let mut state = ready_with(vec![pull_request(2, &["merge"])]);
        state.status = Status::Integrating {
            metadata: meta.clone(),
        };
        let state = step(state, exclude(2));
        assert_eq!(state.status, Status::Integrating { metadata: meta });
        assert!(state.queue.is_empty());
    }

    #[test]
    fn including_the_in_flight_pull_request_does_not_requeue_it() {
        let meta = metadata(1, &["merge"], MergeableState::Clean);
        let mut state = ready_with(vec![]);
        state.status = Status::Integrating {
            metadata: meta.clone(),
        };
        let state = step(state, include(1, &["merge"]));
        assert_eq!(state.position_of(1), None);
        assert_eq!(state.status, Status::Integrating { metadata: meta });
    }

    #[test]
    fn balanced_include_exclude_pairs_leave_the_queue_unchanged() {
        let initial = ready_with(vec![pull_request(5, &["merge"])]);
        let state = step(initial.clone(), include(1, &["merge"]));
        let state = step(state, exclude(1));
        assert_eq!(state, initial);
    }

    #[test]
    fn handled_failure_resumes_the_queue() {
        let mut state = ready_with(vec![pull_request(2, &["merge"])]);
        state.status = Status::IntegrationFailed {
            metadata: metadata(1, &["merge"], MergeableState::Dirty),
            error: FailureReason::Conflicts,
        };
        let state = step(state, Event::IntegrationFailureHandled);
        assert_eq!(state.status, Status::Ready);
        assert_eq!(state.position_of(1), None);
    }

    // Pseudo-random event sequences; the reducer must uphold its structural
    // invariants at every step.
    mod generated {
        use super::*;

        struct Lcg(u64);

        impl Lcg {
            fn next(&mut self) -> u64 {
                self.0 = self
                    .0
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                self.0 >> 33
            }

            fn pick(&mut self, bound: u64) -> u64 {
                self.next() % bound
            }
        }

        fn random_event(rng: &mut Lcg) -> Event {
            let number = rng.pick(6) + 1;
            let labels: &[&str] = if rng.pick(2) == 0 {
                &["merge"]
            } else {
                &["merge", TOP]
            };
            let meta = metadata(number, labels, MergeableState::Clean);
            match rng.pick(9) {
                0 => include(number, labels),
                1 => exclude(number),
                2 => Event::Integrate(meta),
                3 => Event::NoMorePullRequests,
                4 => Event::IntegrationDidChangeStatus(IntegrationUpdate::Updating, meta),
                5 => Event::IntegrationDidChangeStatus(IntegrationUpdate::Done, meta),
                6 => Event::StatusChecksDidComplete(ChecksOutcome::Passed, meta),
                7 => Event::IntegrationFailureHandled,
                _ => Event::PullRequestsLoaded(vec![
                    pull_request(number, labels),
                    pull_request(rng.pick(6) + 1, &["merge"]),
                ]),
            }
        }

        fn assert_invariants(state: &State) {
            // The in-flight pull request is never queued.
            if let Some(in_flight) = state.status.in_flight() {
                assert_eq!(state.position_of(in_flight.number()), None);
            }
            // No duplicates.
            for (index, pr) in state.queue.iter().enumerate() {
                assert_eq!(state.position_of(pr.number), Some(index));
            }
            // Two-tier partition: no top-priority entry after a normal one.
            let labels = top_priority_labels();
            let first_normal = state
                .queue
                .iter()
                .position(|pr| !pr.is_top_priority(&labels));
            if let Some(first_normal) = first_normal {
                assert!(state.queue[first_normal..]
                    .iter()
                    .all(|pr| !pr.is_top_priority(&labels)));
            }
        }

        #[test]
        fn invariants_hold_across_generated_sequences() {
            for seed in 0..32u64 {
                let mut rng = Lcg(seed.wrapping_mul(0x9e3779b97f4a7c15) + 1);
                let mut state = starting();
                for _ in 0..200 {
                    state = step(state, random_event(&mut rng));
                    assert_invariants(&state);
                }
            }
        }
    }
}
