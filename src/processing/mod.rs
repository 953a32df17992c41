pub mod dispatcher;
mod effects;
pub mod error;
pub mod events;
pub mod healthcheck;
pub mod reducer;
pub mod service;
pub mod state;
#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::{DispatchService, EventSources, LifecycleEvent};
pub use error::Error;
pub use events::{classify, Change, ChecksOutcome, Event, IntegrationUpdate};
pub use healthcheck::{HealthStatus, Healthcheck, UnhealthyReason};
pub use reducer::reduce;
pub use service::{MergeService, ServiceConfig, StateTransition};
pub use state::{FailureReason, State, Status};
