pub mod client;
pub mod config;
pub mod github;
pub mod processing;

pub use processing::{DispatchService, MergeService};
