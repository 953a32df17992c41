use env_logger::Env;
use log::{debug, error, info};
use std::sync::Arc;
use structopt::StructOpt;
use tokio::sync::broadcast::error::RecvError;
use walle::config::WalleConfig;
use walle::github::DefaultGithubClient;
use walle::processing::{DispatchService, EventSources, LifecycleEvent};

#[derive(StructOpt, Debug)]
#[structopt(name = "walle", about = "Serializes pull request integration per target branch")]
struct Options {
    /// Path to the configuration file
    #[structopt(short, long, default_value = "~/.walle/config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let options = Options::from_args();

    let config = match WalleConfig::new(&options.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    let github = Arc::new(DefaultGithubClient::new(
        &config.github.owner,
        &config.github.repo,
        config.github.username.clone(),
        config.github.token.clone(),
    ));

    // The webhook receiver plugs host deliveries into these streams.
    let sources = EventSources::new();
    let dispatcher = match DispatchService::spawn(github, config.bot.clone().into(), &sources).await
    {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("Failed to bootstrap the dispatcher: {}", e);
            std::process::exit(1);
        }
    };
    info!("WallE is up, serializing integrations");

    let mut lifecycle = dispatcher.lifecycle();
    loop {
        match lifecycle.recv().await {
            Ok(LifecycleEvent::Created(service)) => {
                info!("Merge service created for `{}`", service.target_branch())
            }
            Ok(LifecycleEvent::StateChanged(service, transition)) => debug!(
                "Merge service for `{}` moved to {:?}",
                service.target_branch(),
                transition.current.status
            ),
            Ok(LifecycleEvent::Destroyed(service)) => {
                info!("Merge service for `{}` retired", service.target_branch())
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("Lifecycle stream lagged, skipped {}", skipped)
            }
            Err(RecvError::Closed) => break,
        }
    }
}
