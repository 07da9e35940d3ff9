// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use ci_conductor_github::{GithubConnection, RestGithubApi};
use ci_conductor_scheduler::{
    load_daemon_config, InProcessExecutor, InstantMerger, NullStats, Scheduler, SchedulerHandle,
    SchedulerOptions, StaticNodeProvisioner,
};
use ci_conductor_source::SourceConnection;
use clap::{Arg, ArgAction, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A `main` function which supports `try!`.
async fn try_main() -> Result<(), Box<dyn Error>> {
    let matches = Command::new("ci-conductor")
        .version(clap::crate_version!())
        .about("Pipeline-driven CI gating scheduler")
        .arg(
            Arg::new("CONFIG")
                .short('c')
                .long("config")
                .help("Path to the daemon configuration")
                .default_value("/etc/ci-conductor/conductor.toml")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("VERBOSE")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let default_filter = if matches.get_flag("VERBOSE") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config_path = matches.get_one::<String>("CONFIG").unwrap();
    let config = load_daemon_config(config_path)?;

    let handle = SchedulerHandle::new();
    let mut connections: HashMap<String, Arc<dyn SourceConnection>> = HashMap::new();
    for connection_config in &config.connections {
        if connection_config.driver != "github" {
            return Err(format!(
                "connection '{}' names unknown driver '{}'",
                connection_config.name, connection_config.driver,
            )
            .into());
        }
        let api_root = connection_config
            .api_root
            .clone()
            .unwrap_or_else(|| "https://api.github.com".into());
        let api = Arc::new(RestGithubApi::new(
            api_root,
            connection_config.api_token.clone(),
        ));
        connections.insert(
            connection_config.name.clone(),
            Arc::new(GithubConnection::new(
                connection_config.name.clone(),
                connection_config.canonical_hostname.clone(),
                api,
            )),
        );
    }

    let merger = Arc::new(InstantMerger::new(handle.clone()));
    let executor = Arc::new(InProcessExecutor::new(handle.clone()));
    let nodepool = Arc::new(StaticNodeProvisioner::new(handle.clone()));

    let scheduler = Arc::new(Scheduler::new(
        SchedulerOptions::new(config.state_dir.clone(), config.tenant_config.clone()),
        handle,
        connections,
        merger,
        executor,
        nodepool,
        Arc::new(NullStats),
    )?);

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };
    scheduler.resume()?;
    scheduler.reconfigure().await?;
    info!("ci-conductor running");
    runner.await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        panic!("{:?}", err);
    }
}
