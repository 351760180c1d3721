use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::signal;
use tracing::info;

use crate::cli::{Args, Commands};
use crate::config::Config;
use crate::connector::Connector;
use crate::peers::Peers;
use crate::{control, logging};

pub async fn execute(args: Args) -> Result<()> {
    setup_logging(&args)?;

    match args.command {
        Commands::Start {
            bind,
            max_clients,
            passthrough,
            proxy,
            accept,
        } => {
            start(args.config, bind, max_clients, passthrough, proxy, accept).await
        }
        Commands::Config { file, show } => validate_config(file, show),
        Commands::Init { output, force } => init_config(output, force),
    }
}

fn setup_logging(args: &Args) -> Result<()> {
    let level = match args.verbose {
        0 => args.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    logging::init(level, args.log_format == "json")
}

async fn start(
    config: Option<PathBuf>,
    bind: Vec<String>,
    max_clients: Option<usize>,
    passthrough: bool,
    proxy: bool,
    accept: bool,
) -> Result<()> {
    let mut config = match config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if !bind.is_empty() {
        config.server.urls = bind;
    }
    if let Some(max_clients) = max_clients {
        config.server.max_clients = max_clients;
    }
    if passthrough {
        config.passthrough = true;
    }
    if proxy {
        config.proxy = true;
    }
    config.validate()?;

    info!("{} connector starting", config.name);

    let config = Arc::new(config);
    let peers = Peers::unix(&config)?;
    let connector = Connector::bind(Arc::clone(&config), peers).await?;
    connector.spawn_io();

    info!("connector listening on {:?}", connector.local_addrs());

    if accept {
        connector.set_accepting(true);
    }

    let endpoint = control::bind(&config.sockets.control_path())?;
    tokio::select! {
        result = control::run(Arc::clone(&connector), endpoint) => result?,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
            connector.begin_shutdown();
        }
    }

    info!("{} connector shut down", config.name);
    Ok(())
}

fn validate_config(file: PathBuf, show: bool) -> Result<()> {
    let config = Config::load_from_file(&file)?;
    config.validate()?;
    info!("configuration {} is valid", file.display());

    if show {
        println!("{config:#?}");
    }
    Ok(())
}

fn init_config(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", output.display());
    }
    std::fs::write(&output, Config::example())?;
    info!("wrote example configuration to {}", output.display());
    Ok(())
}
