//! mego CLI entry point.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use mego_client::cli::{Cli, Command, ConfigAction};
use mego_client::commands;
use mego_client::config::Config;
use mego_client::{Client, ClientResult};
use mego_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = match cli.command {
        Command::Serve {
            json_logs: true, ..
        } => TracingConfig::engine(),
        _ => TracingConfig::from_verbosity(cli.verbose),
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("warning: failed to initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let mut config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(url) = cli.url {
        config.client.url = url;
    }
    if let Some(secs) = cli.timeout {
        config.client = config.client.with_timeout(Duration::from_secs(secs));
    }

    match cli.command {
        Command::Serve { listen, .. } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            commands::serve::run(config.server).await
        }
        Command::Call { method, params } => {
            let client = connect(&config).await?;
            commands::call::call(&client, &method, params.as_deref()).await
        }
        Command::Upload {
            method,
            path,
            field,
            chunked,
            chunk_size,
        } => {
            let client = connect(&config).await?;
            commands::call::upload(&client, &method, path, field.as_deref(), chunked, chunk_size)
                .await
        }
        Command::Listen { event, channel } => {
            let client = connect(&config).await?;
            commands::call::listen(&client, &event, &channel).await
        }
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}

async fn connect(config: &Config) -> ClientResult<Client> {
    let client = Client::with_config(config.client.clone());
    client.connect().await?;
    Ok(client)
}
