mod cli;
mod commands;
mod config;
mod error;

use std::process;

use clap::Parser;
use courier_client::{ApiClient, ClientEvent, Credential};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    commands::{CommandExecutor, RequestOptions},
    config::AppConfig,
    error::Result,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        if e.requires_relogin() {
            eprintln!("Your session has expired. Run `courier login` to sign in again.");
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    // Commands that never touch the network
    match &args.command {
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Args::command();
            let bin_name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
            return Ok(());
        }
        Commands::Config { show, reset } => {
            if *reset {
                AppConfig::reset(args.config.as_deref())?;
                println!("✓ Configuration reset to defaults");
            } else if *show {
                let config = AppConfig::load(args.config.as_deref())?;
                println!("{}", config.show()?);
            } else {
                println!(
                    "Use --show to display current configuration or --reset to reset to defaults"
                );
            }
            return Ok(());
        }
        _ => {}
    }

    let stored = AppConfig::load(args.config.as_deref())?;
    let mut effective = stored.clone();
    if let Some(base_url) = &args.base_url {
        effective.base_url = base_url.clone();
    }
    if let Some(timeout) = args.timeout {
        effective.timeout_ms = timeout;
    }
    let tokens_from_args = args.access_token.is_some();
    if let Some(access_token) = &args.access_token {
        effective.session = Some(Credential::new(
            access_token.clone(),
            args.refresh_token.clone().unwrap_or_default(),
            args.token_type.clone(),
        ));
    }

    let client = ApiClient::new(effective.to_client_config()?)?;
    if let Some(credential) = &effective.session {
        client.session().set_credential(credential.clone());
    }
    let notices = tokio::spawn(report_events(client.subscribe()));
    let executor = CommandExecutor::new(client.clone());

    let outcome = tokio::select! {
        outcome = execute(&executor, args.command) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling outstanding requests");
            client.shutdown();
            Ok(())
        }
    };

    // Keep refreshed or cleared credentials for the next invocation
    let current = client.session().current_credential();
    if !tokens_from_args && current != stored.session {
        let mut updated = stored;
        updated.session = current;
        updated.save(args.config.as_deref())?;
        info!("Stored session updated");
    }

    notices.abort();
    outcome
}

async fn execute(executor: &CommandExecutor, command: Commands) -> Result<()> {
    match command {
        Commands::Request {
            method,
            path,
            query,
            json,
            form,
            file,
            blob,
        } => {
            let options = RequestOptions {
                method,
                path,
                query,
                json,
                form,
                files: file,
            };
            executor.request(options, blob.as_deref()).await?;
        }

        Commands::Stream {
            path,
            method,
            json,
            parse,
        } => {
            let options = RequestOptions {
                method,
                path,
                query: Vec::new(),
                json,
                form: Vec::new(),
                files: Vec::new(),
            };
            executor.stream(options, parse).await?;
        }

        Commands::Login { path, form } => {
            let credential = executor.login(&path, form).await?;
            println!("✓ Signed in ({} token)", credential.token_type);
        }

        Commands::Logout => {
            executor.client().sign_out();
            println!("✓ Signed out");
        }

        Commands::Config { .. } | Commands::Completions { .. } => {}
    }
    Ok(())
}

/// Surface client notices on the log while a command runs.
async fn report_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(event @ ClientEvent::SessionExpired { .. }) => warn!("{}", event.to_message()),
            Ok(event @ ClientEvent::RequestFailed { .. }) => warn!("{}", event.to_message()),
            Ok(event) => info!("{}", event.to_message()),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed client events"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}
