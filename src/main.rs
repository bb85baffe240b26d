use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> anyhow::Result<u8> {
    let cli = cardsmith::cli::Cli::parse();
    cardsmith::logging::init(cli.verbose).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    let cancel = CancellationToken::new();
    tokio::spawn(watch_interrupts(cancel.clone()));

    let mut console = cardsmith::review::TerminalReviewer::stdio();
    let status = match cli.command {
        cardsmith::cli::Command::Generate(args) => {
            let config = cardsmith::config::SessionConfig::from_args(&args).context("config")?;
            cardsmith::pipeline::run_generate(config, &mut console, cancel)
                .await
                .context("generate")?
        }
        cardsmith::cli::Command::Upload(args) => {
            let config = cardsmith::config::UploadConfig::from_args(&args).context("config")?;
            cardsmith::pipeline::run_upload(config, &mut console, cancel)
                .await
                .context("upload")?
        }
    };

    tracing::debug!(?status, "run finished");
    Ok(status.exit_code())
}

/// First Ctrl-C cancels outstanding work; a second one exits immediately.
async fn watch_interrupts(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::warn!("interrupt received; stopping outstanding work (press Ctrl-C again to quit)");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(130);
    }
}
