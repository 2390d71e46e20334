use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;
mod config;
mod error;

use cli::{Cli, Commands};
use config::{load_config, merge_config};
use error::{CliResult, to_exit_code};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = if cli.verbose {
        "nsbroker=debug,nsbroker_cli=debug"
    } else {
        "nsbroker=warn,nsbroker_cli=info"
    };
    // stdout may carry the protocol (serve --stdio), so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let result = smol::block_on(async_main(cli));
    to_exit_code(result)
}

async fn async_main(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Serve(args) => {
            let file_config = load_config(cli.config.as_deref())?;
            let config = merge_config(file_config, &args)?;
            commands::serve::execute(config).await
        }
        Commands::Exec(args) => commands::client::exec(args).await,
        Commands::Eval(args) => commands::client::eval(args).await,
        Commands::Submit(args) => commands::client::submit(args).await,
        Commands::Read(args) => commands::client::read(args).await,
        Commands::Poll(args) => commands::client::poll(args).await,
        Commands::Ls(args) => commands::client::ls(args).await,
        Commands::Drop(args) => commands::client::drop(args).await,
        Commands::Unlock(args) => commands::client::unlock(args).await,
        Commands::Kill(args) => commands::client::kill(args).await,
    }
}
