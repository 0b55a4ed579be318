// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::info;

use cerebro_console::cli::{
    handle_generate_config, handle_replay, handle_run, handle_validate, handle_version, load_config, Cli, Commands,
};
use cerebro_console::logging::init_logging;
use cerebro_console::{CONSOLE_FULL_NAME, CONSOLE_VERSION};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that need neither logging nor a loaded config
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!("📡 {} v{}", CONSOLE_FULL_NAME, CONSOLE_VERSION);

    match cli.command {
        Some(Commands::Replay { file, compact }) => {
            handle_replay(&config, &file, compact).with_context(|| format!("Replay of {} failed", file.display()))?;
        }
        Some(Commands::Run { url, interval }) => {
            handle_run(config, url, interval).await?;
        }
        _ => {
            handle_run(config, None, std::time::Duration::from_secs(10)).await?;
        }
    }

    Ok(())
}
