//! Offline Regions CLI application
//!
//! Command-line interface for caching map regions offline: download regions
//! as resumable tile packs, inspect their storage, and explore the hex grid.

use std::process;

use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

// Import CLI modules through the library (module is public but not re-exported)
use offline_regions::cli::{
    handle_delete, handle_download, handle_estimate, handle_hex, handle_layers, handle_list,
    handle_serve, handle_stats, handle_status, Cli, Commands,
};
use offline_regions::config::AppConfig;
use offline_regions::errors::Result;

#[tokio::main]
async fn main() {
    // Initialize program
    let result = run().await;

    // Handle any errors that occurred
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok(); // Ignore errors if file doesn't exist

    // Parse command line arguments
    let cli = Cli::parse_args();

    let config = AppConfig::load(cli.global.config.clone()).await?;

    // Initialize logging based on verbosity and the configured level
    init_logging(&cli, &config.logging.level);

    info!("Offline Regions v{} starting", env!("CARGO_PKG_VERSION"));

    if cli.global.config.is_none() {
        if let Err(e) = AppConfig::initialize_first_run().await {
            warn!("Could not create default configuration: {}", e);
        }
    }

    let runtime = config.to_runtime_config(cli.global.data_dir.clone())?;
    info!("Using data directory {}", runtime.data_dir.display());

    // Execute the appropriate command
    match cli.command {
        Commands::Download(args) => {
            info!("Executing download command");
            handle_download(args, runtime).await
        }
        Commands::Status(args) => {
            info!("Executing status command");
            handle_status(args, runtime).await
        }
        Commands::Delete(args) => {
            info!("Executing delete command");
            handle_delete(args, runtime).await
        }
        Commands::Stats(args) => {
            info!("Executing stats command");
            handle_stats(args, runtime).await
        }
        Commands::List(args) => {
            info!("Executing list command");
            handle_list(args, runtime).await
        }
        Commands::Layers => handle_layers(&runtime),
        Commands::Hex(args) => handle_hex(args, runtime).await,
        Commands::Estimate(args) => handle_estimate(args),
        Commands::Serve(args) => {
            info!("Executing serve command");
            handle_serve(args, runtime).await
        }
    }
}

/// Initialize logging from CLI verbosity flags, falling back to the
/// configured level when no flag is given
fn init_logging(cli: &Cli, configured_level: &str) {
    let explicit = cli.global.quiet || cli.global.verbose || cli.global.very_verbose;
    let level = if explicit {
        cli.log_level().to_string().to_lowercase()
    } else {
        configured_level.to_string()
    };

    // Create environment filter
    let mut filter = EnvFilter::from_default_env();
    match format!("offline_regions={}", level).parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => eprintln!("Ignoring invalid log level '{}': {}", level, e),
    }

    // Initialize subscriber
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_level(cli.global.very_verbose) // Show levels only in very verbose mode
        .init();

    if cli.global.very_verbose {
        info!("Very verbose logging enabled");
    } else if cli.global.verbose {
        info!("Verbose logging enabled");
    }
}
