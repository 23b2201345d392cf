// Local-first chat client for hosted LLM providers

// Declare the modules
pub mod api;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod live;
pub mod models;
pub mod registry;
pub mod session;
pub mod settings;
pub mod state;
pub mod stats;
pub mod storage;
pub mod summary;

use clap::Parser;

pub use error::{ChatError, StorageError, SummaryError};
pub use session::{ChatSession, SessionStatus};
pub use state::AppState;
pub use storage::StorageManager;

/// Parses the command line, initialises logging and runs the command.
pub async fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    cli::run(cli).await
}
