//! Command-line front end.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::commands;
use crate::events::AppEvent;
use crate::models::Message;
use crate::registry::Provider;
use crate::session::ChatSession;
use crate::settings::KeyStatus;
use crate::state::AppState;

/// How long the process waits for title requests after a reply ends.
const SUMMARY_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "chat0", version, about = "Chat with hosted LLMs using your own API keys")]
pub struct Cli {
    /// Config file (defaults to <config dir>/chat0/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List threads, most recently active first
    Threads,
    /// Print a thread's messages
    Show { thread: Uuid },
    /// Send a message and stream the reply
    Send {
        /// Continue this thread instead of starting a new one
        #[arg(short, long)]
        thread: Option<Uuid>,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Regenerate the last reply of a thread with another model
    Retry {
        thread: Uuid,
        /// Omit to list the suggested models
        model: Option<String>,
    },
    /// Rename a thread
    Rename { thread: Uuid, title: String },
    /// Delete a thread and its messages
    Delete { thread: Uuid },
    /// Search message content
    Search { query: String },
    /// List available models
    Models,
    /// Select the model used for new replies
    Select { model: String },
    /// Add or remove a model from favorites
    Favorite { model: String },
    /// Manage provider API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Manage custom OpenRouter model ids
    Custom {
        #[command(subcommand)]
        action: CustomAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum KeyAction {
    /// Show which providers have a key
    List,
    /// Store a key (an empty string removes it)
    Set { provider: Provider, key: String },
}

#[derive(Debug, Subcommand)]
pub enum CustomAction {
    Add { model: String },
    Remove { model: String },
}

pub async fn execute(state: &AppState, command: Command) -> Result<()> {
    match command {
        Command::Threads => {
            for thread in commands::list_threads(state).await? {
                println!(
                    "{}  {}  {}",
                    thread.id,
                    thread.last_message_at.format("%Y-%m-%d %H:%M"),
                    thread.title
                );
            }
        }
        Command::Show { thread } => {
            let view = commands::show_thread(state, thread).await?;
            println!("# {}", view.thread.title);
            for message in &view.messages {
                print_message(message);
            }
        }
        Command::Send { thread, text } => {
            let text = text.join(" ");
            let events = state.events.subscribe();
            let (session, message_id) = commands::send_message(state, thread, &text).await?;
            if message_id.is_none() {
                println!("Nothing to send.");
                return Ok(());
            }
            println!("thread {}", session.thread_id());
            stream_reply(&session, events).await?;
        }
        Command::Retry { thread, model: None } => {
            for model in commands::retry_candidates(state, thread).await? {
                println!("{:<28} {}", model.name, model.provider);
            }
        }
        Command::Retry {
            thread,
            model: Some(model),
        } => {
            let events = state.events.subscribe();
            let (session, reply_id) = commands::retry(state, thread, &model).await?;
            if reply_id.is_none() {
                println!("Nothing to retry.");
                return Ok(());
            }
            stream_reply(&session, events).await?;
        }
        Command::Rename { thread, title } => commands::rename_thread(state, thread, &title).await?,
        Command::Delete { thread } => commands::delete_thread(state, thread).await?,
        Command::Search { query } => {
            for message in commands::search(state, &query).await? {
                println!("{}  {}", message.thread_id, first_line(&message.content));
            }
        }
        Command::Models => {
            for listing in commands::list_models(state).await {
                let marker = match (listing.selected, listing.favorite) {
                    (true, _) => '>',
                    (false, true) => '*',
                    _ => ' ',
                };
                println!(
                    "{} {:<28} {:<11} ${:>7.3}/${:<8.3} {}{}",
                    marker,
                    listing.model.name,
                    listing.model.provider,
                    listing.model.input_price,
                    listing.model.output_price,
                    listing.model.category,
                    if listing.enabled { "" } else { "  (no key)" }
                );
            }
        }
        Command::Select { model } => {
            let model = commands::select_model(state, &model).await?;
            println!("Selected {} ({})", model.name, model.provider);
        }
        Command::Favorite { model } => {
            let favorite = commands::toggle_favorite(state, &model).await?;
            println!("{} {}", model, if favorite { "added to favorites" } else { "removed from favorites" });
        }
        Command::Keys { action: KeyAction::List } => {
            for key in commands::list_keys(state).await {
                println!("{:<11} {}", key.provider, if key.configured { "configured" } else { "-" });
            }
        }
        Command::Keys {
            action: KeyAction::Set { provider, key },
        } => match commands::set_key(state, provider, &key).await? {
            KeyStatus::Empty => println!("Removed {} key", provider),
            KeyStatus::Valid => println!("Saved {} key", provider),
            KeyStatus::Invalid => println!("Saved {} key (unexpected format)", provider),
        },
        Command::Custom {
            action: CustomAction::Add { model },
        } => {
            if !commands::add_custom_model(state, &model).await? {
                println!("{} is already listed", model);
            }
        }
        Command::Custom {
            action: CustomAction::Remove { model },
        } => {
            if !commands::remove_custom_model(state, &model).await? {
                println!("{} was not listed", model);
            }
        }
    }
    Ok(())
}

/// Prints the reply as it streams. Ctrl-C stops the reply instead of the process.
async fn stream_reply(session: &ChatSession, mut events: broadcast::Receiver<AppEvent>) -> Result<()> {
    let thread_id = session.thread_id();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        loop {
            match events.recv().await {
                Ok(AppEvent::Chunk {
                    thread_id: id, delta, ..
                }) if id == thread_id => {
                    let _ = write!(stdout, "{}", delta);
                    let _ = stdout.flush();
                }
                Ok(AppEvent::Notice { message }) => eprintln!("\n[{}]", message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Output skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = tokio::select! {
        reply = commands::wait_for_reply(session) => reply,
        _ = tokio::signal::ctrl_c() => {
            session.stop().await;
            println!("\n[stopped]");
            Ok(None)
        }
    };

    // Title requests outlive the reply; give them a chance before exiting.
    if !session.flush_summaries(SUMMARY_GRACE).await {
        eprintln!("[title request still pending; thread keeps its current title]");
    }
    printer.abort();
    println!();

    if let Some(stats) = outcome?.and_then(|m| m.stats) {
        println!(
            "[{} | {} tokens | {:.1} tok/s | ${:.6}]",
            stats.model, stats.tokens, stats.tokens_per_second, stats.cost
        );
    }
    Ok(())
}

fn print_message(message: &Message) {
    println!("\n[{}] {}", message.role, message.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(reasoning) = message.reasoning() {
        println!("(reasoning) {}", reasoning);
    }
    println!("{}", message.content);
    if let Some(stats) = &message.stats {
        println!(
            "[{} | {} tokens | {} ms | ${:.6}]",
            stats.model, stats.tokens, stats.duration, stats.cost
        );
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = crate::config::AppConfig::load(cli.config.as_deref())?;
    let state = AppState::init(&config)
        .await
        .context("Failed to initialise application state")?;
    execute(&state, cli.command).await
}
