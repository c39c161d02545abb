//! moxie-chat - multi-turn chat with local language models
//!
//! Runs either an interactive terminal session or an HTTP front end where
//! every request is keyed by a session id.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use moxie_chat::config::{ChatProfile, Config};
use moxie_chat::conversation::Conversation;
use moxie_chat::core::{ChatEngine, ReplyStatus, SessionRegistry, TerminalSink};
use moxie_chat::providers::{build_generator, Generator, ScriptedGenerator};
use moxie_chat::routes::{self, AppState};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Model profile (TOML); defaults to MOXIE_CHAT_PROFILE
    #[arg(short, long, global = true)]
    profile: Option<PathBuf>,

    /// Answer with the built-in echo generator instead of a model backend
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Chat in the terminal (default)
    Repl {
        /// Print suppressed reasoning segments dimmed
        #[arg(long)]
        show_thinking: bool,
    },
    /// Serve the HTTP session API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "moxie_chat=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    let profile = match cli.profile.as_ref().or(config.profile_path.as_ref()) {
        Some(path) => ChatProfile::from_file(path)
            .with_context(|| format!("Failed to load profile {}", path.display()))?,
        None => ChatProfile::default(),
    };

    let engine = build_engine(&profile, &config, cli.dry_run)?;
    let preamble = profile.preamble().await?;

    match cli.command.unwrap_or(Command::Repl { show_thinking: false }) {
        Command::Repl { show_thinking } => repl(engine, preamble, show_thinking).await,
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.host.clone());
            let port = port.unwrap_or(config.port);
            serve(engine, preamble, &host, port).await
        }
    }
}

fn build_engine(profile: &ChatProfile, config: &Config, dry_run: bool) -> anyhow::Result<ChatEngine> {
    let generator: Arc<dyn Generator> = if dry_run {
        Arc::new(ScriptedGenerator::echo())
    } else {
        build_generator(&profile.model, config)?
    };
    tracing::info!(generator = generator.name(), model = %profile.model.model, "Using generator");

    let mut engine = ChatEngine::new(generator, profile.renderer(), profile.engine_options())
        .with_markers(profile.markers.resolve()?);

    if let Some(tools) = profile.tool_registry() {
        tracing::info!("Loaded {} tool(s)", tools.len());
        engine = engine.with_tools(tools);
    }

    Ok(engine)
}

async fn repl(engine: ChatEngine, preamble: String, show_thinking: bool) -> anyhow::Result<()> {
    let mut conversation = Conversation::new().with_preamble(preamble);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", style("\nmoxie-chat").bold().cyan());
    println!(
        "Type {} to leave, {} to reset the history\n",
        style("quit").dim(),
        style("clear").dim()
    );

    loop {
        print!("{} ", style("User:").green().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input.to_lowercase().as_str() {
            "quit" | "exit" => {
                println!("Goodbye!");
                break;
            }
            "clear" | "reset" => {
                conversation.clear();
                println!("{}\n", style("History cleared.").yellow());
                continue;
            }
            _ => {}
        }

        print!("{} ", style("Assistant:").blue().bold());
        std::io::stdout().flush()?;

        let mut sink = TerminalSink::new(show_thinking);
        match engine.run_turn(&mut conversation, input, &mut sink).await {
            Ok(reply) => {
                for call in &reply.tool_calls {
                    let output: String = call.output.chars().take(100).collect();
                    let ellipsis = if call.output.chars().count() > 100 { "..." } else { "" };
                    println!(
                        "{}",
                        style(format!("[Tool result ({}): {}{}]", call.name, output, ellipsis)).dim()
                    );
                }
                match reply.status {
                    ReplyStatus::Complete => {}
                    ReplyStatus::Truncated => println!(
                        "{}",
                        style(format!(
                            "(reply cut short: {})",
                            reply.error.as_deref().unwrap_or("generation failed")
                        ))
                        .yellow()
                    ),
                    ReplyStatus::ToolRoundsExhausted => println!(
                        "{}",
                        style(format!("(stopped after {} tool rounds)", reply.rounds)).yellow()
                    ),
                }
            }
            Err(e) => eprintln!("{} {}", style("Error:").red().bold(), e),
        }
        println!();
    }

    Ok(())
}

async fn serve(engine: ChatEngine, preamble: String, host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let state = AppState::new(engine, SessionRegistry::with_preamble(preamble));

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("moxie-chat API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
