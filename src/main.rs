// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! askgate - admission-control gateway for a personal-site AI assistant

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use askgate::config::GatewayConfig;
use askgate::guardrail::{AdmissionGuardrail, GuardrailVerdict};
use askgate::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "askgate")]
#[command(version = VERSION)]
#[command(about = "Rate-limited, topic-guarded gateway in front of an LLM completion API.")]
#[command(long_about = "askgate - admission-control gateway\n\n\
    Start the server:    askgate (or: askgate serve)\n\
    Check a question:    askgate classify \"Where did he study?\"\n\n\
    Only questions about the configured subject ever reach the upstream model.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a JSON config file (default: ~/.config/askgate/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose mode: debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway (default)
    Serve(ServeArgs),

    /// Run a question through the guardrail without calling upstream
    Classify {
        /// The question to classify
        question: String,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = GatewayConfig::resolve(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::Classify { question }) => classify(&config, &question),
        Some(Commands::Serve(args)) => serve(config, args),
        None => serve(config, ServeArgs::default()),
    }
}

fn serve(config: GatewayConfig, args: ServeArgs) -> Result<()> {
    let mut server = Server::new(config);
    if let Some(port) = args.port {
        server = server.with_port(port);
    }
    if let Some(bind) = args.bind {
        server = server.with_bind_address(bind);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(server.start())
}

fn classify(config: &GatewayConfig, question: &str) -> Result<()> {
    let guardrail = AdmissionGuardrail::new(&config.subject).context("Invalid subject name pattern")?;

    match guardrail.classify_text(question) {
        GuardrailVerdict::Allowed(reason) => {
            println!("allowed ({})", serde_json::to_string(&reason)?.trim_matches('"'));
        }
        GuardrailVerdict::Blocked { reason, message } => {
            println!("blocked ({})", reason.as_str());
            println!("{}", message);
        }
    }
    Ok(())
}
