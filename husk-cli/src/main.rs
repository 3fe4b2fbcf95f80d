//! CLI for husk: run commands and coding agents in disposable VMs.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "husk",
    version,
    about = "Run commands in disposable VMs with the current directory mounted"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command in a fresh VM cloned from an image.
    Run(Box<run::RunArgs>),

    /// Run Claude Code with permission prompts disabled.
    Claude(Box<run::AgentArgs>),

    /// Run Codex with approvals and its own sandbox disabled.
    Codex(Box<run::AgentArgs>),

    /// Prepare the seed image: clone a remote image, install the agent and
    /// set up its token.
    Init(Box<run::InitArgs>),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("husk: {e:#}");
        let code = e
            .downcast_ref::<husk::Error>()
            .and_then(husk::Error::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Run(args) => args.run().await,
            Command::Claude(args) => args.run(run::Agent::Claude).await,
            Command::Codex(args) => args.run(run::Agent::Codex).await,
            Command::Init(args) => args.run().await,
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "husk", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// Logs to stderr, filtered by `HUSK_LOG` (default `warn`).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("HUSK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
