//! `husk run`, the agent shortcuts and `husk init`.
//!
//! Every session clones a VM, mounts the current directory at
//! `$HOME/workspace`, runs one command there and destroys the VM.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use husk::control::DEFAULT_PROGRAM;
use husk::{ControlPlane, Credentials, DirectoryMount, Sandbox, SandboxConfig, SshDialer, StdConsole};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Image the agent shortcuts and `init` use by default.
pub const DEFAULT_SEED: &str = "husk-seed";

/// Arguments for `husk run`.
///
/// Usage: `husk run --vm IMAGE [OPTIONS] COMMAND [ARG...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    /// Image to clone the VM from.
    #[arg(long = "vm", value_name = "IMAGE")]
    image: String,

    #[command(flatten)]
    session: SessionArgs,

    /// Command and arguments to run inside the VM.
    #[arg(required = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    pub async fn run(self) -> Result<()> {
        let command = self.command.join(" ");
        self.session.launch(&self.image, &command).await
    }
}

/// Coding agents with a shortcut subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agent {
    Claude,
    Codex,
}

impl Agent {
    /// Executable name inside the guest.
    const fn program(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    /// Flag that turns off the agent's own confirmation prompts.
    const fn unattended_flag(self) -> &'static str {
        match self {
            Self::Claude => "--dangerously-skip-permissions",
            Self::Codex => "--dangerously-bypass-approvals-and-sandbox",
        }
    }

    /// Builds the agent's command line.
    fn command(self, args: &[String]) -> String {
        let mut parts = vec![self.program(), self.unattended_flag()];
        parts.extend(args.iter().map(String::as_str));
        parts.join(" ")
    }
}

/// Arguments for `husk claude` and `husk codex`.
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct AgentArgs {
    /// Image to clone the VM from.
    #[arg(long = "vm", value_name = "IMAGE", default_value = DEFAULT_SEED)]
    image: String,

    #[command(flatten)]
    session: SessionArgs,

    /// Arguments passed through to the agent.
    #[arg(allow_hyphen_values = true)]
    args: Vec<String>,
}

impl AgentArgs {
    pub async fn run(self, agent: Agent) -> Result<()> {
        self.session
            .launch(&self.image, &agent.command(&self.args))
            .await
    }
}

/// Arguments for `husk init`.
#[derive(clap::Args)]
pub struct InitArgs {
    /// Remote image to clone (e.g., ghcr.io/cirruslabs/macos-sequoia-base:latest).
    remote: String,

    /// Name of the local seed image.
    #[arg(long, default_value = DEFAULT_SEED)]
    seed: String,

    #[command(flatten)]
    connect: ConnectArgs,
}

impl InitArgs {
    pub async fn run(self) -> Result<()> {
        let config = self.connect.apply(SandboxConfig::new(&self.seed, ""))?;
        let sandbox = Sandbox::new(config, SshDialer, Arc::new(StdConsole));
        let cancel = cancel_on_signals()?;
        sandbox
            .init(&self.remote, &cancel, |msg| eprintln!("{msg}"))
            .await
            .with_context(|| format!("failed to initialize {}", self.seed))
    }
}

/// How to reach the guest and drive the control plane.
#[derive(clap::Args)]
struct ConnectArgs {
    /// SSH username.
    #[arg(long, default_value = "admin")]
    ssh_user: String,

    /// SSH password.
    #[arg(long, default_value = "admin")]
    ssh_pass: String,

    /// Set an environment variable for the control plane (format: KEY=VALUE).
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Give up connecting after this many seconds (default: wait until interrupted).
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u64>,

    /// Control-plane binary name or path.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_PROGRAM)]
    tart: PathBuf,
}

impl ConnectArgs {
    fn apply(&self, mut config: SandboxConfig) -> Result<SandboxConfig> {
        for spec in &self.env {
            let (key, value) = parse_env(spec)?;
            config = config.env(key, value);
        }
        Ok(config
            .credentials(Credentials::new(&self.ssh_user, &self.ssh_pass))
            .connect_timeout(self.connect_timeout.map(Duration::from_secs))
            .control(ControlPlane::new(&self.tart)))
    }
}

/// Options shared by every command that runs a session.
#[derive(clap::Args)]
struct SessionArgs {
    /// Number of CPUs (0 keeps the image's setting).
    #[arg(long = "cpu", default_value_t = 0)]
    cpus: u32,

    /// Memory in MiB (0 keeps the image's setting).
    #[arg(long, default_value_t = 0)]
    memory: u32,

    /// Share an extra host directory (format: name:path[:ro]).
    #[arg(long = "dir", value_name = "NAME:PATH[:ro]")]
    dirs: Vec<String>,

    /// Run without a terminal: no raw mode, line-buffered output.
    #[arg(long)]
    no_tty: bool,

    #[command(flatten)]
    connect: ConnectArgs,
}

impl SessionArgs {
    /// Runs `command` in a clone of `image` with the current directory mounted.
    async fn launch(self, image: &str, command: &str) -> Result<()> {
        let cwd = std::env::current_dir().context("failed to get current directory")?;
        let mut config = SandboxConfig::new(image, command)
            .cpus(self.cpus)
            .memory_mib(self.memory)
            .interactive(!self.no_tty)
            .workdir(cwd);
        for mount in parse_dirs(&self.dirs)? {
            config = config.mount(mount);
        }
        let config = self.connect.apply(config)?;

        let sandbox = Sandbox::new(config, SshDialer, Arc::new(StdConsole));
        let cancel = cancel_on_signals()?;
        sandbox.run(&cancel, |msg| eprintln!("{msg}")).await?;
        Ok(())
    }
}

/// Returns a token cancelled by the first SIGINT or SIGTERM.
fn cancel_on_signals() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to watch SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        eprintln!("\nInterrupted, cleaning up...");
        cancel.cancel();
    });
    Ok(token)
}

/// Parses `KEY=VALUE`.
fn parse_env(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => anyhow::bail!("invalid --env {spec:?}; use KEY=VALUE"),
    }
}

/// Parses every `--dir` value, rejecting duplicate names.
fn parse_dirs(specs: &[String]) -> Result<Vec<DirectoryMount>> {
    let mut seen = HashSet::with_capacity(specs.len());
    specs
        .iter()
        .map(|spec| {
            let mount = parse_dir(spec)?;
            if !seen.insert(mount.name.clone()) {
                anyhow::bail!("duplicate mount name {:?}", mount.name);
            }
            Ok(mount)
        })
        .collect()
}

/// Parses `name:path[:ro]`.
fn parse_dir(spec: &str) -> Result<DirectoryMount> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    let (name, path, read_only) = match parts.as_slice() {
        [name, path] => (*name, *path, false),
        [name, path, "ro"] => (*name, *path, true),
        [_, _, flag] => {
            anyhow::bail!("invalid --dir {spec:?}: read-only flag {flag:?} must be 'ro'")
        }
        _ => anyhow::bail!("invalid --dir format {spec:?}; use name:path[:ro]"),
    };
    if name.trim().is_empty() {
        anyhow::bail!("invalid --dir {spec:?}: mount name cannot be empty");
    }
    let path = std::path::absolute(expand_home(path)?)
        .with_context(|| format!("failed to resolve {path:?}"))?;
    Ok(DirectoryMount::new(name, path).read_only(read_only))
}

/// Expands a leading `~` or `~/` to the home directory.
fn expand_home(path: &str) -> Result<PathBuf> {
    let rest = match path.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(path)),
    };
    let home = dirs::home_dir().context("failed to get home directory")?;
    Ok(if rest.is_empty() {
        home
    } else {
        home.join(Path::new(rest))
    })
}
