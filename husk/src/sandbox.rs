//! Session orchestration.
//!
//! [`Sandbox::run`] drives one disposable VM from clone to delete and runs
//! one command inside it. Teardown mirrors setup in reverse (close the
//! transport, stop the VM, delete it) and runs on every exit path once the
//! VM exists, including cancellation. Cleanup failures are reported as
//! warnings and never replace the session's own result.
//!
//! A remote command in flight is never abandoned on cancellation: it is
//! aborted and its stream tasks are joined before the orchestrator moves
//! on, and no new session is opened afterwards.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connect::ConnectionWaiter;
use crate::console::Console;
use crate::control::{ControlPlane, Env};
use crate::exec::{self, NonInteractiveExecutor};
use crate::mount::{self, DirectoryMount, RemoteMount, WORKDIR_TAG};
use crate::terminal::TerminalProxy;
use crate::transport::{Connection, Credentials, Dialer};
use crate::vm::{ADDRESS_WAIT_SECS, STOP_TIMEOUT_SECS, Vm, VmExit};
use crate::{Error, Result};

/// Port the guest's SSH daemon listens on.
pub const SSH_PORT: u16 = 22;

/// Mount name of the host working directory.
pub const WORKDIR_MOUNT_NAME: &str = "working-dir";

/// Command that installs the Claude Code agent in a seed image.
pub const INSTALL_AGENT_COMMAND: &str = "npm install -g @anthropic-ai/claude-code";

/// Command that stores the agent's long-lived token in a seed image.
pub const SETUP_TOKEN_COMMAND: &str = "claude setup-token";

/// Settings for one sandboxed session.
#[derive(Debug, Clone)]
#[must_use = "a SandboxConfig does nothing until passed to Sandbox::new"]
pub struct SandboxConfig {
    /// Image to clone from (or the seed name for [`Sandbox::init`]).
    image: String,
    /// Command line run inside the VM.
    command: String,
    /// vCPUs; 0 keeps the image's value.
    cpus: u32,
    /// Memory in MiB; 0 keeps the image's value.
    memory_mib: u32,
    /// SSH login.
    credentials: Credentials,
    /// Host directory exported as the guest working directory.
    workdir: Option<PathBuf>,
    /// Additional directory shares.
    mounts: Vec<DirectoryMount>,
    /// Environment for every control-plane call.
    env: Env,
    /// Use the terminal proxy when a terminal is attached.
    interactive: bool,
    /// Bound on waiting for the transport.
    connect_timeout: Option<Duration>,
    /// Control-plane client.
    control: ControlPlane,
}

impl SandboxConfig {
    /// Creates a config that runs `command` in a clone of `image`.
    ///
    /// Defaults: image resources, `admin`/`admin` login, no working
    /// directory share, interactive, no connection bound, `tart`.
    pub fn new(image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: command.into(),
            cpus: 0,
            memory_mib: 0,
            credentials: Credentials::new("admin", "admin"),
            workdir: None,
            mounts: Vec::new(),
            env: Env::new(),
            interactive: true,
            connect_timeout: None,
            control: ControlPlane::default(),
        }
    }

    /// Sets the number of vCPUs.
    pub const fn cpus(mut self, n: u32) -> Self {
        self.cpus = n;
        self
    }

    /// Sets the memory size in MiB.
    pub const fn memory_mib(mut self, mib: u32) -> Self {
        self.memory_mib = mib;
        self
    }

    /// Sets the SSH login.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Shares `path` into the guest and runs the command from it.
    pub fn workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.workdir = Some(path.into());
        self
    }

    /// Adds a directory share.
    pub fn mount(mut self, mount: DirectoryMount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Sets one control-plane environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Chooses between the terminal proxy and the line-buffered executor.
    pub const fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Bounds the wait for the transport. `None` waits until cancelled.
    pub const fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the control-plane client.
    pub fn control(mut self, control: ControlPlane) -> Self {
        self.control = control;
        self
    }

    /// Mounts passed to `run`: the working directory first, then the extras.
    fn start_mounts(&self) -> Vec<DirectoryMount> {
        self.workdir
            .iter()
            .map(|dir| DirectoryMount::new(WORKDIR_MOUNT_NAME, dir.clone()).tag(WORKDIR_TAG))
            .chain(self.mounts.iter().cloned())
            .collect()
    }
}

/// Runs commands in disposable VMs.
#[derive(Debug)]
pub struct Sandbox<D, C> {
    /// Session settings.
    config: SandboxConfig,
    /// Retries the transport until the guest is reachable.
    waiter: ConnectionWaiter<D>,
    /// Local terminal.
    console: Arc<C>,
}

impl<D: Dialer, C: Console> Sandbox<D, C> {
    /// Creates a sandbox that reaches guests through `dialer`.
    pub fn new(config: SandboxConfig, dialer: D, console: Arc<C>) -> Self {
        let waiter = ConnectionWaiter::new(dialer).overall_timeout(config.connect_timeout);
        Self {
            config,
            waiter,
            console,
        }
    }

    /// Returns the session settings.
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Clones a VM, runs the configured command in it and destroys it.
    ///
    /// `progress` receives one human-readable line per step. A non-zero
    /// remote exit is returned as [`Error::RemoteCommandFailed`].
    pub async fn run(&self, cancel: &CancellationToken, progress: impl Fn(&str)) -> Result<()> {
        let cfg = &self.config;
        self.ensure_installed()?;
        let mounts = cfg.start_mounts();
        mount::validate_mounts(&mounts)?;

        progress(&format!("Creating ephemeral VM from {}...", cfg.image));
        let mut vm = Vm::clone_from(cfg.control.clone(), &cfg.image, cfg.env.clone()).await?;

        let result = self.session(&mut vm, &mounts, cancel, &progress).await;
        progress("Cleaning up VM...");
        teardown(&mut vm, true, &progress).await;
        result
    }

    /// Prepares a seed image: clones `remote` to the configured image name,
    /// installs the agent and runs its token setup interactively.
    ///
    /// The seed is stopped afterwards but kept.
    pub async fn init(
        &self,
        remote: &str,
        cancel: &CancellationToken,
        progress: impl Fn(&str),
    ) -> Result<()> {
        let cfg = &self.config;
        self.ensure_installed()?;

        progress(&format!("Cloning {remote} to {}...", cfg.image));
        cfg.control.clone_vm(&cfg.env, remote, &cfg.image).await?;
        let mut vm = Vm::attach(cfg.control.clone(), cfg.image.clone(), cfg.env.clone());

        let result = self.seed(&mut vm, cancel, &progress).await;
        progress("Stopping VM...");
        teardown(&mut vm, false, &progress).await;
        result
    }

    /// Fails with [`Error::ControlPlaneNotFound`] before any VM is touched.
    fn ensure_installed(&self) -> Result<()> {
        let control = &self.config.control;
        if control.installed() {
            Ok(())
        } else {
            Err(Error::ControlPlaneNotFound {
                program: control.program().display().to_string(),
            })
        }
    }

    /// Everything between clone and teardown for [`run`](Self::run).
    async fn session(
        &self,
        vm: &mut Vm,
        mounts: &[DirectoryMount],
        cancel: &CancellationToken,
        progress: &dyn Fn(&str),
    ) -> Result<()> {
        let cfg = &self.config;
        progress("Configuring VM...");
        vm.configure(cfg.cpus, cfg.memory_mib).await?;
        progress("Starting VM...");
        vm.start(mounts)?;

        let conn = self.reach(vm, cancel, progress).await?;
        let result = self.execute(&conn, cancel, progress).await;
        if let Err(e) = conn.close() {
            tracing::debug!(error = %e, "failed to close transport");
        }
        result
    }

    /// Everything between clone and stop for [`init`](Self::init).
    async fn seed(
        &self,
        vm: &mut Vm,
        cancel: &CancellationToken,
        progress: &dyn Fn(&str),
    ) -> Result<()> {
        progress("Starting VM...");
        vm.start(&[])?;
        let conn = self.reach(vm, cancel, progress).await?;
        let result = self.provision(&conn, cancel, progress).await;
        if let Err(e) = conn.close() {
            tracing::debug!(error = %e, "failed to close transport");
        }
        result
    }

    /// Installs the agent and runs its token setup on `conn`.
    async fn provision(
        &self,
        conn: &D::Connection,
        cancel: &CancellationToken,
        progress: &dyn Fn(&str),
    ) -> Result<()> {
        progress("Installing @anthropic-ai/claude-code...");
        let session = open_session(conn, cancel)?;
        NonInteractiveExecutor::new(Arc::clone(&self.console))
            .run(session, INSTALL_AGENT_COMMAND, cancel)
            .await?;

        progress("Setting up the agent token, follow the instructions below:");
        let session = open_session(conn, cancel)?;
        TerminalProxy::new(Arc::clone(&self.console))
            .run(session, SETUP_TOKEN_COMMAND, cancel)
            .await
    }

    /// Waits for the VM's address and connects to it.
    ///
    /// A `run` process that ended before the VM became reachable is
    /// reported as [`Error::VmExited`] rather than as an address failure.
    async fn reach(
        &self,
        vm: &mut Vm,
        cancel: &CancellationToken,
        progress: &dyn Fn(&str),
    ) -> Result<D::Connection> {
        progress("Waiting for VM to boot...");
        let addr = until_cancelled(cancel, vm.retrieve_address(ADDRESS_WAIT_SECS)).await;
        if let Some(e) = early_exit(vm) {
            return Err(e);
        }
        let ip: IpAddr = addr?;
        progress(&format!("VM IP: {ip}"));

        progress("Connecting to VM via SSH...");
        self.waiter
            .connect(cancel, SocketAddr::new(ip, SSH_PORT), &self.config.credentials)
            .await
    }

    /// Runs the configured command, inside the working directory if shared.
    async fn execute(
        &self,
        conn: &D::Connection,
        cancel: &CancellationToken,
        progress: &dyn Fn(&str),
    ) -> Result<()> {
        let cfg = &self.config;
        let remote = cfg.workdir.as_ref().map(|_| RemoteMount::workdir());

        let command = match &remote {
            Some(m) => {
                progress("Mounting working directory...");
                let session = open_session(conn, cancel)?;
                exec::run_quiet(session, &m.mount_command(), cancel).await?;
                m.wrap(&cfg.command)
            }
            None => cfg.command.clone(),
        };

        progress(&format!("Executing command: {}", cfg.command));
        let result = self.run_command(conn, &command, cancel).await;

        if let Some(m) = &remote {
            if cancel.is_cancelled() {
                tracing::debug!("cancelled, skipping unmount");
            } else if let Err(e) = self.unmount(conn, m, cancel).await {
                tracing::debug!(error = %e, "unmount failed");
            }
        }
        result
    }

    /// Unmounts `m` in the guest.
    async fn unmount(
        &self,
        conn: &D::Connection,
        m: &RemoteMount,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session = open_session(conn, cancel)?;
        exec::run_quiet(session, &m.unmount_command(), cancel)
            .await
            .map(drop)
    }

    /// Runs `command` through the terminal proxy or the executor.
    async fn run_command(
        &self,
        conn: &D::Connection,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session = open_session(conn, cancel)?;
        let console = Arc::clone(&self.console);
        if self.config.interactive {
            TerminalProxy::new(console).run(session, command, cancel).await
        } else {
            NonInteractiveExecutor::new(console)
                .run(session, command, cancel)
                .await
        }
    }
}

/// Opens a fresh session on `conn`, unless `cancel` has already fired.
fn open_session<X: Connection>(conn: &X, cancel: &CancellationToken) -> Result<X::Session> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    conn.open_session().map_err(Error::setup("open session"))
}

/// Resolves `fut`, or [`Error::Cancelled`] as soon as `cancel` fires.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Reports a `run` process that already ended on its own.
fn early_exit(vm: &mut Vm) -> Option<Error> {
    let reason = match vm.try_exit()? {
        VmExit::Stopped => return None,
        VmExit::Exited => "run process exited".to_owned(),
        VmExit::Failed(e) => e.to_string(),
    };
    Some(Error::VmExited {
        vm: vm.id().to_owned(),
        reason,
    })
}

/// Stops the VM and optionally deletes it, downgrading failures to warnings.
async fn teardown(vm: &mut Vm, delete: bool, progress: &dyn Fn(&str)) {
    let result = if delete {
        vm.close().await
    } else {
        vm.stop(STOP_TIMEOUT_SECS).await
    };
    if let Err(e) = result {
        tracing::warn!(vm = %vm.id(), error = %e, "VM cleanup failed");
        progress(&format!("Warning: failed to clean up VM {}: {e}", vm.id()));
    }
}
