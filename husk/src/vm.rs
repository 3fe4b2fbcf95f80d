//! Ephemeral VM handle driven through the control plane.
//!
//! A [`Vm`] owns one VM identity and walks it through
//! clone → configure → start → address → stop → delete. The control plane's
//! `run` verb is long-lived, so [`Vm::start`] hands it to a supervisor task
//! and reports its outcome once through a one-shot channel.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::control::{ControlPlane, Env};
use crate::mount::{self, DirectoryMount};
use crate::{Error, Result};

/// Prefix of generated VM names.
pub const NAME_PREFIX: &str = "husk-ephemeral-";

/// Seconds the control plane waits for a DHCP lease in `ip --wait`.
pub const ADDRESS_WAIT_SECS: u32 = 30;

/// Seconds the control plane waits for a graceful shutdown in `stop`.
pub const STOP_TIMEOUT_SECS: u32 = 5;

/// Lifecycle state of a [`Vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunState {
    /// Cloned (or attached) and not started.
    Created,
    /// Resource settings are being applied.
    Configuring,
    /// The `run` process has been launched.
    Starting,
    /// The VM reported a network address.
    Running,
    /// A stop is in progress.
    Stopping,
    /// The `run` process has been joined.
    Stopped,
    /// The VM no longer exists.
    Deleted,
}

impl RunState {
    /// Lowercase name used in messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Configuring => "configuring",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the supervised `run` process ended.
#[derive(Debug)]
#[non_exhaustive]
pub enum VmExit {
    /// Ended because a stop was requested.
    Stopped,
    /// Returned success without a stop request.
    Exited,
    /// Failed without a stop request.
    Failed(Error),
}

/// Handle to one VM managed through the control plane.
#[derive(Debug)]
pub struct Vm {
    /// VM name as known to the control plane.
    id: String,
    /// Image this VM was cloned from, if any.
    base: Option<String>,
    /// Extra environment for every control-plane call.
    env: Env,
    /// Control-plane client.
    control: ControlPlane,
    /// Current lifecycle state.
    state: RunState,
    /// Cancels the supervised `run` process.
    run_token: CancellationToken,
    /// Set before the graceful stop so the supervisor can classify the exit.
    stop_requested: Arc<AtomicBool>,
    /// Supervisor task, present between start and stop.
    supervisor: Option<JoinHandle<()>>,
    /// Receives the supervisor's outcome exactly once.
    exit: Option<oneshot::Receiver<VmExit>>,
}

impl Vm {
    /// Clones `base` into a freshly named VM.
    pub async fn clone_from(control: ControlPlane, base: &str, env: Env) -> Result<Self> {
        let id = generate_name();
        tracing::info!(vm = %id, base, "cloning VM");
        control.clone_vm(&env, base, &id).await?;
        let mut vm = Self::attach(control, id, env);
        vm.base = Some(base.to_owned());
        Ok(vm)
    }

    /// Creates a handle for a VM that already exists.
    pub fn attach(control: ControlPlane, id: impl Into<String>, env: Env) -> Self {
        Self {
            id: id.into(),
            base: None,
            env,
            control,
            state: RunState::Created,
            run_token: CancellationToken::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            supervisor: None,
            exit: None,
        }
    }

    /// Returns the VM name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the image this VM was cloned from.
    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    /// Returns the current lifecycle state.
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Randomizes the MAC address and applies resource settings.
    ///
    /// A zero `cpus` or `memory_mib` keeps the image's value.
    pub async fn configure(&mut self, cpus: u32, memory_mib: u32) -> Result<()> {
        self.expect_state("configure", &[RunState::Created])?;
        self.state = RunState::Configuring;
        let result = self.apply_settings(cpus, memory_mib).await;
        self.state = RunState::Created;
        result
    }

    /// Issues the `set` calls for [`configure`](Self::configure).
    async fn apply_settings(&self, cpus: u32, memory_mib: u32) -> Result<()> {
        self.invoke("set", [self.id.as_str(), "--random-mac"]).await?;
        if cpus != 0 {
            let n = cpus.to_string();
            self.invoke("set", [self.id.as_str(), "--cpu", &n]).await?;
        }
        if memory_mib != 0 {
            let n = memory_mib.to_string();
            self.invoke("set", [self.id.as_str(), "--memory", &n]).await?;
        }
        Ok(())
    }

    /// Launches the control plane's `run` verb in a supervisor task.
    ///
    /// Returns immediately. The outcome is reported once through
    /// [`try_exit`](Self::try_exit). Must be called from a Tokio runtime.
    pub fn start(&mut self, mounts: &[DirectoryMount]) -> Result<()> {
        self.expect_state("start", &[RunState::Created])?;
        mount::validate_mounts(mounts)?;

        let args = mount::run_args(mounts, &self.id);
        let control = self.control.clone();
        let env = self.env.clone();
        let token = self.run_token.clone();
        let stop_requested = Arc::clone(&self.stop_requested);
        let id = self.id.clone();
        let (tx, rx) = oneshot::channel();

        tracing::info!(vm = %id, mounts = mounts.len(), "starting VM");
        self.supervisor = Some(tokio::spawn(async move {
            let outcome = tokio::select! {
                res = control.invoke(&env, "run", &args) => {
                    match res {
                        _ if stop_requested.load(Ordering::SeqCst) => VmExit::Stopped,
                        Ok(_) => VmExit::Exited,
                        Err(e) => VmExit::Failed(e),
                    }
                }
                () = token.cancelled() => VmExit::Stopped,
            };
            tracing::debug!(vm = %id, ?outcome, "run process ended");
            let _ = tx.send(outcome);
        }));
        self.exit = Some(rx);
        self.state = RunState::Starting;
        Ok(())
    }

    /// Returns the supervisor's outcome if the `run` process has ended.
    ///
    /// Never blocks. Yields a value at most once per start.
    pub fn try_exit(&mut self) -> Option<VmExit> {
        let rx = self.exit.as_mut()?;
        match rx.try_recv() {
            Ok(exit) => {
                self.exit = None;
                Some(exit)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.exit = None;
                Some(VmExit::Exited)
            }
        }
    }

    /// Asks the control plane for the VM's address, waiting up to `wait_secs`.
    ///
    /// Errors from the control plane are returned unchanged.
    pub async fn retrieve_address(&mut self, wait_secs: u32) -> Result<IpAddr> {
        self.expect_state("retrieve address of", &[RunState::Starting, RunState::Running])?;
        let wait = wait_secs.to_string();
        let out = self
            .invoke("ip", ["--wait", wait.as_str(), self.id.as_str()])
            .await?;
        let raw = out.stdout.trim();
        let addr = raw
            .parse()
            .map_err(|_| Error::InvalidAddress(raw.to_owned()))?;
        tracing::info!(vm = %self.id, %addr, "VM address assigned");
        self.state = RunState::Running;
        Ok(addr)
    }

    /// Stops the VM: graceful control-plane stop, then cancel and join.
    ///
    /// Idempotent. A VM that never started only changes state. Failures of
    /// the graceful stop are ignored since the VM may already be down.
    pub async fn stop(&mut self, timeout_secs: u32) -> Result<()> {
        match self.state {
            RunState::Stopped | RunState::Deleted => return Ok(()),
            RunState::Created | RunState::Configuring => {
                self.state = RunState::Stopped;
                return Ok(());
            }
            RunState::Starting | RunState::Running | RunState::Stopping => {}
        }
        self.state = RunState::Stopping;
        self.stop_requested.store(true, Ordering::SeqCst);

        let timeout = timeout_secs.to_string();
        if let Err(e) = self
            .invoke("stop", ["--timeout", timeout.as_str(), self.id.as_str()])
            .await
        {
            tracing::debug!(vm = %self.id, error = %e, "graceful stop failed");
        }

        self.run_token.cancel();
        if let Some(task) = self.supervisor.take() {
            if let Err(e) = task.await {
                tracing::warn!(vm = %self.id, error = %e, "VM supervisor task failed");
            }
        }
        self.state = RunState::Stopped;
        tracing::info!(vm = %self.id, "VM stopped");
        Ok(())
    }

    /// Deletes the VM. Only valid once stopped; repeated calls are no-ops.
    pub async fn delete(&mut self) -> Result<()> {
        match self.state {
            RunState::Deleted => return Ok(()),
            RunState::Created | RunState::Stopped => {}
            _ => {
                return Err(Error::InvalidState {
                    op: "delete",
                    vm: self.id.clone(),
                    state: self.state.as_str(),
                });
            }
        }
        self.invoke("delete", [self.id.as_str()]).await?;
        self.state = RunState::Deleted;
        tracing::info!(vm = %self.id, "VM deleted");
        Ok(())
    }

    /// Stops then deletes the VM, surfacing the first error.
    pub async fn close(&mut self) -> Result<()> {
        self.stop(STOP_TIMEOUT_SECS).await?;
        self.delete().await
    }

    /// Runs one control-plane verb with this VM's environment.
    async fn invoke<const N: usize>(
        &self,
        verb: &str,
        args: [&str; N],
    ) -> Result<crate::control::Output> {
        self.control.invoke(&self.env, verb, args).await
    }

    /// Fails with [`Error::InvalidState`] unless the state is one of `allowed`.
    fn expect_state(&self, op: &'static str, allowed: &[RunState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op,
                vm: self.id.clone(),
                state: self.state.as_str(),
            })
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Kills the run process if the owner never stopped the VM.
        self.run_token.cancel();
    }
}

/// Generates `husk-ephemeral-YYYYMMDD-HHMMSS` from the local clock.
fn generate_name() -> String {
    format!(
        "{NAME_PREFIX}{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    )
}
