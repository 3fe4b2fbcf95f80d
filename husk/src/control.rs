//! Client for the external VM control binary.
//!
//! Every VM operation is a subprocess invocation of the control binary
//! (`tart` by default). Output is captured; failures are classified into
//! "binary missing" and "binary ran but exited non-zero", with the first
//! non-empty diagnostic line lifted into the error.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::{Error, Result};

/// Control binary used when none is configured.
pub const DEFAULT_PROGRAM: &str = "tart";

/// Extra environment for one control-plane invocation.
///
/// Merged on top of the ambient process environment; ambient entries are
/// never removed.
pub type Env = BTreeMap<String, String>;

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Output {
    /// Everything the binary wrote to stdout.
    pub stdout: String,
    /// Everything the binary wrote to stderr.
    pub stderr: String,
}

/// Handle to the VM control binary.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    /// Program name (looked up in `PATH`) or explicit path.
    program: PathBuf,
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl ControlPlane {
    /// Creates a client for `program`, a bare name or a path.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Returns the configured program.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns `true` if the binary can be found without spawning it.
    pub fn installed(&self) -> bool {
        if self.program.components().count() > 1 {
            return self.program.is_file();
        }
        std::env::var_os("PATH").is_some_and(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(&self.program).is_file())
        })
    }

    /// Runs `<program> <verb> <args...>` and captures its output.
    ///
    /// The child is killed if the returned future is dropped, so callers
    /// can bound or cancel long-running verbs such as `run`.
    pub async fn invoke<I, S>(&self, env: &Env, verb: &str, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.arg(verb).args(args).envs(env).kill_on_drop(true);

        tracing::debug!(program = %self.program.display(), verb, "invoking control plane");

        let out = match cmd.output().await {
            Ok(out) => out,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ControlPlaneNotFound {
                    program: self.program.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();

        if !out.status.success() {
            let message = first_non_empty_line(&[&stderr, &stdout]).to_owned();
            tracing::debug!(verb, status = ?out.status, %message, "control plane failed");
            return Err(Error::ControlPlaneFailed {
                program: self.program.display().to_string(),
                verb: verb.to_owned(),
                message,
            });
        }

        Ok(Output { stdout, stderr })
    }

    /// Clones `src` to `dst` without creating a VM handle.
    pub async fn clone_vm(&self, env: &Env, src: &str, dst: &str) -> Result<()> {
        self.invoke(env, "clone", [src, dst]).await.map(drop)
    }
}

/// Returns the first non-empty line, scanning `outputs` in order.
///
/// Lines are split on `\n` only and kept verbatim, so a line of spaces or a
/// trailing `\r` counts as content.
///
/// Callers pass stderr before stdout: diagnostics conventionally land on
/// stderr, but some failures only print to stdout.
fn first_non_empty_line<'a>(outputs: &[&'a str]) -> &'a str {
    outputs
        .iter()
        .flat_map(|o| o.split('\n'))
        .find(|l| !l.is_empty())
        .unwrap_or_default()
}
