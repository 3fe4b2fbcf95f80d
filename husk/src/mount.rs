//! Host directory sharing: `--dir` arguments for the control plane and the
//! guest-side virtiofs mount commands.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::{Error, Result};

/// Virtiofs tag the host working directory is exported under.
pub const WORKDIR_TAG: &str = "tart.virtiofs.working-dir";

/// Guest path the working directory is mounted at. Expanded by the remote shell.
pub const WORKDIR_MOUNTPOINT: &str = "$HOME/workspace";

/// A host directory shared into the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DirectoryMount {
    /// Mount name, unique among the mounts of one VM.
    pub name: String,
    /// Absolute host path.
    pub host_path: PathBuf,
    /// Virtiofs tag. Empty lets the control plane pick its default.
    pub tag: String,
    /// Export the directory read-only.
    pub read_only: bool,
}

impl DirectoryMount {
    /// Creates a read-write mount with no tag.
    pub fn new(name: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            host_path: host_path.into(),
            tag: String::new(),
            read_only: false,
        }
    }

    /// Sets the virtiofs tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Marks the mount read-only.
    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Serializes the mount as the value of one `--dir` flag.
    ///
    /// `name:path` followed by `:tag=T`, `:ro` or `:tag=T,ro` as needed.
    pub fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.name, self.host_path.display());
        let mut opts = Vec::with_capacity(2);
        if !self.tag.is_empty() {
            opts.push(format!("tag={}", self.tag));
        }
        if self.read_only {
            opts.push("ro".to_owned());
        }
        if !opts.is_empty() {
            arg.push(':');
            arg.push_str(&opts.join(","));
        }
        arg
    }
}

/// Rejects empty names, duplicate names and relative host paths.
pub fn validate_mounts(mounts: &[DirectoryMount]) -> Result<()> {
    let mut seen = HashSet::with_capacity(mounts.len());
    for m in mounts {
        if m.name.trim().is_empty() {
            return Err(Error::InvalidMount(format!(
                "mount name cannot be empty for {}",
                m.host_path.display()
            )));
        }
        if !seen.insert(m.name.as_str()) {
            return Err(Error::InvalidMount(format!(
                "duplicate mount name {:?}",
                m.name
            )));
        }
        if !m.host_path.is_absolute() {
            return Err(Error::InvalidMount(format!(
                "host path for {:?} must be absolute: {}",
                m.name,
                m.host_path.display()
            )));
        }
    }
    Ok(())
}

/// Builds the argument list for the control plane's `run` verb.
pub(crate) fn run_args(mounts: &[DirectoryMount], id: &str) -> Vec<String> {
    let mut args: Vec<String> = ["--no-graphics", "--no-clipboard", "--no-audio"]
        .into_iter()
        .map(str::to_owned)
        .collect();
    for m in mounts {
        args.push("--dir".to_owned());
        args.push(m.to_arg());
    }
    args.push(id.to_owned());
    args
}

/// A virtiofs share mounted inside the guest by a remote shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct RemoteMount {
    /// Virtiofs tag to mount.
    pub tag: String,
    /// Guest mount point. May reference shell variables such as `$HOME`.
    pub mountpoint: String,
}

impl RemoteMount {
    /// The host working directory share.
    pub fn workdir() -> Self {
        Self {
            tag: WORKDIR_TAG.to_owned(),
            mountpoint: WORKDIR_MOUNTPOINT.to_owned(),
        }
    }

    /// Shell command that creates the mount point and mounts the share.
    pub fn mount_command(&self) -> String {
        let dir = shell_quote(&self.mountpoint);
        format!(
            "mkdir -p {dir} && mount_virtiofs {} {dir}",
            shell_quote(&self.tag)
        )
    }

    /// Shell command that unmounts the share.
    pub fn unmount_command(&self) -> String {
        format!("umount {}", shell_quote(&self.mountpoint))
    }

    /// Prefixes `command` so it runs inside the mount point.
    pub fn wrap(&self, command: &str) -> String {
        format!("cd {} && {command}", shell_quote(&self.mountpoint))
    }
}

/// Double-quotes `s` for a POSIX shell, leaving `$` expansion intact.
pub(crate) fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
