//! Disposable VM sessions with a faithful local terminal.
//!
//! `husk` clones a VM through an external control plane (`tart` by
//! default), waits for it to boot, connects over SSH and runs one command
//! in it with the operator's terminal attached: raw mode, a matching remote
//! PTY, live window resizing and exactly-once terminal restore. The VM is
//! stopped and deleted afterwards on every exit path.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use husk::{Sandbox, SandboxConfig, SshDialer, StdConsole};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> husk::Result<()> {
//! let config = SandboxConfig::new("husk-seed", "cargo test")
//!     .cpus(4)
//!     .memory_mib(8192)
//!     .workdir(std::env::current_dir()?);
//! let sandbox = Sandbox::new(config, SshDialer, Arc::new(StdConsole));
//! sandbox
//!     .run(&CancellationToken::new(), |msg| eprintln!("{msg}"))
//!     .await
//! # }
//! ```
//!
//! The pieces are usable on their own: [`Vm`] for the lifecycle,
//! [`ConnectionWaiter`] for boot-time connection retries, [`TerminalProxy`]
//! and [`NonInteractiveExecutor`] for running commands on any [`Session`].

mod error;

#[cfg(unix)]
pub mod connect;
#[cfg(unix)]
pub mod console;
#[cfg(unix)]
pub mod control;
#[cfg(unix)]
mod exec;
#[cfg(unix)]
pub mod mount;
#[cfg(unix)]
mod sandbox;
#[cfg(unix)]
pub mod ssh;
#[cfg(unix)]
mod terminal;
#[cfg(unix)]
pub mod transport;
#[cfg(unix)]
pub mod vm;

#[cfg(all(test, unix))]
mod testutil;

#[cfg(unix)]
pub use connect::ConnectionWaiter;
#[cfg(unix)]
pub use console::{Console, StdConsole};
#[cfg(unix)]
pub use control::{ControlPlane, Env};
pub use error::{Error, Result};
#[cfg(unix)]
pub use exec::NonInteractiveExecutor;
#[cfg(unix)]
pub use mount::{DirectoryMount, RemoteMount};
#[cfg(unix)]
pub use sandbox::{Sandbox, SandboxConfig};
#[cfg(unix)]
pub use ssh::SshDialer;
#[cfg(unix)]
pub use terminal::TerminalProxy;
#[cfg(unix)]
pub use transport::{Connection, Credentials, Dialer, ExitStatus, Session, WindowSize};
#[cfg(unix)]
pub use vm::{RunState, Vm, VmExit};
