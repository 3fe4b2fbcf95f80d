//! Error types for husk operations.

use std::io;
use std::net::SocketAddr;

/// Alias for `Result<T, husk::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by husk session operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The VM control binary could not be located.
    #[error("{program} command not found in PATH, make sure it is installed")]
    ControlPlaneNotFound {
        /// Program name or path that was looked up.
        program: String,
    },

    /// The VM control binary ran but exited non-zero.
    #[error("{program} {verb} failed: {message:?}")]
    ControlPlaneFailed {
        /// Program name or path that was invoked.
        program: String,
        /// The verb (`clone`, `run`, `ip`, ...) that failed.
        verb: String,
        /// First non-empty line of stderr, falling back to stdout.
        message: String,
    },

    /// The transport never became reachable before the waiter gave up.
    #[error("failed to connect to {addr} after {attempts} attempt(s)")]
    ConnectionUnavailable {
        /// Address that was dialed.
        addr: SocketAddr,
        /// Number of dial attempts made.
        attempts: u32,
        /// The last dial or handshake failure.
        #[source]
        source: io::Error,
    },

    /// Session, PTY or pipe setup failed on an established connection.
    #[error("failed to {stage}")]
    SessionSetup {
        /// Setup step that failed (`open session`, `request pty`, ...).
        stage: &'static str,
        /// Underlying transport error.
        #[source]
        source: io::Error,
    },

    /// The remote command ran and exited with a non-zero code.
    #[error("command exited with status {code}")]
    RemoteCommandFailed {
        /// Remote exit code.
        code: i32,
    },

    /// The remote command was terminated by a signal.
    #[error("command terminated by signal {signal}")]
    RemoteCommandKilled {
        /// Signal name reported by the remote side (e.g. `KILL`).
        signal: String,
    },

    /// The transport failed while a remote command was running.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),

    /// The local terminal could not be queried or reconfigured.
    #[error("terminal: {0}")]
    Terminal(#[source] io::Error),

    /// A directory mount was rejected before any VM was touched.
    #[error("invalid directory mount: {0}")]
    InvalidMount(String),

    /// An operation was attempted in a lifecycle state that forbids it.
    #[error("cannot {op} VM {vm} while {state}")]
    InvalidState {
        /// The attempted operation.
        op: &'static str,
        /// VM identity.
        vm: String,
        /// Current lifecycle state.
        state: &'static str,
    },

    /// The control plane reported an address that does not parse.
    #[error("invalid VM address {0:?}")]
    InvalidAddress(String),

    /// The VM's run process ended before it became usable.
    #[error("VM {vm} failed to start: {reason}")]
    VmExited {
        /// VM identity.
        vm: String,
        /// Description of how the run process ended.
        reason: String,
    },

    /// The operator cancelled the session.
    #[error("cancelled")]
    Cancelled,

    /// An I/O error from spawning or local stream handling.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the remote exit code when the error is a remote command failure.
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::RemoteCommandFailed { code } => Some(*code),
            _ => None,
        }
    }

    /// Builds a [`SessionSetup`](Self::SessionSetup) mapper for `map_err`.
    pub(crate) fn setup(stage: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::SessionSetup { stage, source }
    }
}
