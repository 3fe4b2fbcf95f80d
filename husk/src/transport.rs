//! Seams between the session logic and the remote shell transport.
//!
//! The proxy and executor only need a handful of operations from the
//! transport: dial, open a session, request a PTY, obtain pipes, resize,
//! start a command, wait for it and abort it. [`crate::ssh`] provides the real
//! implementation; tests substitute in-memory fakes.

use std::fmt;
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

/// Terminal type requested for interactive sessions.
pub const TERM: &str = "xterm-256color";

/// Baud rate hint sent for both directions of the remote PTY.
pub const PTY_SPEED: u32 = 14_400;

/// Username and password for transport authentication.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Credentials {
    /// Remote user.
    pub user: String,
    /// Password for `user`.
    pub password: String,
}

impl Credentials {
    /// Creates a credentials pair.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct WindowSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Parameters of a remote pseudo-terminal request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PtyRequest {
    /// `TERM` value for the remote side.
    pub term: String,
    /// Initial window size.
    pub size: WindowSize,
    /// Whether the remote PTY echoes input.
    pub echo: bool,
    /// Input baud rate hint.
    pub input_speed: u32,
    /// Output baud rate hint.
    pub output_speed: u32,
}

impl PtyRequest {
    /// Request used for interactive commands: `xterm-256color`, echo on,
    /// 14400 baud both ways.
    pub fn interactive(size: WindowSize) -> Self {
        Self {
            term: TERM.to_owned(),
            size,
            echo: true,
            input_speed: PTY_SPEED,
            output_speed: PTY_SPEED,
        }
    }
}

/// How a remote command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExitStatus {
    /// Exited with a status code.
    Code(i32),
    /// Terminated by the named signal.
    Signal(String),
}

/// Byte streams attached to a remote command.
///
/// Dropping `stdin` signals end of input to the remote command.
pub struct Pipes {
    /// Writes to the command's standard input.
    pub stdin: Box<dyn Write + Send>,
    /// Reads the command's standard output.
    pub stdout: Box<dyn Read + Send>,
    /// Reads the command's standard error.
    pub stderr: Box<dyn Read + Send>,
}

impl fmt::Debug for Pipes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipes").finish_non_exhaustive()
    }
}

/// Establishes authenticated transport connections.
pub trait Dialer: Send + Sync {
    /// Connection type produced by a successful dial.
    type Connection: Connection;

    /// Dials `addr` and authenticates, bounding the whole attempt by `timeout`.
    fn dial(
        &self,
        addr: SocketAddr,
        creds: &Credentials,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Connection>> + Send;
}

/// An authenticated connection that can host command sessions.
pub trait Connection: Send {
    /// Session type opened on this connection.
    type Session: Session;

    /// Opens a new session. Sessions are used one command at a time.
    fn open_session(&self) -> io::Result<Self::Session>;

    /// Closes the connection.
    fn close(self) -> io::Result<()>;
}

/// One remote command execution.
///
/// Calls are blocking; setup calls return quickly, [`wait`](Self::wait)
/// blocks until the remote command has finished or been aborted.
pub trait Session: Send + 'static {
    /// Handle used to forward window size changes.
    type Resizer: Resizer;

    /// Handle used to end the command from another task.
    type Aborter: Aborter;

    /// Requests a remote pseudo-terminal. Must precede [`start`](Self::start).
    fn request_pty(&mut self, req: &PtyRequest) -> io::Result<()>;

    /// Returns the command's stdin/stdout/stderr. Must precede [`start`](Self::start).
    fn pipes(&mut self) -> io::Result<Pipes>;

    /// Returns a handle that resizes the remote PTY.
    fn resizer(&self) -> Self::Resizer;

    /// Returns a handle that ends the command while [`wait`](Self::wait) blocks.
    fn aborter(&self) -> Self::Aborter;

    /// Starts `command` without waiting for it.
    fn start(&mut self, command: &str) -> io::Result<()>;

    /// Blocks until the command finishes and reports how it ended.
    fn wait(self) -> io::Result<ExitStatus>;
}

/// Forwards window size changes to a remote PTY.
pub trait Resizer: Send + 'static {
    /// Resizes the remote PTY.
    fn resize(&self, size: WindowSize) -> io::Result<()>;
}

/// Ends a running remote command early.
///
/// After [`abort`](Self::abort), [`Session::wait`] and reads from the
/// command's output pipes return promptly, usually with an error.
pub trait Aborter: Send + 'static {
    /// Tears down the command's transport.
    fn abort(&self) -> io::Result<()>;
}
