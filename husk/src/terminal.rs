//! Interactive terminal proxy.
//!
//! Attaches the local terminal to a remote command as if it ran locally:
//! the local terminal goes raw, the remote side gets a PTY of the same size,
//! three copy threads move bytes, and a watcher forwards window changes.
//!
//! Ordering:
//! - the remote command starts only after the PTY and pipes exist;
//! - the stream scope is cancelled only once the command has finished or
//!   been aborted;
//! - the terminal is restored only after every stream task has been joined.
//!
//! Raw mode is held by [`RawModeGuard`], which restores the saved settings
//! exactly once whether the session returns normally, fails during setup,
//! or unwinds from a panic.

use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::console::{Console, ResizeEvents};
use crate::exec::{self, NonInteractiveExecutor};
use crate::transport::{Pipes, PtyRequest, Resizer, Session, WindowSize};
use crate::{Error, Result};

/// Proxies remote commands through the local terminal.
#[derive(Debug)]
pub struct TerminalProxy<C> {
    /// Local terminal.
    console: Arc<C>,
}

impl<C: Console> TerminalProxy<C> {
    /// Creates a proxy over `console`.
    pub const fn new(console: Arc<C>) -> Self {
        Self { console }
    }

    /// Runs `command` in `session`.
    ///
    /// Without a local terminal the command runs non-interactively. A
    /// non-zero remote exit is reported as [`Error::RemoteCommandFailed`].
    /// Cancelling `scope` aborts the remote command; the terminal is still
    /// restored only after every stream task has been joined.
    pub async fn run<S: Session>(
        &self,
        session: S,
        command: &str,
        scope: &CancellationToken,
    ) -> Result<()> {
        if !self.console.is_terminal() {
            tracing::debug!("stdin is not a terminal, running non-interactively");
            return NonInteractiveExecutor::new(Arc::clone(&self.console))
                .run(session, command, scope)
                .await;
        }
        self.run_interactive(session, command, scope).await
    }

    /// The raw-mode path of [`run`](Self::run).
    async fn run_interactive<S: Session>(
        &self,
        mut session: S,
        command: &str,
        scope: &CancellationToken,
    ) -> Result<()> {
        let size = self.console.size().map_err(Error::Terminal)?;
        let events = self.console.resize_events().map_err(Error::Terminal)?;
        let mut guard =
            RawModeGuard::enter(Arc::clone(&self.console)).map_err(Error::Terminal)?;

        session
            .request_pty(&PtyRequest::interactive(size))
            .map_err(Error::setup("request pty"))?;
        let Pipes {
            stdin,
            stdout,
            stderr,
        } = session.pipes().map_err(Error::setup("open pipes"))?;
        let resizer = session.resizer();
        session
            .start(command)
            .map_err(Error::setup("start command"))?;
        tracing::debug!(
            rows = size.rows,
            cols = size.cols,
            command,
            "interactive command started"
        );

        let streams = scope.child_token();
        let input = {
            let console = Arc::clone(&self.console);
            let stop = streams.clone();
            tokio::task::spawn_blocking(move || exec::forward_input(&*console, stdin, &stop))
        };
        let out = {
            let sink = self.console.stdout();
            tokio::task::spawn_blocking(move || exec::copy_output(stdout, sink))
        };
        let err = {
            let sink = self.console.stderr();
            tokio::task::spawn_blocking(move || exec::copy_output(stderr, sink))
        };

        let watcher = watch_resizes(
            events,
            Arc::clone(&self.console),
            resizer,
            streams.clone(),
            size,
        );
        let waiter = async {
            let status = exec::wait_or_abort(session, scope).await;
            streams.cancel();
            status
        };
        let (_, status) = tokio::join!(watcher, waiter);
        let (input, out, err) = tokio::join!(input, out, err);

        if let Err(e) = guard.restore() {
            tracing::warn!(error = %e, "failed to restore terminal");
        }

        exec::log_stream("stdin", exec::join_blocking(input));
        exec::log_stream("stdout", exec::join_blocking(out));
        exec::log_stream("stderr", exec::join_blocking(err));
        exec::check_exit(&status?)
    }
}

/// Forwards window changes until `stop` fires, returning the last size sent.
async fn watch_resizes<C: Console, R: Resizer>(
    mut events: C::Resize,
    console: Arc<C>,
    resizer: R,
    stop: CancellationToken,
    mut active: WindowSize,
) -> WindowSize {
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            event = events.recv() => {
                if event.is_none() {
                    break;
                }
                let size = match console.size() {
                    Ok(size) => size,
                    Err(e) => {
                        tracing::debug!(error = %e, "failed to read window size");
                        continue;
                    }
                };
                match resizer.resize(size) {
                    Ok(()) => active = size,
                    Err(e) => tracing::debug!(error = %e, "failed to resize remote pty"),
                }
            }
        }
    }
    active
}

/// Holds the terminal in raw mode and restores it exactly once.
struct RawModeGuard<C: Console> {
    /// Terminal the settings belong to.
    console: Arc<C>,
    /// Settings to restore; taken on first restore.
    saved: Option<C::Saved>,
}

impl<C: Console> RawModeGuard<C> {
    /// Switches `console` to raw mode.
    fn enter(console: Arc<C>) -> io::Result<Self> {
        let saved = console.make_raw()?;
        Ok(Self {
            console,
            saved: Some(saved),
        })
    }

    /// Restores the saved settings. Later calls do nothing.
    fn restore(&mut self) -> io::Result<()> {
        match self.saved.take() {
            Some(saved) => self.console.restore(saved),
            None => Ok(()),
        }
    }
}

impl<C: Console> Drop for RawModeGuard<C> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::warn!(error = %e, "failed to restore terminal");
        }
    }
}
