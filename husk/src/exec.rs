//! Non-interactive command execution and the stream plumbing it shares
//! with the terminal proxy.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::console::Console;
use crate::transport::{Aborter, ExitStatus, Pipes, Session};
use crate::{Error, Result};

/// How long one local input poll waits before rechecking for cancellation.
pub(crate) const INPUT_POLL: Duration = Duration::from_millis(100);

/// Runs remote commands without a PTY, forwarding output line by line.
#[derive(Debug)]
pub struct NonInteractiveExecutor<C> {
    /// Local streams.
    console: Arc<C>,
}

impl<C: Console> NonInteractiveExecutor<C> {
    /// Creates an executor writing to `console`.
    pub const fn new(console: Arc<C>) -> Self {
        Self { console }
    }

    /// Runs `command` to completion with local stdin/stdout/stderr attached.
    ///
    /// Local input is forwarded until it ends or the command finishes. If
    /// `scope` is cancelled first the remote command is aborted, every
    /// stream task is joined, and [`Error::Cancelled`] is returned.
    pub async fn run<S: Session>(
        &self,
        mut session: S,
        command: &str,
        scope: &CancellationToken,
    ) -> Result<()> {
        let Pipes {
            stdin,
            stdout,
            stderr,
        } = session.pipes().map_err(Error::setup("open pipes"))?;
        session
            .start(command)
            .map_err(Error::setup("start command"))?;
        tracing::debug!(command, "non-interactive command started");

        let streams = scope.child_token();
        let input = {
            let console = Arc::clone(&self.console);
            let stop = streams.clone();
            tokio::task::spawn_blocking(move || forward_input(&*console, stdin, &stop))
        };
        let out = {
            let sink = self.console.stdout();
            tokio::task::spawn_blocking(move || forward_lines(stdout, sink))
        };
        let err = {
            let sink = self.console.stderr();
            tokio::task::spawn_blocking(move || forward_lines(stderr, sink))
        };

        let status = wait_or_abort(session, scope).await;
        streams.cancel();
        let (input, out, err) = tokio::join!(input, out, err);
        log_stream("stdin", join_blocking(input));
        log_stream("stdout", join_blocking(out));
        log_stream("stderr", join_blocking(err));

        check_exit(&status?)
    }
}

/// Waits for the started command in `session`.
///
/// If `scope` fires first the command is aborted and the wait is still
/// joined before [`Error::Cancelled`] is returned. The caller joins the
/// stream tasks.
pub(crate) async fn wait_or_abort<S: Session>(
    session: S,
    scope: &CancellationToken,
) -> Result<ExitStatus> {
    let aborter = session.aborter();
    let mut wait = tokio::task::spawn_blocking(move || session.wait());
    tokio::select! {
        biased;
        res = &mut wait => {
            return join_blocking(res).and_then(|r| r).map_err(Error::Transport);
        }
        () = scope.cancelled() => {}
    }
    tracing::debug!("cancelled, aborting remote command");
    if let Err(e) = aborter.abort() {
        tracing::debug!(error = %e, "failed to abort remote command");
    }
    log_stream("wait", join_blocking(wait.await));
    Err(Error::Cancelled)
}

/// Runs `command` with no input and returns its stderr on success or failure.
///
/// Used for housekeeping commands whose output is not shown to the operator.
pub(crate) async fn run_quiet<S: Session>(
    mut session: S,
    command: &str,
    scope: &CancellationToken,
) -> Result<String> {
    let Pipes {
        stdin,
        mut stdout,
        mut stderr,
    } = session.pipes().map_err(Error::setup("open pipes"))?;
    session
        .start(command)
        .map_err(Error::setup("start command"))?;
    drop(stdin);

    let out = tokio::task::spawn_blocking(move || io::copy(&mut stdout, &mut io::sink()));
    let err = tokio::task::spawn_blocking(move || {
        let mut buf = String::new();
        stderr.read_to_string(&mut buf).map(|_| buf)
    });
    let status = wait_or_abort(session, scope).await;
    let (out, err) = tokio::join!(out, err);
    log_stream("stdout", join_blocking(out));
    let stderr = join_blocking(err).and_then(|r| r).unwrap_or_default();

    if let Err(e) = check_exit(&status?) {
        tracing::debug!(command, stderr = stderr.trim(), error = %e, "quiet command failed");
        return Err(e);
    }
    Ok(stderr)
}

/// Maps a remote exit status onto the shared error taxonomy.
pub(crate) fn check_exit(status: &ExitStatus) -> Result<()> {
    match status {
        ExitStatus::Code(0) => Ok(()),
        ExitStatus::Code(code) => Err(Error::RemoteCommandFailed { code: *code }),
        ExitStatus::Signal(signal) => Err(Error::RemoteCommandKilled {
            signal: signal.clone(),
        }),
    }
}

/// Copies local input to the remote stdin until input ends or `stop` fires.
///
/// Dropping `remote` on return signals end of input to the remote side.
pub(crate) fn forward_input<C: Console + ?Sized>(
    console: &C,
    mut remote: Box<dyn Write + Send>,
    stop: &CancellationToken,
) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    while !stop.is_cancelled() {
        match console.read_input(&mut buf, INPUT_POLL)? {
            None => {}
            Some(0) => break,
            Some(n) => {
                remote.write_all(&buf[..n])?;
                remote.flush()?;
            }
        }
    }
    Ok(())
}

/// Copies raw bytes from `from` to `to`, flushing after every chunk.
pub(crate) fn copy_output(
    mut from: Box<dyn Read + Send>,
    mut to: Box<dyn Write + Send>,
) -> io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut total = 0;
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        to.write_all(&buf[..n])?;
        to.flush()?;
        total += n as u64;
    }
    Ok(total)
}

/// Copies `from` to `to` one line at a time, terminating every line with `\n`.
pub(crate) fn forward_lines(
    from: Box<dyn Read + Send>,
    mut to: Box<dyn Write + Send>,
) -> io::Result<u64> {
    let mut reader = BufReader::new(from);
    let mut line = Vec::new();
    let mut lines = 0;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        to.write_all(&line)?;
        to.flush()?;
        lines += 1;
    }
    Ok(lines)
}

/// Unwraps a blocking task's result, re-raising its panic.
pub(crate) fn join_blocking<T>(res: std::result::Result<T, JoinError>) -> io::Result<T> {
    match res {
        Ok(v) => Ok(v),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Logs a finished stream task that failed. Stream errors are not fatal.
pub(crate) fn log_stream<T>(name: &str, res: io::Result<io::Result<T>>) {
    if let Err(e) = res.and_then(|r| r) {
        tracing::debug!(stream = name, error = %e, "stream copy ended with error");
    }
}
