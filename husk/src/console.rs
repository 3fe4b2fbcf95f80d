//! The operator's local terminal.
//!
//! [`Console`] is the seam the terminal proxy and executor talk to; it
//! covers TTY detection, window size, raw mode, cancellable input reads,
//! output streams and window-change notifications. [`StdConsole`] is the
//! real implementation over the process's standard streams.

#![allow(unsafe_code)]

use std::future::Future;
use std::io::{self, IsTerminal, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::termios::{self, SetArg, Termios};
use tokio::signal::unix::{Signal, SignalKind, signal};

use crate::transport::WindowSize;

/// Local terminal operations used while proxying a remote command.
pub trait Console: Send + Sync + 'static {
    /// Terminal settings captured before entering raw mode.
    type Saved: Send + 'static;
    /// Window-change subscription.
    type Resize: ResizeEvents;

    /// Returns `true` if standard input is an interactive terminal.
    fn is_terminal(&self) -> bool;

    /// Returns the current window size.
    fn size(&self) -> io::Result<WindowSize>;

    /// Switches the terminal to raw mode, returning the previous settings.
    fn make_raw(&self) -> io::Result<Self::Saved>;

    /// Reapplies settings captured by [`make_raw`](Self::make_raw).
    fn restore(&self, saved: Self::Saved) -> io::Result<()>;

    /// Reads available input, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if nothing arrived in time and `Ok(Some(0))` at
    /// end of input.
    fn read_input(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Returns a writer for local standard output.
    fn stdout(&self) -> Box<dyn Write + Send>;

    /// Returns a writer for local standard error.
    fn stderr(&self) -> Box<dyn Write + Send>;

    /// Subscribes to window-change notifications.
    fn resize_events(&self) -> io::Result<Self::Resize>;
}

/// A stream of window-change notifications.
pub trait ResizeEvents: Send + 'static {
    /// Waits for the next change. `None` means no more changes will arrive.
    fn recv(&mut self) -> impl Future<Output = Option<()>> + Send;
}

/// The process's own stdin/stdout/stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdConsole;

impl Console for StdConsole {
    type Saved = Termios;
    type Resize = WindowChanges;

    fn is_terminal(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn size(&self) -> io::Result<WindowSize> {
        window_size(io::stdout().as_fd()).or_else(|_| window_size(io::stdin().as_fd()))
    }

    fn make_raw(&self) -> io::Result<Termios> {
        let stdin = io::stdin();
        let saved = termios::tcgetattr(stdin.as_fd())?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;
        Ok(saved)
    }

    fn restore(&self, saved: Termios) -> io::Result<()> {
        termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &saved)?;
        Ok(())
    }

    fn read_input(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        // Reads bypass `Stdin`'s buffer so poll readiness matches what read returns.
        let stdin = io::stdin();
        let fd = stdin.as_fd();
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, ms) {
            Ok(0) | Err(Errno::EINTR) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        match nix::unistd::read(fd, buf) {
            Ok(n) => Ok(Some(n)),
            Err(Errno::EINTR | Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(io::stdout())
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(io::stderr())
    }

    fn resize_events(&self) -> io::Result<WindowChanges> {
        signal(SignalKind::window_change()).map(WindowChanges)
    }
}

/// `SIGWINCH` subscription.
#[derive(Debug)]
pub struct WindowChanges(Signal);

impl ResizeEvents for WindowChanges {
    fn recv(&mut self) -> impl Future<Output = Option<()>> + Send {
        self.0.recv()
    }
}

/// Queries the window size of the terminal behind `fd`.
fn window_size(fd: BorrowedFd<'_>) -> io::Result<WindowSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes one `winsize` through the pointer, which is valid.
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &raw mut ws) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(WindowSize {
        rows: ws.ws_row,
        cols: ws.ws_col,
    })
}
