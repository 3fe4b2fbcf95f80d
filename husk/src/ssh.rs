//! SSH transport backed by `ssh2` (libssh2).
//!
//! Setup calls run with the session in blocking mode. Once a command has
//! been started the session switches to non-blocking mode so the stdin,
//! stdout and stderr threads and the resizer can share it: libssh2
//! serializes every call on one session lock, and a blocking read would
//! hold that lock until data arrives. A call that would block waits in
//! `poll(2)` on the socket for the direction libssh2 reports it is blocked
//! on, then retries.
//!
//! Aborting a session shuts the socket down, which ends every pending call
//! on the connection with an error. The connection is unusable afterwards.
//!
//! Host keys are not verified. The peer is a freshly cloned VM on a
//! host-only network whose key changes every run.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use ssh2::{BlockDirections, Channel, PtyModeOpcode, PtyModes};
use tokio::net::TcpStream;

use crate::transport::{self, Credentials, Dialer, ExitStatus, Pipes, PtyRequest, WindowSize};

/// Upper bound in milliseconds on one readiness wait.
///
/// Threads share the session, so the packet one thread waits for may be
/// read off the socket by another.
const POLL_TIMEOUT_MS: u16 = 50;

/// Dials SSH servers with password authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshDialer;

impl Dialer for SshDialer {
    type Connection = SshConnection;

    async fn dial(
        &self,
        addr: SocketAddr,
        creds: &Credentials,
        timeout: Duration,
    ) -> io::Result<SshConnection> {
        let deadline = Instant::now() + timeout;
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        let tcp = tcp.into_std()?;
        tcp.set_nonblocking(false)?;

        let budget = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        let creds = creds.clone();
        tokio::task::spawn_blocking(move || handshake(tcp, &creds, budget))
            .await
            .map_err(io::Error::other)?
    }
}

/// Performs the SSH handshake and password authentication within `budget`.
fn handshake(
    tcp: std::net::TcpStream,
    creds: &Credentials,
    budget: Duration,
) -> io::Result<SshConnection> {
    let handle = Arc::new(tcp.try_clone()?);
    let mut session = ssh2::Session::new()?;
    session.set_timeout(u32::try_from(budget.as_millis()).unwrap_or(u32::MAX));
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_password(&creds.user, &creds.password)?;
    if !session.authenticated() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("authentication failed for user {}", creds.user),
        ));
    }
    // The budget only bounds the attempt; commands run for as long as they need.
    session.set_timeout(0);
    Ok(SshConnection {
        socket: Socket {
            session,
            tcp: handle,
        },
    })
}

/// The libssh2 session together with its socket.
#[derive(Clone)]
struct Socket {
    /// Underlying libssh2 session.
    session: ssh2::Session,
    /// Second handle on the session's TCP stream, for polling and shutdown.
    tcp: Arc<std::net::TcpStream>,
}

impl Socket {
    /// Repeats `op` while it reports `WouldBlock`.
    fn retry<T>(&self, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        loop {
            match op() {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_ready()?,
                other => return other,
            }
        }
    }

    /// Waits until the socket is ready in the direction libssh2 is blocked
    /// on, or [`POLL_TIMEOUT_MS`] passes.
    fn wait_ready(&self) -> io::Result<()> {
        let flags = match self.session.block_directions() {
            BlockDirections::Outbound => PollFlags::POLLOUT,
            BlockDirections::Both => PollFlags::POLLIN | PollFlags::POLLOUT,
            _ => PollFlags::POLLIN,
        };
        let mut fds = [PollFd::new(self.tcp.as_fd(), flags)];
        match poll(&mut fds, POLL_TIMEOUT_MS) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// An authenticated SSH connection.
pub struct SshConnection {
    /// Session and socket shared with every channel.
    socket: Socket,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection").finish_non_exhaustive()
    }
}

impl transport::Connection for SshConnection {
    type Session = SshSession;

    fn open_session(&self) -> io::Result<SshSession> {
        self.socket.session.set_blocking(true);
        let channel = self.socket.session.channel_session()?;
        Ok(SshSession {
            socket: self.socket.clone(),
            channel,
        })
    }

    fn close(self) -> io::Result<()> {
        self.socket.session.set_blocking(true);
        self.socket
            .session
            .disconnect(None, "session finished", None)?;
        Ok(())
    }
}

/// One command channel on an [`SshConnection`].
pub struct SshSession {
    /// Session shared with the connection, for switching blocking mode.
    socket: Socket,
    /// The command channel.
    channel: Channel,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession").finish_non_exhaustive()
    }
}

impl transport::Session for SshSession {
    type Resizer = SshResizer;
    type Aborter = SshAborter;

    fn request_pty(&mut self, req: &PtyRequest) -> io::Result<()> {
        let mut modes = PtyModes::new();
        modes.set_u32(PtyModeOpcode::ECHO, u32::from(req.echo));
        modes.set_u32(PtyModeOpcode::TTY_OP_ISPEED, req.input_speed);
        modes.set_u32(PtyModeOpcode::TTY_OP_OSPEED, req.output_speed);
        self.channel.request_pty(
            &req.term,
            Some(modes),
            Some((u32::from(req.size.cols), u32::from(req.size.rows), 0, 0)),
        )?;
        Ok(())
    }

    fn pipes(&mut self) -> io::Result<Pipes> {
        Ok(Pipes {
            stdin: Box::new(ChannelWriter {
                socket: self.socket.clone(),
                channel: self.channel.clone(),
            }),
            stdout: Box::new(RetryReader {
                socket: self.socket.clone(),
                stream: self.channel.stream(0),
            }),
            stderr: Box::new(RetryReader {
                socket: self.socket.clone(),
                stream: self.channel.stderr(),
            }),
        })
    }

    fn resizer(&self) -> SshResizer {
        SshResizer {
            socket: self.socket.clone(),
            channel: self.channel.clone(),
        }
    }

    fn aborter(&self) -> SshAborter {
        SshAborter {
            tcp: Arc::clone(&self.socket.tcp),
        }
    }

    fn start(&mut self, command: &str) -> io::Result<()> {
        self.channel.exec(command)?;
        self.socket.session.set_blocking(false);
        Ok(())
    }

    fn wait(mut self) -> io::Result<ExitStatus> {
        let socket = &self.socket;
        let channel = &mut self.channel;
        socket.retry(|| channel.wait_eof().map_err(io::Error::from))?;
        socket.retry(|| channel.close().map_err(io::Error::from))?;
        socket.retry(|| channel.wait_close().map_err(io::Error::from))?;

        let signal = socket.retry(|| channel.exit_signal().map_err(io::Error::from))?;
        if let Some(name) = signal.exit_signal {
            return Ok(ExitStatus::Signal(name));
        }
        Ok(ExitStatus::Code(channel.exit_status()?))
    }
}

/// Resizes the remote PTY of an [`SshSession`].
pub struct SshResizer {
    /// Session the channel belongs to.
    socket: Socket,
    /// Clone of the command channel.
    channel: Channel,
}

impl std::fmt::Debug for SshResizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshResizer").finish_non_exhaustive()
    }
}

impl transport::Resizer for SshResizer {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        let mut channel = self.channel.clone();
        self.socket.retry(|| {
            channel
                .request_pty_size(u32::from(size.cols), u32::from(size.rows), None, None)
                .map_err(io::Error::from)
        })
    }
}

/// Ends an [`SshSession`] by shutting down the connection's socket.
#[derive(Debug)]
pub struct SshAborter {
    /// Handle on the connection's TCP stream.
    tcp: Arc<std::net::TcpStream>,
}

impl transport::Aborter for SshAborter {
    fn abort(&self) -> io::Result<()> {
        match self.tcp.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Reader that waits out `WouldBlock` on a non-blocking session.
struct RetryReader {
    /// Session the stream belongs to.
    socket: Socket,
    /// One of the channel's data streams.
    stream: ssh2::Stream,
}

impl Read for RetryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = &mut self.stream;
        self.socket.retry(|| stream.read(buf))
    }
}

/// Writer for the channel's stdin; sends EOF when dropped.
struct ChannelWriter {
    /// Session the channel belongs to.
    socket: Socket,
    /// Clone of the command channel.
    channel: Channel,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let channel = &mut self.channel;
        self.socket.retry(|| channel.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        let channel = &mut self.channel;
        self.socket.retry(|| channel.flush())
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        // Fails once the channel is closed, which is fine.
        let channel = &mut self.channel;
        let _ = self
            .socket
            .retry(|| channel.send_eof().map_err(io::Error::from));
    }
}
