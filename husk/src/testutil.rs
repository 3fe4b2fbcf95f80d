//! Test doubles for the control plane, transport and console seams.

use std::collections::VecDeque;
use std::fs;
use std::future::Future;
use std::io::{self, Cursor, Read, Write};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc as std_mpsc};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::console::{Console, ResizeEvents};
use crate::control::ControlPlane;
use crate::transport::{
    Aborter, Connection, Credentials, Dialer, ExitStatus, Pipes, PtyRequest, Resizer, Session,
    WindowSize,
};

/// Shared, ordered record of what a fake saw.
pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

/// Writes an executable shell script named `fake-tart` into `dir`.
pub(crate) fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-tart");
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A fake control plane that appends every invocation to a log file.
///
/// `ip` prints a fixed address (or garbage for a VM named `no-ip`); `run`
/// executes `run_body`; every other verb succeeds silently.
pub(crate) fn fake_control_plane(dir: &Path, run_body: &str) -> (ControlPlane, PathBuf) {
    let log = dir.join("invocations.log");
    fs::write(&log, "").unwrap();
    let body = format!(
        r#"echo "$*" >> '{log}'
case "$1" in
  ip)
    case "$4" in
      no-ip) echo not-an-ip ;;
      *) echo "  192.168.64.7  " ;;
    esac ;;
  run) {run_body} ;;
esac
"#,
        log = log.display(),
    );
    (ControlPlane::new(script(dir, &body)), log)
}

/// Reads the invocation log written by [`fake_control_plane`].
pub(crate) fn read_log(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect()
}

/// Polls `check` until it holds, failing after ten seconds.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// A cloneable in-memory writer.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A latch that blocks callers of [`Gate::wait`] until opened.
#[derive(Debug, Clone, Default)]
pub(crate) struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub(crate) fn open(&self) {
        let (open, cv) = &*self.0;
        *open.lock().unwrap() = true;
        cv.notify_all();
    }

    fn wait(&self) {
        let (open, cv) = &*self.0;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = cv.wait(guard).unwrap();
        }
    }
}

/// Scripted local terminal.
#[derive(Debug)]
pub(crate) struct FakeConsole {
    tty: bool,
    size: Mutex<WindowSize>,
    raw: AtomicUsize,
    restored: AtomicUsize,
    input: Mutex<VecDeque<Vec<u8>>>,
    input_closed: AtomicBool,
    stdout: SharedBuf,
    stderr: SharedBuf,
    resize_tx: mpsc::UnboundedSender<()>,
    resize_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    events: Mutex<Option<EventLog>>,
}

impl FakeConsole {
    fn build(tty: bool, size: WindowSize) -> Arc<Self> {
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tty,
            size: Mutex::new(size),
            raw: AtomicUsize::new(0),
            restored: AtomicUsize::new(0),
            input: Mutex::new(VecDeque::new()),
            input_closed: AtomicBool::new(false),
            stdout: SharedBuf::default(),
            stderr: SharedBuf::default(),
            resize_tx,
            resize_rx: Mutex::new(Some(resize_rx)),
            events: Mutex::new(None),
        })
    }

    /// An interactive terminal of the given size.
    pub(crate) fn tty(size: WindowSize) -> Arc<Self> {
        Self::build(true, size)
    }

    /// Standard input redirected from a pipe.
    pub(crate) fn pipe() -> Arc<Self> {
        Self::build(false, WindowSize::default())
    }

    pub(crate) fn push_input(&self, bytes: &[u8]) {
        self.input.lock().unwrap().push_back(bytes.to_vec());
    }

    pub(crate) fn close_input(&self) {
        self.input_closed.store(true, Ordering::SeqCst);
    }

    /// Appends `"restore"` to `log` on every restore.
    pub(crate) fn record_restores(&self, log: EventLog) {
        *self.events.lock().unwrap() = Some(log);
    }

    pub(crate) fn set_size(&self, size: WindowSize) {
        *self.size.lock().unwrap() = size;
    }

    pub(crate) fn resize_sender(&self) -> mpsc::UnboundedSender<()> {
        self.resize_tx.clone()
    }

    pub(crate) fn raw_calls(&self) -> usize {
        self.raw.load(Ordering::SeqCst)
    }

    pub(crate) fn restore_calls(&self) -> usize {
        self.restored.load(Ordering::SeqCst)
    }

    pub(crate) fn stdout_text(&self) -> String {
        self.stdout.contents()
    }

    pub(crate) fn stderr_text(&self) -> String {
        self.stderr.contents()
    }
}

impl Console for FakeConsole {
    type Saved = ();
    type Resize = FakeResize;

    fn is_terminal(&self) -> bool {
        self.tty
    }

    fn size(&self) -> io::Result<WindowSize> {
        Ok(*self.size.lock().unwrap())
    }

    fn make_raw(&self) -> io::Result<()> {
        self.raw.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self, (): ()) -> io::Result<()> {
        self.restored.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &*self.events.lock().unwrap() {
            log.lock().unwrap().push("restore".to_owned());
        }
        Ok(())
    }

    fn read_input(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if let Some(chunk) = self.input.lock().unwrap().pop_front() {
            buf[..chunk.len()].copy_from_slice(&chunk);
            return Ok(Some(chunk.len()));
        }
        if self.input_closed.load(Ordering::SeqCst) {
            return Ok(Some(0));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    }

    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(self.stdout.clone())
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(self.stderr.clone())
    }

    fn resize_events(&self) -> io::Result<FakeResize> {
        self.resize_rx
            .lock()
            .unwrap()
            .take()
            .map(FakeResize)
            .ok_or_else(|| io::Error::other("already subscribed"))
    }
}

/// Window changes delivered through a channel.
#[derive(Debug)]
pub(crate) struct FakeResize(mpsc::UnboundedReceiver<()>);

impl ResizeEvents for FakeResize {
    fn recv(&mut self) -> impl Future<Output = Option<()>> + Send {
        self.0.recv()
    }
}

/// Records every resize it is asked to forward.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeResizer {
    resizes: Arc<Mutex<Vec<WindowSize>>>,
}

impl Resizer for FakeResizer {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        self.resizes.lock().unwrap().push(size);
        Ok(())
    }
}

/// Remote stdin that records writes and reports when it is dropped.
struct FakeStdin {
    buf: SharedBuf,
    _closed: Option<std_mpsc::Sender<()>>,
}

impl Write for FakeStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Remote output that holds off end of stream until its gate opens.
struct GatedReader {
    data: Cursor<Vec<u8>>,
    gate: Option<Gate>,
    name: &'static str,
    log: EventLog,
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.data.read(buf)?;
        if n == 0 {
            if let Some(gate) = self.gate.take() {
                gate.wait();
                self.log.lock().unwrap().push(format!("{} eof", self.name));
            }
        }
        Ok(n)
    }
}

/// Logs `"abort"` and opens the session's gate.
#[derive(Debug)]
pub(crate) struct FakeAborter {
    gate: Option<Gate>,
    log: EventLog,
}

impl Aborter for FakeAborter {
    fn abort(&self) -> io::Result<()> {
        self.log.lock().unwrap().push("abort".to_owned());
        if let Some(gate) = &self.gate {
            gate.open();
        }
        Ok(())
    }
}

/// Scripted remote command session.
#[derive(Debug)]
pub(crate) struct FakeSession {
    log: EventLog,
    fail_at: Option<&'static str>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdin: SharedBuf,
    exit: Result<ExitStatus, io::ErrorKind>,
    gate: Option<Gate>,
    stdin_open: Option<std_mpsc::Sender<()>>,
    stdin_eof: Option<std_mpsc::Receiver<()>>,
    resizer: FakeResizer,
}

impl FakeSession {
    pub(crate) fn new() -> Self {
        Self {
            log: Arc::default(),
            fail_at: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdin: SharedBuf::default(),
            exit: Ok(ExitStatus::Code(0)),
            gate: None,
            stdin_open: None,
            stdin_eof: None,
            resizer: FakeResizer::default(),
        }
    }

    pub(crate) fn stdout(mut self, bytes: &[u8]) -> Self {
        self.stdout = bytes.to_vec();
        self
    }

    pub(crate) fn stderr(mut self, bytes: &[u8]) -> Self {
        self.stderr = bytes.to_vec();
        self
    }

    pub(crate) fn exit(mut self, status: ExitStatus) -> Self {
        self.exit = Ok(status);
        self
    }

    pub(crate) fn wait_error(mut self, kind: io::ErrorKind) -> Self {
        self.exit = Err(kind);
        self
    }

    /// Fails at `"pty"`, `"pipes"` or `"start"`.
    pub(crate) fn fail_at(mut self, stage: &'static str) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Makes `wait` and the end of both output streams block until the
    /// returned gate opens or the session is aborted. Each is logged
    /// (`"wait done"`, `"stdout eof"`, `"stderr eof"`) once released.
    pub(crate) fn gated(mut self) -> (Self, Gate) {
        let gate = Gate::default();
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Makes `wait` block until the remote stdin has been dropped.
    pub(crate) fn wait_for_stdin_eof(mut self) -> Self {
        let (tx, rx) = std_mpsc::channel();
        self.stdin_open = Some(tx);
        self.stdin_eof = Some(rx);
        self
    }

    pub(crate) fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub(crate) fn log(&self) -> EventLog {
        Arc::clone(&self.log)
    }

    pub(crate) fn stdin_sink(&self) -> SharedBuf {
        self.stdin.clone()
    }

    pub(crate) fn resizes(&self) -> Arc<Mutex<Vec<WindowSize>>> {
        Arc::clone(&self.resizer.resizes)
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn output(&self, name: &'static str, data: &[u8]) -> Box<dyn Read + Send> {
        match &self.gate {
            Some(gate) => Box::new(GatedReader {
                data: Cursor::new(data.to_vec()),
                gate: Some(gate.clone()),
                name,
                log: self.log(),
            }),
            None => Box::new(Cursor::new(data.to_vec())),
        }
    }

    fn check(&self, stage: &str) -> io::Result<()> {
        if self.fail_at == Some(stage) {
            return Err(io::Error::other(format!("{stage} rejected")));
        }
        Ok(())
    }
}

impl Session for FakeSession {
    type Resizer = FakeResizer;
    type Aborter = FakeAborter;

    fn request_pty(&mut self, req: &PtyRequest) -> io::Result<()> {
        self.check("pty")?;
        self.record(format!(
            "pty {} {}x{} echo={} speed={}/{}",
            req.term, req.size.rows, req.size.cols, req.echo, req.input_speed, req.output_speed
        ));
        Ok(())
    }

    fn pipes(&mut self) -> io::Result<Pipes> {
        self.check("pipes")?;
        self.record("pipes".to_owned());
        Ok(Pipes {
            stdin: Box::new(FakeStdin {
                buf: self.stdin.clone(),
                _closed: self.stdin_open.take(),
            }),
            stdout: self.output("stdout", &self.stdout),
            stderr: self.output("stderr", &self.stderr),
        })
    }

    fn resizer(&self) -> FakeResizer {
        self.record("resizer".to_owned());
        self.resizer.clone()
    }

    fn aborter(&self) -> FakeAborter {
        FakeAborter {
            gate: self.gate.clone(),
            log: self.log(),
        }
    }

    fn start(&mut self, command: &str) -> io::Result<()> {
        self.check("start")?;
        self.record(format!("start {command}"));
        Ok(())
    }

    fn wait(mut self) -> io::Result<ExitStatus> {
        self.record("wait".to_owned());
        drop(self.stdin_open.take());
        if let Some(gate) = self.gate.take() {
            gate.wait();
            self.record("wait done".to_owned());
        }
        if let Some(eof) = self.stdin_eof.take() {
            let _ = eof.recv();
        }
        self.exit.map_err(io::Error::from)
    }
}

/// Dialer that fails a set number of times, then hands out connections
/// whose sessions come from a queue.
#[derive(Debug)]
pub(crate) struct FakeDialer {
    failures: AtomicU32,
    attempts: AtomicU32,
    sessions: Arc<Mutex<VecDeque<FakeSession>>>,
    log: EventLog,
}

impl FakeDialer {
    /// Fails the first `failures` dials with `ConnectionRefused`.
    pub(crate) fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            sessions: Arc::default(),
            log: Arc::default(),
        }
    }

    /// Succeeds immediately; sessions are taken from `sessions` in order,
    /// then default to successful empty sessions.
    pub(crate) fn with_sessions(sessions: impl IntoIterator<Item = FakeSession>) -> Self {
        let dialer = Self::failing(0);
        dialer.sessions.lock().unwrap().extend(sessions);
        dialer
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Log shared by the connection and every session it opened.
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// The live log behind [`log`](Self::log).
    pub(crate) fn event_log(&self) -> EventLog {
        Arc::clone(&self.log)
    }
}

impl Dialer for FakeDialer {
    type Connection = FakeConnection;

    async fn dial(
        &self,
        addr: SocketAddr,
        creds: &Credentials,
        _timeout: Duration,
    ) -> io::Result<FakeConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("dial {}@{addr}", creds.user));
        Ok(FakeConnection {
            sessions: Arc::clone(&self.sessions),
            log: Arc::clone(&self.log),
        })
    }
}

/// Connection produced by [`FakeDialer`].
#[derive(Debug)]
pub(crate) struct FakeConnection {
    sessions: Arc<Mutex<VecDeque<FakeSession>>>,
    log: EventLog,
}

impl Connection for FakeConnection {
    type Session = FakeSession;

    fn open_session(&self) -> io::Result<FakeSession> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(FakeSession::new);
        Ok(session.with_log(Arc::clone(&self.log)))
    }

    fn close(self) -> io::Result<()> {
        self.log.lock().unwrap().push("close".to_owned());
        Ok(())
    }
}
