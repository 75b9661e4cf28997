//! PTY (pseudo-terminal) management for the wizard process.
//!
//! Provides a clean interface for:
//! - Resolving and spawning `bash -lc <command>` on a fresh PTY
//! - A dedicated blocking reader thread that hands every chunk to an observer
//! - A writer thread that owns every blocking write to the child
//! - Terminating the child (SIGTERM, bounded wait, SIGKILL) and reaping it

use crate::error::{EngineError, EngineResult};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execve, fork, read, setsid, write, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Shell used to run every session command
const SHELL: &str = "bash";

/// How long the reader waits for the child after the terminal closes
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Cursor position query (plain and DEC private form)
const CURSOR_QUERIES: [&[u8]; 2] = [b"\x1b[6n", b"\x1b[?6n"];
const CURSOR_REPLY: &[u8] = b"\x1b[1;1R";

/// Writes buffered for the writer thread before `write_all` reports back-pressure
const INPUT_QUEUE_DEPTH: usize = 64;

/// Words the shell handles itself; they need no executable on disk
const SHELL_BUILTINS: &[&str] = &[
    ".", ":", "alias", "cd", "echo", "eval", "exec", "exit", "export", "printf", "read", "set",
    "source", "test", "true", "false", "type", "ulimit", "umask", "unset", "wait",
];

/// Receives what the reader thread observes
pub trait PtyObserver: Send + Sync {
    /// One chunk as read from the terminal
    fn on_output(&self, data: &[u8]);
    /// The child exited on its own (not via [`PtyProcess::terminate`])
    fn on_exit(&self, exit_code: i32);
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 40, cols: 120 }
    }
}

impl PtySize {
    fn winsize(&self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// Exit status shared by the reader thread and `terminate`
struct ExitState {
    pid: Pid,
    code: Mutex<Option<i32>>,
}

impl ExitState {
    fn code(&self) -> Option<i32> {
        *self.code.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Non-blocking reap; remembers the status once collected
    fn try_reap(&self) -> Option<i32> {
        let mut code = self.code.lock().unwrap_or_else(|e| e.into_inner());
        if code.is_some() {
            return *code;
        }
        let reaped = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, status)) => Some(status),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
            Ok(_) => None,
            Err(Errno::ECHILD) => Some(-1),
            Err(e) => {
                warn!("waitpid({}) failed: {}", self.pid, e);
                None
            }
        };
        *code = reaped;
        reaped
    }

    /// Poll until reaped or `timeout` passes
    fn wait(&self, timeout: Duration) -> Option<i32> {
        let start = Instant::now();
        loop {
            if let Some(code) = self.try_reap() {
                return Some(code);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// A child process attached to a PTY
pub struct PtyProcess {
    master: Arc<OwnedFd>,
    child_pid: Pid,
    exit: Arc<ExitState>,
    stopping: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    input_tx: mpsc::Sender<Vec<u8>>,
}

impl PtyProcess {
    /// Spawn `bash -lc <command>` in `workdir` and start the reader thread
    pub fn spawn(
        command: &str,
        workdir: &Path,
        size: PtySize,
        observer: Arc<dyn PtyObserver>,
    ) -> EngineResult<Self> {
        let command = command.trim();
        if command.is_empty() {
            return Err(EngineError::Spawn("command cannot be empty".to_string()));
        }
        if !workdir.is_dir() {
            return Err(EngineError::Spawn(format!(
                "working directory {} does not exist",
                workdir.display()
            )));
        }
        resolve_program(command, workdir)?;
        let shell = find_on_path(SHELL)
            .ok_or_else(|| EngineError::Spawn(format!("{SHELL} not found on PATH")))?;

        // Everything the child needs is allocated before fork
        let shell_c = cstring(shell.as_os_str().as_bytes())?;
        let args = [cstring(SHELL.as_bytes())?, cstring(b"-lc")?, cstring(command.as_bytes())?];
        let env = child_env()?;
        let workdir_c = cstring(workdir.as_os_str().as_bytes())?;

        let OpenptyResult { master, slave } = openpty(&size.winsize(), None)
            .map_err(|e| EngineError::Spawn(format!("failed to open PTY: {e}")))?;

        match unsafe { fork() }.map_err(|e| EngineError::Spawn(format!("fork failed: {e}")))? {
            ForkResult::Parent { child } => {
                drop(slave);

                let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL).map_err(io_err)?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
                    .map_err(io_err)?;

                info!("Spawned session process with PID {}", child);

                let master = Arc::new(master);
                let exit = Arc::new(ExitState {
                    pid: child,
                    code: Mutex::new(None),
                });
                let stopping = Arc::new(AtomicBool::new(false));

                let reader = {
                    let master = Arc::clone(&master);
                    let exit = Arc::clone(&exit);
                    let stopping = Arc::clone(&stopping);
                    std::thread::Builder::new()
                        .name(format!("pty-reader-{child}"))
                        .spawn(move || reader_loop(master, exit, stopping, observer))?
                };

                // Ends on its own once the sender is dropped with this process
                let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
                {
                    let master = Arc::clone(&master);
                    let stopping = Arc::clone(&stopping);
                    std::thread::Builder::new()
                        .name(format!("pty-writer-{child}"))
                        .spawn(move || writer_loop(master, stopping, input_rx))?;
                }

                Ok(Self {
                    master,
                    child_pid: child,
                    exit,
                    stopping,
                    reader: Mutex::new(Some(reader)),
                    input_tx,
                })
            }
            ForkResult::Child => {
                drop(master);
                // Only async-signal-safe calls from here on
                unsafe {
                    let _ = setsid();
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);

                    let slave_raw = slave.as_raw_fd();
                    let _ = dup2(slave_raw, libc::STDIN_FILENO);
                    let _ = dup2(slave_raw, libc::STDOUT_FILENO);
                    let _ = dup2(slave_raw, libc::STDERR_FILENO);
                    if slave_raw > 2 {
                        drop(slave);
                    }

                    if libc::chdir(workdir_c.as_ptr()) != 0 {
                        libc::_exit(126);
                    }
                    let _ = execve(&shell_c, &args, &env);
                    libc::_exit(127)
                }
            }
        }
    }

    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }

    /// Exit code once the child has been reaped
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.code()
    }

    pub fn is_running(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst) && self.exit.try_reap().is_none()
    }

    /// Queue `data` for the child's input.
    ///
    /// Never blocks: the writer thread performs the actual writes, in order.
    pub fn write_all(&self, data: &[u8]) -> EngineResult<()> {
        if !self.is_running() {
            return Err(EngineError::SessionNotRunning);
        }
        match self.input_tx.try_send(data.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "terminal input queue is full",
            ))),
            Err(TrySendError::Closed(_)) => Err(EngineError::SessionNotRunning),
        }
    }

    /// Resize the PTY
    pub fn resize(&self, size: PtySize) -> EngineResult<()> {
        let winsize = size.winsize();
        unsafe {
            if libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) < 0 {
                return Err(EngineError::Io(std::io::Error::last_os_error()));
            }
        }
        debug!("PTY resized to {}x{}", size.cols, size.rows);
        Ok(())
    }

    /// Send a signal to the child's process group
    pub fn signal(&self, sig: Signal) -> EngineResult<()> {
        signal::killpg(self.child_pid, sig)
            .or_else(|_| signal::kill(self.child_pid, sig))
            .map_err(io_err)
    }

    /// Stop the child: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// The observer is not told about an exit caused here. Returns the
    /// reaped exit code when one could be collected.
    pub fn terminate(&self, grace: Duration) -> Option<i32> {
        self.stopping.store(true, Ordering::SeqCst);

        let code = match self.exit.try_reap() {
            Some(code) => Some(code),
            None => {
                let _ = self.signal(Signal::SIGTERM);
                match self.exit.wait(grace) {
                    Some(code) => Some(code),
                    None => {
                        warn!("PID {} ignored SIGTERM, sending SIGKILL", self.child_pid);
                        let _ = self.signal(Signal::SIGKILL);
                        self.exit.wait(REAP_TIMEOUT)
                    }
                }
            }
        };

        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reader {
            if handle.join().is_err() {
                error!("PTY reader thread panicked");
            }
        }

        info!("Session process {} terminated ({:?})", self.child_pid, code);
        code
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.exit.code().is_none() {
            self.terminate(Duration::from_millis(500));
        }
    }
}

fn reader_loop(
    master: Arc<OwnedFd>,
    exit: Arc<ExitState>,
    stopping: Arc<AtomicBool>,
    observer: Arc<dyn PtyObserver>,
) {
    let fd = master.as_raw_fd();
    let mut buf = [0u8; 4096];
    let mut child_gone = false;

    loop {
        if stopping.load(Ordering::SeqCst) {
            debug!("Reader stopping on request");
            return;
        }

        match read(fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let data = &buf[..n];
                if CURSOR_QUERIES
                    .iter()
                    .any(|q| data.windows(q.len()).any(|w| w == *q))
                {
                    debug!("Answering cursor position query");
                    if let Err(e) = write(&*master, CURSOR_REPLY) {
                        warn!("Failed to answer cursor query: {}", e);
                    }
                }
                observer.on_output(data);
            }
            Err(Errno::EAGAIN) => {
                // A grandchild may hold the terminal open after the child is gone
                if child_gone {
                    break;
                }
                child_gone = exit.try_reap().is_some();
                if !child_gone {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            Err(Errno::EIO) => break,
            Err(e) => {
                error!("PTY read error: {}", e);
                break;
            }
        }
    }

    if stopping.load(Ordering::SeqCst) {
        return;
    }
    let code = exit.wait(REAP_TIMEOUT).unwrap_or_else(|| {
        warn!("Terminal closed but PID {} is still alive", exit.pid);
        -1
    });
    debug!("Reader thread exiting, exit code {}", code);
    observer.on_exit(code);
}

fn writer_loop(master: Arc<OwnedFd>, stopping: Arc<AtomicBool>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.blocking_recv() {
        let mut written = 0;
        while written < data.len() {
            if stopping.load(Ordering::SeqCst) {
                debug!("Writer stopping on request");
                return;
            }
            match write(&*master, &data[written..]) {
                Ok(n) => written += n,
                Err(Errno::EAGAIN) => std::thread::sleep(Duration::from_millis(1)),
                Err(Errno::EIO) => {
                    debug!("Terminal closed, writer exiting");
                    return;
                }
                Err(e) => {
                    error!("PTY write error: {}", e);
                    break;
                }
            }
        }
    }
    debug!("Writer thread exiting");
}

/// Verify the first word of `command` names something runnable.
///
/// Leading `NAME=value` assignments are skipped. Shell builtins pass; paths
/// containing `/` are checked relative to `workdir`; bare names are searched
/// on `PATH`.
pub fn resolve_program(command: &str, workdir: &Path) -> EngineResult<PathBuf> {
    let program = command
        .split_whitespace()
        .find(|word| !is_env_assignment(word))
        .map(|word| word.trim_matches(|c| c == '"' || c == '\''))
        .filter(|word| !word.is_empty())
        .ok_or_else(|| EngineError::Spawn(format!("no program in command `{command}`")))?;

    if SHELL_BUILTINS.contains(&program) {
        return Ok(PathBuf::from(program));
    }

    if program.contains('/') {
        let candidate = workdir.join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
        // Scripts run through bash explicitly need only be readable
        if candidate.is_file() {
            return Ok(candidate);
        }
        return Err(EngineError::Spawn(format!(
            "{} does not exist",
            candidate.display()
        )));
    }

    find_on_path(program)
        .ok_or_else(|| EngineError::Spawn(format!("{program}: command not found")))
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Parent environment, with a usable TERM
fn child_env() -> EngineResult<Vec<CString>> {
    let mut env = Vec::new();
    let mut has_term = false;
    for (key, value) in std::env::vars_os() {
        if key == "TERM" {
            has_term = true;
        }
        let mut entry = key.as_bytes().to_vec();
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        if let Ok(c) = CString::new(entry) {
            env.push(c);
        }
    }
    if !has_term {
        env.push(cstring(b"TERM=xterm-256color")?);
    }
    Ok(env)
}

fn cstring(bytes: &[u8]) -> EngineResult<CString> {
    CString::new(bytes).map_err(|_| EngineError::Spawn("argument contains a NUL byte".to_string()))
}

fn io_err(e: Errno) -> EngineError {
    EngineError::Io(std::io::Error::from(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Collector {
        output: Mutex<Vec<u8>>,
        exit: Mutex<Option<i32>>,
    }

    impl PtyObserver for Collector {
        fn on_output(&self, data: &[u8]) {
            self.output.lock().unwrap().extend_from_slice(data);
        }
        fn on_exit(&self, exit_code: i32) {
            *self.exit.lock().unwrap() = Some(exit_code);
        }
    }

    impl Collector {
        fn wait_exit(&self, timeout: Duration) -> Option<i32> {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if let Some(code) = *self.exit.lock().unwrap() {
                    return Some(code);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            None
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_resolve_program() {
        let dir = tempdir().unwrap();
        assert!(resolve_program("sh -c true", dir.path()).is_ok());
        assert!(resolve_program("FOO=1 BAR=2 sh", dir.path()).is_ok());
        assert!(resolve_program("cd /tmp && ls", dir.path()).is_ok());

        std::fs::write(dir.path().join("deploy.sh"), "echo hi\n").unwrap();
        assert!(resolve_program("./deploy.sh --fast", dir.path()).is_ok());

        match resolve_program("definitely-not-a-real-binary-xyz", dir.path()) {
            Err(EngineError::Spawn(msg)) => assert!(msg.contains("command not found")),
            other => panic!("expected spawn error, got {:?}", other),
        }
        assert!(matches!(
            resolve_program("./missing.sh", dir.path()),
            Err(EngineError::Spawn(_))
        ));
        assert!(matches!(
            resolve_program("   ", dir.path()),
            Err(EngineError::Spawn(_))
        ));
    }

    #[test]
    fn test_spawn_rejects_missing_workdir() {
        let observer = Arc::new(Collector::default());
        let result = PtyProcess::spawn(
            "echo hi",
            Path::new("/definitely/not/here"),
            PtySize::default(),
            observer,
        );
        assert!(matches!(result, Err(EngineError::Spawn(_))));
    }

    #[test]
    fn test_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let observer = Arc::new(Collector::default());
        let pty = PtyProcess::spawn(
            "echo hello-from-pty; exit 3",
            dir.path(),
            PtySize::default(),
            observer.clone(),
        )
        .unwrap();

        assert_eq!(observer.wait_exit(Duration::from_secs(10)), Some(3));
        assert!(observer.text().contains("hello-from-pty"));
        assert_eq!(pty.exit_code(), Some(3));
        assert!(!pty.is_running());
    }

    #[test]
    fn test_runs_in_workdir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let observer = Arc::new(Collector::default());
        let _pty = PtyProcess::spawn("ls", dir.path(), PtySize::default(), observer.clone())
            .unwrap();
        assert_eq!(observer.wait_exit(Duration::from_secs(10)), Some(0));
        assert!(observer.text().contains("marker.txt"));
    }

    #[test]
    fn test_write_reaches_child() {
        let dir = tempdir().unwrap();
        let observer = Arc::new(Collector::default());
        let pty = PtyProcess::spawn(
            "read -r line; echo \"got:$line\"",
            dir.path(),
            PtySize::default(),
            observer.clone(),
        )
        .unwrap();

        pty.write_all(b"abc\r").unwrap();
        assert_eq!(observer.wait_exit(Duration::from_secs(10)), Some(0));
        assert!(observer.text().contains("got:abc"));
        assert!(matches!(
            pty.write_all(b"more\r"),
            Err(EngineError::SessionNotRunning)
        ));
    }

    #[test]
    fn test_terminate_is_bounded_and_silent() {
        let dir = tempdir().unwrap();
        let observer = Arc::new(Collector::default());
        let pty = PtyProcess::spawn("sleep 30", dir.path(), PtySize::default(), observer.clone())
            .unwrap();

        let start = Instant::now();
        let code = pty.terminate(Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(code.is_some());
        assert!(!pty.is_running());
        // Explicit stops are not reported as exits
        assert!(observer.exit.lock().unwrap().is_none());
    }

    #[test]
    fn test_write_never_blocks_when_child_stops_reading() {
        let dir = tempdir().unwrap();
        let observer = Arc::new(Collector::default());
        let pty = PtyProcess::spawn("sleep 30", dir.path(), PtySize::default(), observer)
            .unwrap();

        let chunk = vec![b'x'; 4096];
        let start = Instant::now();
        let mut refused = 0;
        for _ in 0..200 {
            match pty.write_all(&chunk) {
                Ok(()) => {}
                Err(EngineError::Io(e)) => {
                    assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock);
                    refused += 1;
                }
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        // Refusals are fine, waiting is not
        assert!(start.elapsed() < Duration::from_secs(1), "{refused} writes refused");

        pty.terminate(Duration::from_millis(500));
    }

    #[test]
    fn test_cursor_query_is_answered() {
        let dir = tempdir().unwrap();
        let observer = Arc::new(Collector::default());
        let _pty = PtyProcess::spawn(
            "printf '\\033[6n'; read -rs -n 6 pos; echo answered",
            dir.path(),
            PtySize::default(),
            observer.clone(),
        )
        .unwrap();

        assert_eq!(observer.wait_exit(Duration::from_secs(10)), Some(0));
        assert!(observer.text().contains("answered"));
    }
}
