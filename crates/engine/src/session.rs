//! Terminal-backed process sessions
//!
//! Every scoped command runs attached to a pseudo-terminal, so shells, REPLs
//! and programs that buffer differently when piped behave as if run by hand.
//! A reader thread captures output from the first byte; nothing emitted
//! before the caller starts listening is lost.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::registry::{ProcessSignal, ScopeProcess};
use crate::POLL_INTERVAL;

const READ_CHUNK_SIZE: usize = 8192;

/// How long to wait for exit after the forced kill
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_millis(500);

/// What to launch and how the terminal is sized
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl SessionRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    /// Run `command_line` through `shell`, picking the right "run this" flag
    pub fn shell(shell: &str, command_line: &str) -> Self {
        let program = shell
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(shell)
            .to_ascii_lowercase();
        let flag = match program.as_str() {
            "cmd" | "cmd.exe" => "/C",
            "powershell" | "powershell.exe" | "pwsh" | "pwsh.exe" => "-Command",
            _ => "-c",
        };
        Self::new(shell).args([flag, command_line])
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// A process attached to a pseudo-terminal
pub struct PtyProcess {
    pid: u32,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    // Dropping the master hangs up the terminal, so it lives as long as the handle
    _master: Mutex<Box<dyn MasterPty + Send>>,
    exit_code: Mutex<Option<i32>>,
}

impl fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("exit_code", &*self.exit_code.lock())
            .finish()
    }
}

impl ScopeProcess for PtyProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn write(&self, bytes: &[u8]) -> EngineResult<()> {
        let mut writer = self.writer.lock();
        let writer = writer
            .as_mut()
            .ok_or_else(|| EngineError::NotWritable(self.pid.to_string()))?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn kill(&self, signal: Option<ProcessSignal>) -> EngineResult<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, killpg, Signal};
            use nix::unistd::Pid;

            let sig = match signal {
                Some(ProcessSignal::Terminate) => Signal::SIGTERM,
                Some(ProcessSignal::Interrupt) => Signal::SIGINT,
                Some(ProcessSignal::Kill) | None => Signal::SIGKILL,
            };
            // The child leads its own session, so signal the whole group first
            let pid = Pid::from_raw(self.pid as i32);
            if killpg(pid, sig).is_ok() {
                return Ok(());
            }
            kill(pid, sig).map_err(|e| EngineError::Io(e.into()))
        }

        #[cfg(not(unix))]
        {
            let _ = signal;
            self.child.lock().kill()?;
            Ok(())
        }
    }

    fn exit_code(&self) -> Option<i32> {
        let mut exit_code = self.exit_code.lock();
        if exit_code.is_none() {
            if let Ok(Some(status)) = self.child.lock().try_wait() {
                *exit_code = Some(status.exit_code() as i32);
            }
        }
        *exit_code
    }
}

/// Incremental UTF-8 decoding across read boundaries
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }

        text
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Text output of a session after the initial capture
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    decoder: Utf8Decoder,
}

impl OutputStream {
    /// Next chunk of text, `None` once the terminal has closed
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Some(bytes) => {
                    let text = self.decoder.decode(&bytes);
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
                None => {
                    let rest = self.decoder.finish();
                    return if rest.is_empty() { None } else { Some(rest) };
                }
            }
        }
    }

    /// Everything already received, without waiting
    fn drain_ready(&mut self) -> String {
        let mut text = String::new();
        while let Ok(bytes) = self.rx.try_recv() {
            text.push_str(&self.decoder.decode(&bytes));
        }
        text
    }
}

/// A freshly spawned session
pub struct SpawnedSession {
    pub process: Arc<PtyProcess>,
    /// Output emitted before `create_session` returned
    pub initial_stdout: String,
    /// Always empty: the terminal merges stderr into stdout
    pub initial_stderr: String,
    pub output: OutputStream,
}

/// Spawn `request` attached to a new pseudo-terminal
pub fn create_session(request: &SessionRequest) -> EngineResult<SpawnedSession> {
    let spawn_failure = |reason: String| EngineError::SpawnFailure {
        command: request.display(),
        reason,
    };

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| spawn_failure(format!("openpty: {}", e)))?;

    let mut cmd = CommandBuilder::new(&request.command);
    cmd.args(&request.args);
    if let Some(cwd) = &request.cwd {
        cmd.cwd(cwd);
    }
    for (key, value) in std::env::vars() {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| spawn_failure(e.to_string()))?;
    // Keep only the child's copy of the slave, so reads see EOF when it exits
    drop(pair.slave);

    let pid = child.process_id().unwrap_or(0);
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| spawn_failure(format!("clone reader: {}", e)))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| spawn_failure(format!("take writer: {}", e)))?;

    let (tx, rx) = mpsc::unbounded_channel();
    spawn_reader(reader, tx, pid).map_err(|e| spawn_failure(format!("reader thread: {}", e)))?;

    info!(pid, command = %request.display(), "Spawned session");

    let process = Arc::new(PtyProcess {
        pid,
        child: Mutex::new(child),
        writer: Mutex::new(Some(writer)),
        _master: Mutex::new(pair.master),
        exit_code: Mutex::new(None),
    });

    let mut output = OutputStream {
        rx,
        decoder: Utf8Decoder::default(),
    };
    let initial_stdout = output.drain_ready();

    Ok(SpawnedSession {
        process,
        initial_stdout,
        initial_stderr: String::new(),
        output,
    })
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pid: u32,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", pid))
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once every slave descriptor is closed
                    Err(_) => break,
                }
            }
            debug!(pid, "Session output closed");
        })?;
    Ok(())
}

/// Poll until the process exits or `timeout` elapses
pub async fn wait_for_exit(process: &dyn ScopeProcess, timeout: Duration) -> Option<i32> {
    let start = Instant::now();
    loop {
        if let Some(code) = process.exit_code() {
            return Some(code);
        }
        if start.elapsed() >= timeout {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Ask the process to exit, then kill it if it is still alive after `timeout`.
///
/// Returns whether exit was observed. Safe to call on exited processes.
pub async fn terminate_session(process: &dyn ScopeProcess, timeout: Duration) -> bool {
    if process.exit_code().is_some() {
        return true;
    }

    let pid = process.id();
    debug!(pid, "Terminating session");
    if let Err(e) = process.kill(Some(ProcessSignal::Terminate)) {
        debug!(pid, "Terminate signal failed: {}", e);
    }

    if wait_for_exit(process, timeout).await.is_some() {
        return true;
    }

    warn!(pid, "Session ignored terminate after {} ms, killing", timeout.as_millis());
    if let Err(e) = process.kill(Some(ProcessSignal::Kill)) {
        debug!(pid, "Kill signal failed: {}", e);
    }
    wait_for_exit(process, KILL_CONFIRM_TIMEOUT.min(timeout))
        .await
        .is_some()
}
