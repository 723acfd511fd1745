use super::log_buffer::OutputBuffer;
use super::waiter::PipeWriter;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Running,
    Finished,
}

/// Signals the supervisor sends to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Polite request to exit (SIGTERM)
    Terminate,
    /// Forced kill (SIGKILL)
    Kill,
    /// Forced kill that leaves a core dump (SIGABRT)
    CoreDump,
}

impl KillSignal {
    pub fn as_raw(self) -> i32 {
        match self {
            KillSignal::Terminate => libc::SIGTERM,
            KillSignal::Kill => libc::SIGKILL,
            KillSignal::CoreDump => libc::SIGABRT,
        }
    }
}

/// Everything needed to launch one plugin instance.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    pub path: &'a Path,
    pub args: &'a [String],
    pub env: &'a [(String, String)],
    pub uid: u32,
    pub gid: u32,
}

pub trait Process: Send {
    fn exec(&mut self, request: &ExecRequest<'_>) -> io::Result<()>;

    /// Send `signal`. A process that already finished is left alone.
    fn kill(&mut self, signal: KillSignal) -> io::Result<()>;

    /// Non-blocking status probe.
    fn status(&mut self) -> ProcessStatus;

    /// Exit code, or the terminating signal number when killed.
    fn exit_code(&self) -> i32;

    /// Raw wait status as reported by the OS.
    fn native_exit_code(&self) -> i32;

    fn output(&self) -> String;

    fn pid(&self) -> Option<u32>;
}

pub trait ProcessFactory: Send + Sync {
    /// `on_finished` is written once the process has been reaped.
    fn create(&self, name: &str, on_finished: Option<PipeWriter>) -> Box<dyn Process>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessFactory;

impl ProcessFactory for SystemProcessFactory {
    fn create(&self, name: &str, on_finished: Option<PipeWriter>) -> Box<dyn Process> {
        Box::new(SystemProcess::new(name, on_finished))
    }
}

pub struct SystemProcess {
    name: String,
    on_finished: Option<PipeWriter>,
    pid: Option<u32>,
    exit: Arc<Mutex<Option<ExitStatus>>>,
    output: Arc<OutputBuffer>,
}

impl SystemProcess {
    pub fn new(name: impl Into<String>, on_finished: Option<PipeWriter>) -> Self {
        Self {
            name: name.into(),
            on_finished,
            pid: None,
            exit: Arc::new(Mutex::new(None)),
            output: Arc::new(OutputBuffer::default()),
        }
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        *lock(&self.exit)
    }
}

impl Process for SystemProcess {
    fn exec(&mut self, request: &ExecRequest<'_>) -> io::Result<()> {
        if self.pid.is_some() {
            return Err(io::Error::other(format!(
                "process '{}' already started",
                self.name
            )));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(io::Error::other)?;
        let _guard = runtime.enter();

        let mut cmd = Command::new(request.path);
        cmd.args(request.args);
        for (key, value) in request.env {
            cmd.env(key, value);
        }

        // Only switch identity when it differs from ours; unprivileged
        // supervisors can still run plugins as themselves.
        let (euid, egid) = unsafe { (libc::geteuid(), libc::getegid()) };
        if request.gid != egid {
            cmd.gid(request.gid);
        }
        if request.uid != euid {
            cmd.uid(request.uid);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        self.pid = child.id();
        debug!(
            "Started '{}' ({}) with PID {:?}",
            self.name,
            request.path.display(),
            self.pid
        );

        spawn_output_readers(&mut child, &self.output);

        let exit = Arc::clone(&self.exit);
        let on_finished = self.on_finished.clone();
        let name = self.name.clone();
        runtime.spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    warn!("Failed to reap '{}': {}", name, e);
                    ExitStatus::from_raw(255 << 8)
                }
            };
            trace!("Reaped '{}': {:?}", name, status);
            *lock(&exit) = Some(status);
            if let Some(pipe) = on_finished {
                pipe.notify();
            }
        });

        Ok(())
    }

    fn kill(&mut self, signal: KillSignal) -> io::Result<()> {
        // Once reaped the PID may already belong to someone else.
        if self.exit_status().is_some() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        debug!("Sending {:?} to '{}' (PID {})", signal, self.name, pid);
        let rc = unsafe { libc::kill(pid as i32, signal.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn status(&mut self) -> ProcessStatus {
        if self.exit_status().is_some() {
            ProcessStatus::Finished
        } else if self.pid.is_some() {
            ProcessStatus::Running
        } else {
            ProcessStatus::NotStarted
        }
    }

    fn exit_code(&self) -> i32 {
        self.exit_status()
            .and_then(|status| status.code().or_else(|| status.signal()))
            .unwrap_or(-1)
    }

    fn native_exit_code(&self) -> i32 {
        self.exit_status().map(|status| status.into_raw()).unwrap_or(-1)
    }

    fn output(&self) -> String {
        self.output.contents()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Spawn background tasks that copy stdout/stderr of a child into its OutputBuffer.
fn spawn_output_readers(child: &mut Child, output: &Arc<OutputBuffer>) {
    if let Some(stdout) = child.stdout.take() {
        let buf = Arc::clone(output);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push(line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let buf = Arc::clone(output);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push(line);
            }
        });
    }
}
