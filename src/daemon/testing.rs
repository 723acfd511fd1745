//! Test doubles for the supervisor's collaborator seams.

use super::clock::Clock;
use super::identity::IdentityResolver;
use super::process::{ExecRequest, KillSignal, Process, ProcessFactory, ProcessStatus};
use super::proxy::{ProxyContext, ProxyTimings};
use super::waiter::PipeWriter;
use crate::fs::FileSystem;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Default timings with a short shutdown so hung-plugin tests stay fast.
pub(crate) fn test_timings() -> ProxyTimings {
    ProxyTimings {
        shutdown_timeout: Duration::from_millis(200),
        shutdown_poll: Duration::from_millis(5),
        ..ProxyTimings::default()
    }
}

pub(crate) fn test_context(
    factory: &Arc<FakeProcessFactory>,
    clock: &Arc<ManualClock>,
    fs: Arc<MemoryFileSystem>,
) -> ProxyContext {
    ProxyContext {
        processes: Arc::clone(factory) as Arc<dyn ProcessFactory>,
        fs: fs as Arc<dyn FileSystem>,
        identities: Arc::new(StaticIdentityResolver::standard()),
        clock: Arc::clone(clock) as Arc<dyn Clock>,
        timings: test_timings(),
    }
}

/// Collects formatted log output emitted while `capture` runs.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn capture<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_max_level(Level::DEBUG)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&lock(&self.buffer))
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Records at `level` whose text contains `needle`.
    pub(crate) fn count(&self, level: Level, needle: &str) -> usize {
        self.lines()
            .iter()
            .filter(|line| line.trim_start().starts_with(level.as_str()) && line.contains(needle))
            .count()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.buffer).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

pub(crate) struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

#[derive(Default)]
pub(crate) struct MemoryFileSystem {
    files: Mutex<BTreeMap<PathBuf, String>>,
}

impl MemoryFileSystem {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_file(self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.add_file(path, contents);
        self
    }

    pub(crate) fn add_file(&self, path: impl Into<PathBuf>, contents: &str) {
        lock(&self.files).insert(path.into(), contents.to_string());
    }

    pub(crate) fn remove_file(&self, path: impl AsRef<Path>) {
        lock(&self.files).remove(path.as_ref());
    }

    pub(crate) fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        lock(&self.files).get(path.as_ref()).cloned()
    }
}

impl FileSystem for MemoryFileSystem {
    fn is_file(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(path)
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        self.contents(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(lock(&self.files)
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct StaticIdentityResolver {
    users: HashMap<String, (u32, u32)>,
    groups: HashMap<String, u32>,
}

impl StaticIdentityResolver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// root, an `agent` user and an `ipc` group.
    pub(crate) fn standard() -> Self {
        Self::new()
            .user("root", 0, 0)
            .user("agent", 1001, 1001)
            .group("root", 0)
            .group("agent", 1001)
            .group("ipc", 2000)
    }

    pub(crate) fn user(mut self, name: &str, uid: u32, gid: u32) -> Self {
        self.users.insert(name.to_string(), (uid, gid));
        self
    }

    pub(crate) fn group(mut self, name: &str, gid: u32) -> Self {
        self.groups.insert(name.to_string(), gid);
        self
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn lookup_user(&self, user: &str) -> Option<(u32, u32)> {
        self.users.get(user).copied()
    }

    fn lookup_group(&self, group: &str) -> Option<u32> {
        self.groups.get(group).copied()
    }

    fn current(&self) -> (u32, u32) {
        (0, 0)
    }
}

/// One recorded exec attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeLaunch {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Default)]
struct FakeShared {
    fail_exec: bool,
    ignore_terminate: bool,
    exit_delay: Duration,
    execs: Vec<String>,
    kills: Vec<(String, KillSignal)>,
    launches: HashMap<String, FakeLaunch>,
    processes: HashMap<String, Arc<Mutex<FakeState>>>,
}

#[derive(Default)]
struct FakeState {
    launched: bool,
    finished: Option<i32>,
    terminated_at: Option<Instant>,
    on_finished: Option<PipeWriter>,
}

impl FakeState {
    fn finish(&mut self, code: i32) {
        if self.finished.is_none() {
            self.finished = Some(code);
            if let Some(pipe) = &self.on_finished {
                pipe.notify();
            }
        }
    }
}

/// Records every exec and kill; processes run until told to finish.
///
/// SIGTERM ends a fake process after `exit_delay` (unless `ignore_terminate`
/// is set); SIGKILL and SIGABRT end it immediately.
#[derive(Default)]
pub(crate) struct FakeProcessFactory {
    shared: Arc<Mutex<FakeShared>>,
}

impl FakeProcessFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_fail_exec(&self, fail: bool) {
        lock(&self.shared).fail_exec = fail;
    }

    pub(crate) fn set_ignore_terminate(&self, ignore: bool) {
        lock(&self.shared).ignore_terminate = ignore;
    }

    pub(crate) fn set_exit_delay(&self, delay: Duration) {
        lock(&self.shared).exit_delay = delay;
    }

    pub(crate) fn execs(&self) -> Vec<String> {
        lock(&self.shared).execs.clone()
    }

    pub(crate) fn kills(&self) -> Vec<(String, KillSignal)> {
        lock(&self.shared).kills.clone()
    }

    pub(crate) fn last_launch(&self, name: &str) -> Option<FakeLaunch> {
        lock(&self.shared).launches.get(name).cloned()
    }

    /// Make the latest process started for `name` exit with `code`, waking
    /// the supervisor the same way the real reaper does.
    pub(crate) fn finish(&self, name: &str, code: i32) {
        let state = lock(&self.shared).processes.get(name).cloned();
        if let Some(state) = state {
            lock(&state).finish(code);
        }
    }
}

impl ProcessFactory for FakeProcessFactory {
    fn create(&self, name: &str, on_finished: Option<PipeWriter>) -> Box<dyn Process> {
        Box::new(FakeProcess {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
            state: Arc::new(Mutex::new(FakeState {
                on_finished,
                ..FakeState::default()
            })),
        })
    }
}

struct FakeProcess {
    name: String,
    shared: Arc<Mutex<FakeShared>>,
    state: Arc<Mutex<FakeState>>,
}

impl Process for FakeProcess {
    fn exec(&mut self, request: &ExecRequest<'_>) -> io::Result<()> {
        let mut shared = lock(&self.shared);
        shared.execs.push(self.name.clone());
        shared.launches.insert(
            self.name.clone(),
            FakeLaunch {
                path: request.path.to_path_buf(),
                args: request.args.to_vec(),
                uid: request.uid,
                gid: request.gid,
            },
        );
        if shared.fail_exec {
            return Err(io::Error::new(io::ErrorKind::NotFound, "exec failed"));
        }
        shared
            .processes
            .insert(self.name.clone(), Arc::clone(&self.state));
        drop(shared);

        lock(&self.state).launched = true;
        Ok(())
    }

    fn kill(&mut self, signal: KillSignal) -> io::Result<()> {
        let ignore_terminate = {
            let mut shared = lock(&self.shared);
            shared.kills.push((self.name.clone(), signal));
            shared.ignore_terminate
        };

        let mut state = lock(&self.state);
        match signal {
            KillSignal::Terminate => {
                if !ignore_terminate && state.terminated_at.is_none() {
                    state.terminated_at = Some(Instant::now());
                }
            }
            KillSignal::Kill | KillSignal::CoreDump => state.finish(signal.as_raw()),
        }
        Ok(())
    }

    fn status(&mut self) -> ProcessStatus {
        let exit_delay = lock(&self.shared).exit_delay;
        let mut state = lock(&self.state);

        if state.finished.is_none()
            && state
                .terminated_at
                .is_some_and(|at| at.elapsed() >= exit_delay)
        {
            state.finish(libc::SIGTERM);
        }

        if state.finished.is_some() {
            ProcessStatus::Finished
        } else if state.launched {
            ProcessStatus::Running
        } else {
            ProcessStatus::NotStarted
        }
    }

    fn exit_code(&self) -> i32 {
        lock(&self.state).finished.unwrap_or(-1)
    }

    fn native_exit_code(&self) -> i32 {
        lock(&self.state).finished.map(|code| code << 8).unwrap_or(-1)
    }

    fn output(&self) -> String {
        format!("output of {}", self.name)
    }

    fn pid(&self) -> Option<u32> {
        lock(&self.state).launched.then_some(4242)
    }
}
