use super::clock::{Clock, SystemClock};
use super::identity::{IdentityResolver, RunAs, SystemIdentityResolver};
use super::process::{
    ExecRequest, KillSignal, Process, ProcessFactory, ProcessStatus, SystemProcessFactory,
};
use super::waiter::PipeWriter;
use crate::fs::{FileSystem, LocalFileSystem};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Immutable launch configuration of one plugin. Replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub name: String,
    pub display_name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// "user" or "user:group"; empty runs as the supervisor itself
    pub user_and_group: String,
    pub core_dump_on_kill: bool,
    pub has_service_health: bool,
    pub has_threat_service_health: bool,
}

impl ProcessConfig {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            display_name: String::new(),
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
            user_and_group: String::new(),
            core_dump_on_kill: false,
            has_service_health: false,
            has_threat_service_health: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn user_and_group(mut self, user_and_group: impl Into<String>) -> Self {
        self.user_and_group = user_and_group.into();
        self
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn core_dump_on_kill(mut self, enabled: bool) -> Self {
        self.core_dump_on_kill = enabled;
        self
    }

    pub fn service_health(mut self, service: bool, threat_service: bool) -> Self {
        self.has_service_health = service;
        self.has_threat_service_health = threat_service;
        self
    }

    /// Fields whose change requires relaunching a running instance.
    fn same_identity(&self, other: &ProcessConfig) -> bool {
        self.executable == other.executable && self.user_and_group == other.user_and_group
    }
}

/// Re-check intervals and limits used by every proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTimings {
    /// First delay after a failed start, and the delay after every successful one
    pub minimum_backoff: Duration,
    pub maximum_backoff: Duration,
    /// Retry delay while the executable or run-as identity is missing
    pub precondition_retry: Duration,
    /// Hint returned when nothing is expected to change
    pub steady_state: Duration,
    /// Hint returned while a stop is outstanding
    pub stop_recheck: Duration,
    /// Time a plugin gets to honour SIGTERM before it is killed
    pub kill_grace: Duration,
    /// Exits this soon after a kill are logged as expected
    pub expected_exit_window: Duration,
    pub shutdown_timeout: Duration,
    pub shutdown_poll: Duration,
}

impl Default for ProxyTimings {
    fn default() -> Self {
        Self {
            minimum_backoff: Duration::from_secs(10),
            maximum_backoff: Duration::from_secs(320),
            precondition_retry: Duration::from_secs(10),
            steady_state: Duration::from_secs(3600),
            stop_recheck: Duration::from_secs(1),
            kill_grace: Duration::from_secs(3),
            expected_exit_window: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            shutdown_poll: Duration::from_millis(100),
        }
    }
}

/// Collaborators a proxy needs, injected at construction.
#[derive(Clone)]
pub struct ProxyContext {
    pub processes: Arc<dyn ProcessFactory>,
    pub fs: Arc<dyn FileSystem>,
    pub identities: Arc<dyn IdentityResolver>,
    pub clock: Arc<dyn Clock>,
    pub timings: ProxyTimings,
}

impl ProxyContext {
    /// Production collaborators: real processes, filesystem, user database and clock.
    pub fn system(timings: ProxyTimings) -> Self {
        Self {
            processes: Arc::new(SystemProcessFactory),
            fs: Arc::new(LocalFileSystem),
            identities: Arc::new(SystemIdentityResolver),
            clock: Arc::new(SystemClock),
            timings,
        }
    }
}

/// Where a proxy is in its desired/actual cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyLifecycle {
    DisabledStopped,
    DisabledStopping,
    EnabledWaitingBackoff,
    EnabledRunning,
    EnabledStopping,
}

struct HandleState {
    config: Arc<ProcessConfig>,
    enabled: bool,
    running: bool,
    process: Option<Box<dyn Process>>,
    death_time: Option<Instant>,
    kill_issued: Option<Instant>,
    kill_escalated: bool,
    exit_code: Option<i32>,
    backoff: Duration,
    failed_starts: u32,
    /// Last precondition failure logged, so it is reported once per transition
    blocked_reason: Option<String>,
    core_dump_on_stop: bool,
    notify: Option<PipeWriter>,
}

pub struct ProcessProxy {
    name: String,
    ctx: ProxyContext,
    state: Mutex<HandleState>,
}

impl ProcessProxy {
    /// A new, enabled and not yet started proxy.
    pub fn new(config: ProcessConfig, ctx: ProxyContext) -> Self {
        let backoff = ctx.timings.minimum_backoff;
        Self {
            name: config.name.clone(),
            ctx,
            state: Mutex::new(HandleState {
                config: Arc::new(config),
                enabled: true,
                running: false,
                process: None,
                death_time: None,
                kill_issued: None,
                kill_escalated: false,
                exit_code: None,
                backoff,
                failed_starts: 0,
                blocked_reason: None,
                core_dump_on_stop: false,
                notify: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> Arc<ProcessConfig> {
        Arc::clone(&self.lock().config)
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().process.as_ref().and_then(|p| p.pid())
    }

    pub fn lifecycle(&self) -> ProxyLifecycle {
        let state = self.lock();
        match (state.enabled, state.running, state.kill_issued.is_some()) {
            (false, false, _) => ProxyLifecycle::DisabledStopped,
            (false, true, _) => ProxyLifecycle::DisabledStopping,
            (true, false, _) => ProxyLifecycle::EnabledWaitingBackoff,
            (true, true, false) => ProxyLifecycle::EnabledRunning,
            (true, true, true) => ProxyLifecycle::EnabledStopping,
        }
    }

    /// Record desired state. Acted on by the next reconciliation pass.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        if state.enabled != enabled {
            debug!("Plugin '{}' enabled: {} -> {}", self.name, state.enabled, enabled);
        }
        state.enabled = enabled;
    }

    /// Make the next forced kill leave a core dump.
    pub fn set_core_dump_on_stop(&self, enabled: bool) {
        self.lock().core_dump_on_stop = enabled;
    }

    pub fn set_termination_callback_notify_pipe(&self, pipe: PipeWriter) {
        self.lock().notify = Some(pipe);
    }

    /// Take the single action that moves actual state toward desired state.
    /// Returns how long until this proxy wants to be looked at again.
    pub fn ensure_state_matches_options(&self) -> Duration {
        let mut state = self.lock();
        let timings = self.ctx.timings;

        match (state.enabled, state.running) {
            (true, true) | (false, false) => timings.steady_state,
            (false, true) => {
                self.stop_locked(&mut state);
                timings.stop_recheck
            }
            (true, false) => self.start_when_ready(&mut state),
        }
    }

    fn start_when_ready(&self, state: &mut HandleState) -> Duration {
        let timings = self.ctx.timings;

        let (uid, gid) = match self.check_preconditions(&state.config) {
            Ok(ids) => {
                if state.blocked_reason.take().is_some() {
                    info!("Plugin '{}' can be started again", self.name);
                }
                ids
            }
            Err(reason) => {
                if state.blocked_reason.as_deref() != Some(reason.as_str()) {
                    warn!("Not starting plugin '{}': {}", self.name, reason);
                    state.blocked_reason = Some(reason);
                }
                return timings.precondition_retry;
            }
        };

        let now = self.ctx.clock.now();
        if let Some(death) = state.death_time {
            let elapsed = now.saturating_duration_since(death);
            if elapsed < state.backoff {
                return state.backoff - elapsed;
            }
        }

        let config = Arc::clone(&state.config);
        let mut process = self.ctx.processes.create(&self.name, state.notify.clone());
        let request = ExecRequest {
            path: &config.executable,
            args: &config.args,
            env: &config.env,
            uid,
            gid,
        };

        match process.exec(&request) {
            Ok(()) => {
                info!(
                    "Started plugin '{}' as {}:{} (PID {:?})",
                    self.name,
                    uid,
                    gid,
                    process.pid()
                );
                state.process = Some(process);
                state.running = true;
                state.kill_issued = None;
                state.kill_escalated = false;
                state.core_dump_on_stop = false;
                state.exit_code = None;
                state.backoff = timings.minimum_backoff;
                state.failed_starts = 0;
                timings.minimum_backoff
            }
            Err(e) => {
                state.death_time = Some(now);
                state.backoff = if state.failed_starts == 0 {
                    timings.minimum_backoff
                } else {
                    state.backoff.saturating_mul(2).min(timings.maximum_backoff)
                };
                state.failed_starts += 1;

                if state.failed_starts == 1 {
                    error!("Failed to start plugin '{}': {}", self.name, e);
                } else {
                    debug!(
                        "Failed to start plugin '{}' ({} attempts): {}",
                        self.name, state.failed_starts, e
                    );
                }
                debug!("Plugin '{}' retry in {:?}", self.name, state.backoff);
                state.backoff
            }
        }
    }

    fn check_preconditions(&self, config: &ProcessConfig) -> Result<(u32, u32), String> {
        if !self.ctx.fs.is_file(&config.executable) {
            return Err(format!(
                "executable {} does not exist",
                config.executable.display()
            ));
        }

        let run_as: RunAs = config
            .user_and_group
            .parse()
            .map_err(|e: crate::error::SupervisorError| e.to_string())?;

        self.ctx.identities.resolve(&run_as).ok_or_else(|| {
            format!(
                "run-as identity '{}' cannot be resolved",
                config.user_and_group
            )
        })
    }

    /// Non-blocking exit probe. Records the death of a finished process and
    /// escalates a stop that has outlived the kill grace period.
    pub fn check_for_exit(&self) -> (Duration, ProcessStatus) {
        let mut state = self.lock();
        let timings = self.ctx.timings;

        let status = match state.process.as_mut() {
            Some(process) => process.status(),
            None => return (timings.steady_state, ProcessStatus::NotStarted),
        };

        if status == ProcessStatus::Finished {
            self.record_exit(&mut state);
            return (timings.steady_state, status);
        }

        let Some(kill_issued) = state.kill_issued else {
            return (timings.steady_state, status);
        };

        let now = self.ctx.clock.now();
        if !state.kill_escalated && now.saturating_duration_since(kill_issued) >= timings.kill_grace
        {
            let signal = if state.core_dump_on_stop || state.config.core_dump_on_kill {
                KillSignal::CoreDump
            } else {
                KillSignal::Kill
            };
            warn!(
                "Plugin '{}' still running {:?} after stop, sending {:?}",
                self.name, timings.kill_grace, signal
            );
            if let Some(process) = state.process.as_mut() {
                if let Err(e) = process.kill(signal) {
                    warn!("Failed to kill plugin '{}': {}", self.name, e);
                }
            }
            state.kill_escalated = true;
        }

        (timings.stop_recheck, status)
    }

    fn record_exit(&self, state: &mut HandleState) {
        let Some(process) = state.process.take() else {
            return;
        };

        let now = self.ctx.clock.now();
        let code = process.exit_code();
        let native = process.native_exit_code();
        let expected = state
            .kill_issued
            .is_some_and(|t| now.saturating_duration_since(t) <= self.ctx.timings.expected_exit_window);

        if expected {
            info!(
                "Plugin '{}' exited after being stopped (code {}, native {})",
                self.name, code, native
            );
        } else if code == 0 {
            warn!("Plugin '{}' exited unexpectedly with code 0", self.name);
        } else {
            error!(
                "Plugin '{}' died with exit code {} (native {})",
                self.name, code, native
            );
            let output = process.output();
            if !output.is_empty() {
                error!("Output of '{}':\n{}", self.name, output);
            }
        }

        state.death_time = Some(now);
        state.exit_code = Some(code);
        state.running = false;
        state.kill_issued = None;
        state.kill_escalated = false;
    }

    /// Ask the process to terminate. No-op when not running or already asked.
    pub fn stop(&self) {
        let mut state = self.lock();
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut HandleState) {
        if !state.running || state.kill_issued.is_some() {
            return;
        }
        let Some(process) = state.process.as_mut() else {
            return;
        };

        info!("Stopping plugin '{}'", self.name);
        if let Err(e) = process.kill(KillSignal::Terminate) {
            warn!("Failed to signal plugin '{}': {}", self.name, e);
        }
        state.kill_issued = Some(self.ctx.clock.now());
    }

    /// Blocking teardown: stop and wait for the exit to be confirmed, giving
    /// up after the shutdown timeout. Returns whether the exit was confirmed.
    pub fn shut_down_process_check_for_exit(&self) -> bool {
        let timings = self.ctx.timings;
        let deadline = Instant::now() + timings.shutdown_timeout;

        self.stop();
        loop {
            self.check_for_exit();
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(timings.shutdown_poll);
        }

        let mut state = self.lock();
        error!(
            "Plugin '{}' did not exit within {:?}, abandoning it",
            self.name, timings.shutdown_timeout
        );
        if let Some(process) = state.process.as_mut() {
            if let Err(e) = process.kill(KillSignal::Kill) {
                warn!("Failed to kill plugin '{}': {}", self.name, e);
            }
        }
        state.process = None;
        state.running = false;
        false
    }

    /// Swap in a reloaded configuration. Returns true when the executable or
    /// run-as identity changed, meaning a running instance must be relaunched.
    pub fn update_plugin_info(&self, config: ProcessConfig) -> bool {
        let mut state = self.lock();
        let changed = !state.config.same_identity(&config);

        if changed {
            info!(
                "Plugin '{}' changed identity: {} as '{}' -> {} as '{}'",
                self.name,
                state.config.executable.display(),
                state.config.user_and_group,
                config.executable.display(),
                config.user_and_group
            );
        } else if state.config.display_name != config.display_name {
            debug!(
                "Plugin '{}' display name now '{}'",
                self.name, config.display_name
            );
        }

        state.config = Arc::new(config);
        changed
    }
}
