use super::proxy::ProcessProxy;
use super::waiter::{MultiplexedWaiter, PipeWriter, Token};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on a single wait.
const RECONCILE_CEILING: Duration = Duration::from_secs(3600);
pub const DEFAULT_POLL_FLOOR: Duration = Duration::from_secs(10);

/// Handler run on the loop when its control socket becomes ready.
pub type SocketHandler = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

type Handles = Arc<Mutex<Vec<Arc<ProcessProxy>>>>;

fn lock_handles(handles: &Handles) -> MutexGuard<'_, Vec<Arc<ProcessProxy>>> {
    match handles.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The supervised handles, shared between the loop and control handlers.
///
/// Removed handles whose process is still alive move to `draining`, where the
/// loop keeps escalating their stop until the process is gone.
#[derive(Clone)]
pub struct Fleet {
    proxies: Handles,
    draining: Handles,
    callback: PipeWriter,
}

impl Fleet {
    fn new(callback: PipeWriter) -> Self {
        Self {
            proxies: Arc::default(),
            draining: Arc::default(),
            callback,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ProcessProxy>>> {
        lock_handles(&self.proxies)
    }

    /// Register a handle. A second handle with an existing name is refused.
    pub fn add(&self, proxy: ProcessProxy) -> bool {
        let mut proxies = self.lock();
        if proxies.iter().any(|p| p.name() == proxy.name()) {
            warn!("Plugin '{}' is already supervised", proxy.name());
            return false;
        }
        proxy.set_termination_callback_notify_pipe(self.callback.clone());
        debug!("Supervising plugin '{}'", proxy.name());
        proxies.push(Arc::new(proxy));
        true
    }

    /// Stop the named handle and take it out of supervision. A process that
    /// is still alive is kept draining until it exits or is killed.
    pub fn remove(&self, name: &str) -> bool {
        let proxy = {
            let mut proxies = self.lock();
            let Some(index) = proxies.iter().position(|p| p.name() == name) else {
                return false;
            };
            proxies.remove(index)
        };

        proxy.stop();
        if proxy.is_running() {
            debug!("Plugin '{}' draining", name);
            lock_handles(&self.draining).push(proxy);
            self.callback.notify();
        }
        info!("Plugin '{}' removed from supervision", name);
        true
    }

    /// Check every draining handle, escalating stops that outlived the kill
    /// grace period. Returns when the next check is due.
    pub fn poll_draining(&self) -> Duration {
        let mut next = RECONCILE_CEILING;
        lock_handles(&self.draining).retain(|proxy| {
            let (hint, _) = proxy.check_for_exit();
            if proxy.is_running() {
                next = next.min(hint);
                true
            } else {
                debug!("Removed plugin '{}' has exited", proxy.name());
                false
            }
        });
        next
    }

    pub fn draining(&self) -> Vec<String> {
        lock_handles(&self.draining)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Every handle that may still own a process: supervised ones in insertion
    /// order, then draining ones. Empties the draining list.
    fn take_for_shutdown(&self) -> Vec<Arc<ProcessProxy>> {
        let mut proxies = self.snapshot();
        proxies.append(&mut lock_handles(&self.draining));
        proxies
    }

    /// Run `f` on the named handle while the fleet is locked.
    pub fn apply<R>(&self, name: &str, f: impl FnOnce(&ProcessProxy) -> R) -> Option<R> {
        let proxies = self.lock();
        proxies.iter().find(|p| p.name() == name).map(|p| f(p.as_ref()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().iter().any(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|p| p.name().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Handles in insertion order, detached from the lock.
    pub fn snapshot(&self) -> Vec<Arc<ProcessProxy>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Requests an orderly shutdown of a running monitor from anywhere.
#[derive(Clone)]
pub struct StopHandle {
    pipe: PipeWriter,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.pipe.notify();
    }
}

pub struct ProcessMonitor {
    fleet: Fleet,
    waiter: MultiplexedWaiter,
    termination: PipeWriter,
    child_exit: PipeWriter,
    callback: PipeWriter,
    sockets: Vec<(Token, SocketHandler)>,
    poll_floor: Duration,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        let mut waiter = MultiplexedWaiter::new();
        let termination = waiter.add_entry("termination");
        let child_exit = waiter.add_entry("child-exit");
        let callback = waiter.add_entry("plugin-callback");

        Self {
            fleet: Fleet::new(callback.clone()),
            waiter,
            termination,
            child_exit,
            callback,
            sockets: Vec::new(),
            poll_floor: DEFAULT_POLL_FLOOR,
        }
    }

    /// Shortest wait between reconciliation passes.
    pub fn with_poll_floor(mut self, floor: Duration) -> Self {
        self.poll_floor = floor;
        self
    }

    pub fn fleet(&self) -> Fleet {
        self.fleet.clone()
    }

    pub fn add_process_to_monitor(&self, proxy: ProcessProxy) -> bool {
        self.fleet.add(proxy)
    }

    pub fn remove_plugin_by_name(&self, name: &str) -> bool {
        self.fleet.remove(name)
    }

    pub fn apply_to_process_proxy<R>(
        &self,
        name: &str,
        f: impl FnOnce(&ProcessProxy) -> R,
    ) -> Option<R> {
        self.fleet.apply(name, f)
    }

    pub fn get_list_of_plugin_names(&self) -> Vec<String> {
        self.fleet.names()
    }

    /// Register a control socket. The returned writer wakes the loop, which
    /// then runs `handler`.
    pub fn add_socket(&mut self, label: &str, handler: SocketHandler) -> PipeWriter {
        let ready = self.waiter.add_entry(format!("socket:{}", label));
        self.sockets.push((ready.token(), handler));
        ready
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            pipe: self.termination.clone(),
        }
    }

    /// Supervise until a termination signal or stop request, then shut every
    /// plugin down. Returns the process exit code.
    pub async fn run(&mut self) -> i32 {
        if self.fleet.is_empty() {
            error!("No plugins to supervise");
            return 1;
        }

        info!("Supervising {} plugins: {:?}", self.fleet.len(), self.fleet.names());
        let mut timeout = RECONCILE_CEILING;
        for proxy in self.fleet.snapshot() {
            timeout = timeout.min(proxy.ensure_state_matches_options());
        }
        timeout = timeout.max(self.poll_floor);

        let forwarders = self.spawn_signal_forwarders();

        loop {
            let ready = self.waiter.poll(timeout).await;
            if self.dispatch(&ready) {
                break;
            }
            timeout = self.reconcile();
            trace!("Next reconciliation in {:?}", timeout);
        }

        Self::shut_down_all(self.fleet.take_for_shutdown()).await;

        for forwarder in forwarders {
            forwarder.abort();
        }
        info!("Supervisor stopped");
        0
    }

    /// Serve every ready source. Returns true once a stop was requested.
    fn dispatch(&mut self, ready: &[Token]) -> bool {
        let mut stop = false;

        for &token in ready {
            if token == self.termination.token() {
                info!("Stop requested");
                stop = true;
            } else if token == self.child_exit.token() || token == self.callback.token() {
                trace!("Event on '{}'", self.waiter.label(token));
            } else if let Some((_, handler)) = self.sockets.iter_mut().find(|(t, _)| *t == token)
            {
                if let Err(e) = handler() {
                    error!("Handler for '{}' failed: {:#}", self.waiter.label(token), e);
                }
            } else {
                warn!("Event on unregistered token {:?}", token);
            }
        }

        stop
    }

    fn reconcile(&self) -> Duration {
        let mut next = RECONCILE_CEILING;
        for proxy in self.fleet.snapshot() {
            let (exit_hint, _) = proxy.check_for_exit();
            let ensure_hint = proxy.ensure_state_matches_options();
            next = next.min(exit_hint).min(ensure_hint);
        }
        next.min(self.fleet.poll_draining()).max(self.poll_floor)
    }

    async fn shut_down_all(proxies: Vec<Arc<ProcessProxy>>) {
        info!("Shutting down {} plugins", proxies.len());

        let workers: Vec<_> = proxies
            .into_iter()
            .map(|proxy| {
                tokio::task::spawn_blocking(move || {
                    let confirmed = proxy.shut_down_process_check_for_exit();
                    (proxy.name().to_string(), confirmed)
                })
            })
            .collect();

        for worker in workers {
            match worker.await {
                Ok((name, true)) => debug!("Plugin '{}' shut down", name),
                Ok((name, false)) => warn!("Plugin '{}' was abandoned at shutdown", name),
                Err(e) => error!("Shutdown worker failed: {}", e),
            }
        }
    }

    fn spawn_signal_forwarders(&self) -> Vec<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let sources = [
            (SignalKind::terminate(), "SIGTERM", &self.termination),
            (SignalKind::interrupt(), "SIGINT", &self.termination),
            (SignalKind::child(), "SIGCHLD", &self.child_exit),
        ];

        let mut forwarders = Vec::new();
        for (kind, name, pipe) in sources {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot listen for {}: {}", name, e);
                    continue;
                }
            };
            let pipe = pipe.clone();
            forwarders.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    debug!("Received {}", name);
                    pipe.notify();
                }
            }));
        }
        forwarders
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}
