use super::identity::IdentityFile;
use super::monitor::{Fleet, ProcessMonitor, StopHandle};
use super::protocol::{ControlCommand, ControlReply};
use super::proxy::{ProcessProxy, ProxyContext};
use super::registry::{PluginDescriptor, PluginRegistry};
use super::server::{control_channel, ControlQueue, ControlServer};
use crate::clienv;
use crate::error::{Result, SupervisorError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything a control request may touch.
struct PluginCatalog {
    registry: PluginRegistry,
    ctx: ProxyContext,
    fleet: Fleet,
    known: Mutex<BTreeMap<String, PluginDescriptor>>,
    identity_file: PathBuf,
    ipc_group: String,
}

impl PluginCatalog {
    fn known(&self) -> MutexGuard<'_, BTreeMap<String, PluginDescriptor>> {
        match self.known.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn load_plugins(&self) -> Result<usize> {
        let descriptors = self.registry.load_all()?;
        let mut registered = 0;

        for descriptor in descriptors {
            self.known()
                .insert(descriptor.name.clone(), descriptor.clone());
            if !descriptor.is_managed_plugin {
                debug!("Plugin '{}' is not managed, skipping", descriptor.name);
                continue;
            }
            if self.register(&descriptor) {
                registered += 1;
            }
        }

        self.write_identity_file();
        info!(
            "Loaded {} plugins from {}",
            registered,
            self.registry.dir().display()
        );
        Ok(registered)
    }

    fn register(&self, descriptor: &PluginDescriptor) -> bool {
        let config = self.registry.process_config(descriptor);
        self.fleet.add(ProcessProxy::new(config, self.ctx.clone()))
    }

    fn handle_request(&self, frames: &[String]) -> ControlReply {
        let [command, name] = frames else {
            warn!("Control request with {} frames", frames.len());
            return ControlReply::wrong_argument_count();
        };

        let command: ControlCommand = match command.parse() {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejected control request: {}", e);
                return ControlReply::unknown_command();
            }
        };

        let reply = match command {
            ControlCommand::Stop => self.stop_plugin(name),
            ControlCommand::Start => self.start_plugin(name),
            ControlCommand::Remove => self.remove_plugin(name),
            ControlCommand::IsRunning => self.is_running(name),
        };
        info!("{} {} -> {}", command, name, reply);
        reply
    }

    fn stop_plugin(&self, name: &str) -> ControlReply {
        let core_dump = clienv::core_dump_on_stop();
        self.fleet
            .apply(name, |proxy| {
                if core_dump {
                    proxy.set_core_dump_on_stop(true);
                }
                proxy.set_enabled(false);
            })
            .map_or_else(ControlReply::plugin_not_found, |_| ControlReply::Ok)
    }

    fn start_plugin(&self, name: &str) -> ControlReply {
        let descriptor = match self.registry.load(name) {
            Ok(descriptor) => descriptor,
            Err(SupervisorError::DescriptorNotFound(_)) => return ControlReply::plugin_not_found(),
            Err(e) => {
                warn!("Cannot start '{}': {}", name, e);
                return ControlReply::plugin_not_found();
            }
        };

        let config = self.registry.process_config(&descriptor);
        let updated = self.fleet.apply(name, move |proxy| {
            if proxy.update_plugin_info(config) {
                proxy.stop();
            }
            proxy.set_enabled(true);
        });

        if updated.is_none() && !self.register(&descriptor) {
            return ControlReply::plugin_not_found();
        }

        self.known().insert(name.to_string(), descriptor);
        self.write_identity_file();
        ControlReply::Ok
    }

    fn remove_plugin(&self, name: &str) -> ControlReply {
        if !self.fleet.remove(name) {
            return ControlReply::plugin_not_found();
        }
        self.known().remove(name);
        self.write_identity_file();
        ControlReply::Ok
    }

    fn is_running(&self, name: &str) -> ControlReply {
        match self.fleet.apply(name, |proxy| proxy.is_running()) {
            Some(true) => ControlReply::Ok,
            Some(false) => ControlReply::NotRunning,
            None => ControlReply::plugin_not_found(),
        }
    }

    /// Recompute and persist the identity side file from every known descriptor.
    fn write_identity_file(&self) {
        let run_as: Vec<_> = self
            .known()
            .values()
            .filter_map(|descriptor| descriptor.run_as().ok())
            .collect();

        let file = IdentityFile::collect(&run_as, &self.ipc_group, self.ctx.identities.as_ref());
        if let Err(e) = file.save(self.ctx.fs.as_ref(), &self.identity_file) {
            warn!(
                "Failed to write identity file {}: {}",
                self.identity_file.display(),
                e
            );
        }
    }
}

pub struct PluginManager {
    monitor: ProcessMonitor,
    catalog: Arc<PluginCatalog>,
}

impl PluginManager {
    pub fn new(
        registry: PluginRegistry,
        ctx: ProxyContext,
        identity_file: impl Into<PathBuf>,
        ipc_group: impl Into<String>,
    ) -> Self {
        let monitor = ProcessMonitor::new();
        let catalog = PluginCatalog {
            registry,
            ctx,
            fleet: monitor.fleet(),
            known: Mutex::new(BTreeMap::new()),
            identity_file: identity_file.into(),
            ipc_group: ipc_group.into(),
        };
        Self {
            monitor,
            catalog: Arc::new(catalog),
        }
    }

    pub fn with_poll_floor(mut self, floor: Duration) -> Self {
        self.monitor = self.monitor.with_poll_floor(floor);
        self
    }

    /// Register a handle for every managed descriptor in the registry.
    pub fn load_plugins(&self) -> Result<usize> {
        self.catalog.load_plugins()
    }

    pub fn handle_request(&self, frames: &[String]) -> ControlReply {
        self.catalog.handle_request(frames)
    }

    /// Listen on `path`; requests are answered on the monitor loop. The
    /// socket closes when the returned server is dropped.
    pub fn serve_control_socket(&mut self, path: &Path) -> Result<ControlServer> {
        let (tx, mut inbox) = control_channel();
        let catalog = Arc::clone(&self.catalog);

        let ready = self.monitor.add_socket(
            "control",
            Box::new(move || {
                for request in inbox.drain() {
                    let reply = catalog.handle_request(request.frames());
                    request.respond(vec![reply.to_wire()]);
                }
                Ok(())
            }),
        );

        ControlServer::bind(path, ControlQueue::new(tx, ready))
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.monitor
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.monitor.stop_handle()
    }

    pub async fn run(&mut self) -> i32 {
        self.monitor.run().await
    }
}
