use crate::args::CtlCommands;
use anyhow::{Context, Result};
use std::path::PathBuf;
use supervisor::daemon::{
    ControlClient, ControlCommand, PluginManager, PluginRegistry, ProxyContext,
};
use supervisor::SupervisorConfig;

pub(crate) fn load_config(path: Option<PathBuf>) -> Result<SupervisorConfig> {
    match path {
        Some(path) => SupervisorConfig::load_from(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => SupervisorConfig::load(),
    }
}

/// Supervise plugins until SIGTERM/SIGINT. Returns the process exit code.
pub(crate) async fn cmd_run(config: SupervisorConfig) -> Result<i32> {
    let install_root = config.install_root();
    let ctx = ProxyContext::system(config.proxy_timings());
    let registry = PluginRegistry::new(config.registry_dir(), &install_root, ctx.fs.clone())
        .with_core_dump_on_kill(config.core_dump_on_kill());

    tracing::info!(
        install_root = %install_root.display(),
        registry = %registry.dir().display(),
        "Supervisor starting"
    );

    let mut manager = PluginManager::new(registry, ctx, config.identity_file(), config.ipc_group())
        .with_poll_floor(config.poll_floor());
    manager.load_plugins().context("Failed to load plugin registry")?;

    let socket_path = config.socket_path();
    let _server = manager
        .serve_control_socket(&socket_path)
        .with_context(|| format!("Failed to bind control socket {}", socket_path.display()))?;

    Ok(manager.run().await)
}

/// Send one control request and print the reply. Error replies exit 1.
pub(crate) async fn cmd_ctl(command: CtlCommands, socket: Option<PathBuf>) -> Result<i32> {
    let socket = match socket {
        Some(socket) => socket,
        None => SupervisorConfig::load()?.socket_path(),
    };

    let (command, plugin) = match command {
        CtlCommands::Start { plugin } => (ControlCommand::Start, plugin),
        CtlCommands::Stop { plugin } => (ControlCommand::Stop, plugin),
        CtlCommands::Remove { plugin } => (ControlCommand::Remove, plugin),
        CtlCommands::IsRunning { plugin } => (ControlCommand::IsRunning, plugin),
    };

    let client = ControlClient::new(&socket);
    if !client.socket_exists() {
        anyhow::bail!(
            "Supervisor is not running (no socket at {})",
            socket.display()
        );
    }

    let reply = client
        .send(command, &plugin)
        .await
        .with_context(|| format!("{} {} failed", command, plugin))?;
    println!("{}", reply);

    Ok(if reply.is_error() { 1 } else { 0 })
}
