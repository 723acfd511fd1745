use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "supervisor")]
#[command(version)]
#[command(about = "Launches, monitors and restarts agent plugins", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the supervisor in the foreground (Ctrl+C to stop)
    Run {
        /// Config file (default: $SUPERVISOR_CONFIG or ~/.config/supervisor/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Send a control request to a running supervisor
    Ctl {
        #[command(subcommand)]
        command: CtlCommands,

        /// Control socket (default: $SUPERVISOR_SOCKET or the configured path)
        #[arg(short, long, global = true)]
        socket: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub(crate) enum CtlCommands {
    /// Enable a plugin, reloading its descriptor
    Start { plugin: String },

    /// Disable a plugin; it is stopped on the next pass
    Stop { plugin: String },

    /// Stop a plugin and drop it from supervision
    Remove { plugin: String },

    /// Report whether a plugin is running
    IsRunning { plugin: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_ctl_with_socket() {
        let cli = Cli::try_parse_from([
            "supervisor",
            "ctl",
            "is-running",
            "scanner",
            "--socket",
            "/tmp/s.sock",
        ])
        .unwrap();

        match cli.command {
            Commands::Ctl {
                command: CtlCommands::IsRunning { plugin },
                socket,
            } => {
                assert_eq!(plugin, "scanner");
                assert_eq!(socket, Some(PathBuf::from("/tmp/s.sock")));
            }
            _ => panic!("expected ctl is-running"),
        }
    }
}
