mod args;
mod cmd_supervisor;
mod init;

use args::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run { config } => {
            let config = cmd_supervisor::load_config(config)?;
            init::initialize_logging(config.log_file().as_deref())?;
            cmd_supervisor::cmd_run(config).await?
        }
        Commands::Ctl { command, socket } => {
            init::initialize_logging(None)?;
            cmd_supervisor::cmd_ctl(command, socket).await?
        }
    };

    std::process::exit(code);
}
