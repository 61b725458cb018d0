mod agent_files;
mod cli;
mod config;
mod progress;
mod run_cmd;
mod shutdown;

#[cfg(test)]
mod test_util;

use clap::Parser;

use cli::{Cli, Commands};
use config::ResolvedConfig;

fn init_tracing(cli: &Cli) {
    let filter = if let Some(level) = &cli.log_level {
        tracing_subscriber::EnvFilter::new(level.clone())
    } else {
        let default = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Commands::Run(args) => {
            let resolved = ResolvedConfig::resolve(&args)?;
            run_cmd::run(resolved).await?;
        }
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::InstallAgentFiles { repo_root } => {
            let repo_root = repo_root.unwrap_or_else(|| std::path::PathBuf::from("."));
            let installed = agent_files::install_agent_files(&repo_root)?;
            if installed {
                println!("installed AGENTS.md into {}", repo_root.display());
            } else {
                println!("AGENTS.md already present in {}", repo_root.display());
            }
        }
    }

    Ok(())
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nuse --force to overwrite.", path.display());
    }
    config::save_config(&config::ConfigFile::default())?;
    println!("config written to {}", path.display());
    println!("edit it to set defaults for concurrency, retries, backend, and more.");
    Ok(())
}
