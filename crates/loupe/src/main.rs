use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use loupe_agent::tools::ToolRegistry;
use loupe_agent::{Agent, ServerRegistry, rpc};
use tokio::process::Command as TokioCommand;
use tokio::time::{Duration, timeout};

#[derive(Debug, Parser)]
#[command(name = "loupe")]
#[command(version, about = "Symbol-level code toolkit backed by language servers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the tool-call protocol over stdio
    Serve {
        /// Project root to activate at startup (defaults to the current directory)
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// Print the language-server registry and check which commands resolve
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the tool-call protocol; keep logs on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Serve { project } => {
            let agent = Agent::new(ServerRegistry::builtin());
            let root = project.unwrap_or_else(|| PathBuf::from("."));
            agent.activate_project(&root).await?;

            let registry = ToolRegistry::with_core_tools();
            rpc::run_stdio(&agent, &registry).await?;

            agent.deactivate().await;
            Ok(())
        }
        Command::Doctor => {
            let registry = ServerRegistry::builtin();
            let mut rows: Vec<_> = registry.languages().collect();
            rows.sort_by_key(|(language, _)| language.id());

            for (language, launch) in rows {
                let available = command_resolves(&launch.command).await;
                println!(
                    "{language:<12} {:<28} {}",
                    format!("{} {}", launch.command, launch.args.join(" ")),
                    if available { "ok" } else { "missing" }
                );
            }
            Ok(())
        }
    }
}

async fn command_resolves(command: &str) -> bool {
    let probe = TokioCommand::new(command)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    match probe {
        Ok(mut child) => {
            if timeout(Duration::from_secs(2), child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
            true
        }
        Err(_) => false,
    }
}
