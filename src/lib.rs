pub mod config;
pub mod daemon;
pub mod engine;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

use daemon::client::{SpeakClient, speak_tool};
use daemon::playback::SystemPlayer;
use engine::CommandEngineLoader;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "ltts",
    version,
    about = "Local text-to-speech through a shared singleton daemon"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue text for synthesis and playback (spawns the daemon if needed)
    Speak {
        /// Text to speak
        text: String,

        /// Voice-clone reference file (overrides the configured default)
        #[arg(long)]
        voice: Option<PathBuf>,
    },
    /// Run the inference daemon in the foreground
    Daemon {
        /// Override the listening socket path
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// Ask a running daemon to shut down
    Shutdown,
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Speak { text, voice } => {
            let client = SpeakClient::with_defaults();
            println!("{}", speak_tool(&client, &text, voice.as_deref()));
            Ok(())
        }
        Commands::Daemon { socket } => {
            let mut config = config::ServiceConfig::from_env();
            if let Some(path) = socket {
                config.socket_path = path;
            }
            daemon::run_daemon(
                config,
                Box::new(CommandEngineLoader),
                Box::new(SystemPlayer),
            )
        }
        Commands::Status => {
            let client = SpeakClient::with_defaults();
            if !client.is_running() {
                println!("Status: stopped (will auto-start on next request)");
                return Ok(());
            }
            let status = client.status()?;
            println!("Status: running");
            println!("Model loaded: {}", status.model_loaded);
            println!("Queue depth: {}", status.queue_depth);
            println!("Uptime: {}s", status.uptime_secs);
            println!("Requests served: {}", status.total_requests);
            println!("Daemon RSS: {:.1} MB", status.rss_bytes as f64 / 1048576.0);
            println!(
                "System memory used: {:.1}%",
                status.used_memory_fraction * 100.0
            );
            Ok(())
        }
        Commands::Shutdown => {
            let client = SpeakClient::with_defaults();
            if !client.is_running() {
                println!("Daemon is not running.");
                return Ok(());
            }
            client.shutdown()?;
            println!("Shutdown requested.");
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "ltts", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}
