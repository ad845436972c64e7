mod commands;

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use gasoline_core::{Config, Paths};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "gasoline")]
#[command(about = "Browser observability for coding agents over MCP", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("mode").args(["daemon", "bridge", "stop", "force", "status"])))]
struct Cli {
    /// Port the daemon listens on (overrides config server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// State directory (defaults to ~/.gasoline or $GASOLINE_STATE_DIR)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Shared secret required in X-Gasoline-Key (daemon mode)
    #[arg(long)]
    api_key: Option<String>,

    /// Run the HTTP daemon in the foreground
    #[arg(long)]
    daemon: bool,

    /// Forward stdio JSON-RPC to the daemon, starting it if needed
    #[arg(long)]
    bridge: bool,

    /// Stop the daemon on --port
    #[arg(long)]
    stop: bool,

    /// Kill every running daemon
    #[arg(long)]
    force: bool,

    /// Print daemon health
    #[arg(long)]
    status: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

enum Mode {
    Daemon,
    Bridge,
    Stop,
    Force,
    Status,
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.daemon {
            Mode::Daemon
        } else if self.bridge {
            Mode::Bridge
        } else if self.stop {
            Mode::Stop
        } else if self.force {
            Mode::Force
        } else if self.status {
            Mode::Status
        } else if std::io::stdin().is_terminal() {
            // Interactive shell: nobody is speaking JSON-RPC on stdin.
            Mode::Daemon
        } else {
            Mode::Bridge
        }
    }

    fn paths(&self) -> Paths {
        match &self.state_dir {
            Some(dir) => Paths::with_base(dir.clone()),
            None => Paths::new(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = cli.mode();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    // stdout belongs to JSON-RPC frames in bridge mode.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let paths = cli.paths();
    let config = Config::load_or_default(&paths)?;
    let port = cli.port.unwrap_or(config.server.port);
    match mode {
        Mode::Daemon => commands::daemon::run(paths, config, port, cli.api_key).await?,
        Mode::Bridge => commands::bridge::run(paths, &config, port).await?,
        Mode::Stop => commands::stop::stop(&paths, &config, port).await?,
        Mode::Force => commands::stop::force(&paths).await?,
        Mode::Status => commands::status::run(&paths, &config, port).await?,
    }

    Ok(())
}
