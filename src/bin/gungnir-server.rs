//! Starts a Gungnir server. `gungnir-server --help` lists the options.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gungnir::{Config, Result, Server};

#[derive(Parser, Debug)]
#[command(name = "gungnir-server", version, about = "ordered key-value store server")]
struct Args {
    /// Address to listen on, as host:port.
    #[arg(long, default_value = "127.0.0.1:4160")]
    listen: String,

    /// Path of the write-ahead log file.
    #[arg(long)]
    log_file_path: PathBuf,

    /// Replay the write-ahead log before serving.
    #[arg(long)]
    recover: bool,

    /// Worker thread count; defaults to half the cores.
    #[arg(long)]
    max_cores: Option<usize>,
}

fn run(args: Args) -> Result<()> {
    let mut config = Config::default()
        .listen(args.listen)
        .log_file_path(args.log_file_path)
        .recover(args.recover);
    if let Some(cores) = args.max_cores {
        config = config.max_cores(cores);
    }

    let server = Server::new(config)?;
    info!(addr = %server.local_addr(), "gungnir serving");
    server.run()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("gungnir-server: {err}");
        exit(1);
    }
}
