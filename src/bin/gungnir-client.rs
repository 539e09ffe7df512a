//! Command-line client for a running Gungnir server.

use std::process::exit;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gungnir::{Client, Result};

#[derive(Parser, Debug)]
#[command(name = "gungnir-client", version, about = "ordered key-value store client")]
struct Args {
    /// Server address, as host:port.
    #[arg(long, default_value = "127.0.0.1:4160")]
    connect: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the value stored under a key.
    Get { key: u64 },
    /// Store a value under a key, replacing any previous one.
    Put { key: u64, value: String },
    /// Delete a key; succeeds whether or not it exists.
    Erase { key: u64 },
    /// List keys and values in the inclusive range [start, end].
    Scan { start: u64, end: u64 },
}

fn run(args: Args) -> Result<()> {
    let mut client = Client::connect(&args.connect)?;
    match args.command {
        Command::Get { key } => match client.get(key)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => {
                eprintln!("{key}: no such object");
                exit(2);
            }
        },
        Command::Put { key, value } => client.put(key, value.as_bytes())?,
        Command::Erase { key } => client.erase(key)?,
        Command::Scan { start, end } => {
            for item in client.scan(start, end)? {
                let (key, value) = item?;
                println!("{key}\t{}", String::from_utf8_lossy(&value));
            }
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("gungnir-client: {err}");
        exit(1);
    }
}
