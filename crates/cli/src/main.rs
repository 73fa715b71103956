mod config;
mod demo;
mod error;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use runtime::{Origin, Registry, ToolHost};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "toolhost.toml";

#[derive(Parser)]
#[command(name = "toolhost")]
#[command(about = "Run builtin and remote tools behind one interface", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./toolhost.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered capabilities
    List {
        /// Only show capabilities from this origin
        #[arg(short, long)]
        origin: Option<OriginArg>,
    },
    /// Print function-calling declarations as JSON
    Declarations {
        /// Capability names (all when omitted)
        names: Vec<String>,
    },
    /// Execute one capability
    Call {
        /// Capability name
        name: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Report registry health
    Health,
    /// Serve the demo capability server on stdin/stdout
    #[command(hide = true)]
    ServeDemo,
}

#[derive(Clone, Copy, ValueEnum)]
enum OriginArg {
    Builtin,
    Remote,
}

impl From<OriginArg> for Origin {
    fn from(origin: OriginArg) -> Self {
        match origin {
            OriginArg::Builtin => Origin::Builtin,
            OriginArg::Remote => Origin::Remote,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    if let Commands::ServeDemo = cli.command {
        return demo::run().await;
    }

    let host = ToolHost::start(Registry::global(), &config.tools).await;
    let result = dispatch(&host, cli.command).await;

    let failures = host.shutdown().await;
    if failures > 0 {
        debug!(failures, "some servers did not close cleanly");
    }
    result
}

async fn dispatch(host: &ToolHost, command: Commands) -> Result<()> {
    let manager = host.manager();

    match command {
        Commands::List { origin } => {
            let descriptors = manager.registry().describe_all();
            let wanted = origin.map(Origin::from);
            for descriptor in descriptors.values() {
                if wanted.is_some_and(|o| o != descriptor.origin) {
                    continue;
                }
                println!(
                    "{:<32}  {:<8}  {}",
                    descriptor.name, descriptor.origin, descriptor.description
                );
            }
            Ok(())
        }
        Commands::Declarations { names } => {
            let names = (!names.is_empty()).then_some(names);
            print_json(&manager.to_declaration_list(names.as_deref()))
        }
        Commands::Call { name, args } => {
            let arguments = serde_json::from_str(&args).map_err(Error::InvalidArguments)?;
            let result = manager.execute(&name, arguments).await;
            print_json(&result)?;
            match result.error {
                Some(error) if !result.success => Err(Error::CallFailed(error)),
                _ => Ok(()),
            }
        }
        Commands::Health => print_json(&manager.health_check()),
        Commands::ServeDemo => demo::run().await,
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(CONFIG_FILE).exists() => Ok(Config::load(CONFIG_FILE)?),
        None => Ok(Config::default()),
    }
}

/// Logs go to stderr; stdout carries command output and protocol traffic.
fn init_logging(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    println!("{rendered}");
    Ok(())
}
