//! The Arachne demo server CLI.
//!
//! - `arachne serve` - Run a broadcast chat server over TCP
//! - `arachne warmup` - Time the decoder warm-up and exit
//!
//! Options are read from `--config` (or `./arachne.toml` when present);
//! flags given on the command line win over the file.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use arachne_ws::{warmup, LogLevel, Options, Server, TcpHost};

/// Looked up in the working directory when `--config` is not given.
const DEFAULT_CONFIG: &str = "arachne.toml";

const GREETING: &str = "Hello from the server!";

#[derive(Parser)]
#[command(name = "arachne", version, about = "A from-scratch WebSocket server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve WebSocket clients, echoing every message to all peers
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8008")]
        bind: String,

        /// Options file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log level: debug, info, warn or error
        #[arg(long)]
        verbose: Option<LogLevel>,

        /// Log the time spent handling every inbound chunk
        #[arg(long)]
        benchmarks: bool,

        /// Skip the decoder warm-up
        #[arg(long = "no-warmup")]
        no_warmup: bool,
    },
    /// Run the decoder warm-up once and report its timing
    Warmup {
        /// Number of decode runs
        #[arg(long, default_value_t = 150)]
        runs: u32,

        /// Payload size of the synthetic frame, in bytes
        #[arg(long, default_value_t = 1024 * 1024)]
        size: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve {
            bind,
            config,
            verbose,
            benchmarks,
            no_warmup,
        } => {
            let mut options = load_options(config.as_deref())?;
            apply_overrides(&mut options, verbose, benchmarks, no_warmup);
            init_logging(options.verbose);
            serve(&bind, options)
        }
        Commands::Warmup { runs, size } => {
            init_logging(LogLevel::Info);
            let options = Options {
                warmup_runs: runs,
                warmup_data_size: size,
                ..Options::default()
            };
            let report = warmup::run(&options);
            println!(
                "{} runs of {} bytes in {:?} ({:?} per run)",
                report.runs,
                report.bytes_per_run,
                report.elapsed,
                report.per_run()
            );
            Ok(())
        }
    }
}

/// Read options from `path`, or from `./arachne.toml` if it exists, or fall
/// back to the defaults.
fn load_options(path: Option<&Path>) -> Result<Options> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG);
            if !fallback.is_file() {
                return Ok(Options::default());
            }
            fallback
        }
    };
    Options::from_file(&path).with_context(|| format!("loading {}", path.display()))
}

fn apply_overrides(options: &mut Options, verbose: Option<LogLevel>, benchmarks: bool, no_warmup: bool) {
    if let Some(level) = verbose {
        options.verbose = level;
    }
    if benchmarks {
        options.benchmarks = true;
    }
    if no_warmup {
        options.do_warmup = false;
    }
}

/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str())),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn serve(bind: &str, options: Options) -> Result<()> {
    let mut server = Server::new(options);
    server.on_connection(|conn| {
        info!(conn = %conn.id(), "client connected");
        if let Err(e) = conn.send(GREETING) {
            warn!(conn = %conn.id(), error = %e, "greeting failed");
        }
        conn.on_message(|conn, message| {
            info!(conn = %conn.id(), %message, "message received");
            conn.broadcast(message, true);
        });
        conn.on_close(|conn| info!(conn = %conn.id(), "client disconnected"));
    });

    let host = TcpHost::bind(bind).with_context(|| format!("binding {}", bind))?;
    host.run(server).context("running host")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn serve_args(args: &[&str]) -> (Option<PathBuf>, Option<LogLevel>, bool, bool, String) {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Serve {
                bind,
                config,
                verbose,
                benchmarks,
                no_warmup,
            } => (config, verbose, benchmarks, no_warmup, bind),
            Commands::Warmup { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn test_serve_defaults() {
        let (config, verbose, benchmarks, no_warmup, bind) = serve_args(&["arachne", "serve"]);
        assert_eq!(bind, "127.0.0.1:8008");
        assert!(config.is_none() && verbose.is_none());
        assert!(!benchmarks && !no_warmup);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "verbose = \"error\"").unwrap();
        writeln!(file, "warmup_runs = 7").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let (config, verbose, benchmarks, no_warmup, _) = serve_args(&[
            "arachne",
            "serve",
            "--config",
            &path,
            "--verbose",
            "debug",
            "--benchmarks",
            "--no-warmup",
        ]);
        let mut options = load_options(config.as_deref()).unwrap();
        assert_eq!(options.verbose, LogLevel::Error);
        apply_overrides(&mut options, verbose, benchmarks, no_warmup);

        assert_eq!(options.verbose, LogLevel::Debug);
        assert!(options.benchmarks);
        assert!(!options.do_warmup);
        assert_eq!(options.warmup_runs, 7);
    }

    #[test]
    fn test_unknown_level_is_rejected() {
        assert!(Cli::try_parse_from(["arachne", "serve", "--verbose", "loud"]).is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_options(Some(dir.path().join("nope.toml").as_path())).unwrap_err();
        assert!(format!("{:#}", err).starts_with("loading "));
    }

    #[test]
    fn test_warmup_args() {
        let cli = Cli::try_parse_from(["arachne", "warmup", "--runs", "3", "--size", "64"]).unwrap();
        assert!(matches!(cli.command, Commands::Warmup { runs: 3, size: 64 }));
    }
}
