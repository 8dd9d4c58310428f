//! jailbox - an OCI runtime that puts containers in FreeBSD jails.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use jailbox_runtime::commands::{create, delete, exec, features, kill, list, start, state};
use jailbox_runtime::{Runtime, TestMode};

#[derive(Parser)]
#[command(name = "jailbox", version, about = "OCI container runtime for FreeBSD jails")]
struct Cli {
    /// State directory root
    #[arg(long, global = true, default_value = "/var/run/jailbox")]
    root: PathBuf,

    /// Log file path
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Log record format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Exit after config validation (unit test mode)
    #[arg(long, global = true, value_enum, default_value_t = Testing::None, hide = true)]
    testing: Testing,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Testing {
    None,
    Validation,
}

impl From<Testing> for TestMode {
    fn from(mode: Testing) -> Self {
        match mode {
            Testing::None => TestMode::None,
            Testing::Validation => TestMode::Validation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ListFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a jail instance for the container described by the given
    /// bundle directory
    Create {
        /// Unique identifier for the container
        container_id: String,

        /// Path to the OCI runtime bundle directory
        #[arg(short, long)]
        bundle: PathBuf,

        /// Socket which will receive the console pty descriptor
        #[arg(long)]
        console_socket: Option<PathBuf>,

        /// File where the container process id will be written
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Number of additional file descriptors for the container
        #[arg(long, default_value_t = 0)]
        preserve_fds: i32,
    },

    /// Start the container with the given id
    Start {
        /// Unique identifier for the container
        container_id: String,
    },

    /// Send a signal to a container
    Kill {
        /// Unique identifier for the container
        container_id: String,

        /// Signal to send, defaults to TERM
        signal: Option<String>,

        /// Send the signal to all processes in the container
        #[arg(short, long, conflicts_with = "pid")]
        all: bool,

        /// Send the signal to the given process
        #[arg(short, long)]
        pid: Option<i32>,
    },

    /// Delete the container with the given id
    Delete {
        /// Unique identifier for the container
        container_id: String,

        /// Delete even if running
        #[arg(long)]
        force: bool,
    },

    /// Get the state of the container with the given id
    State {
        /// Unique identifier for the container
        container_id: String,
    },

    /// Execute a command in the container with the given id
    Exec {
        /// Unique identifier for the container
        container_id: String,

        /// Path to a file containing the process json
        #[arg(long)]
        process: PathBuf,

        /// Allocate a pseudo-tty for the new process
        #[arg(short, long)]
        tty: bool,

        /// Detach the command and execute in the background
        #[arg(short, long)]
        detach: bool,

        /// Socket which will receive the console pty descriptor
        #[arg(long)]
        console_socket: Option<PathBuf>,

        /// File where the process id will be written
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Number of additional file descriptors for the process
        #[arg(long, default_value_t = 0)]
        preserve_fds: i32,
    },

    /// List containers
    List {
        /// Show only IDs
        #[arg(short, long)]
        quiet: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },

    /// Get the enabled feature set of the runtime
    Features,
}

fn init_logging(log: Option<&PathBuf>, format: LogFormat) -> anyhow::Result<()> {
    match log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o600)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let writer = std::sync::Mutex::new(file);
            match format {
                LogFormat::Text => tracing_subscriber::fmt()
                    .with_max_level(tracing::Level::INFO)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init(),
                LogFormat::Json => tracing_subscriber::fmt()
                    .json()
                    .with_max_level(tracing::Level::INFO)
                    .with_writer(writer)
                    .init(),
            }
        }
        None => {
            // No log file: the subscriber only serves RUST_LOG-driven
            // debugging; command failures go to stderr via main.
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
                        .from_env_lossy(),
                )
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn dispatch(runtime: &Runtime, command: &Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Create {
            container_id,
            bundle,
            console_socket,
            pid_file,
            preserve_fds,
        } => {
            let args = create::CreateArgs {
                id: container_id.clone(),
                bundle: bundle.clone(),
                console_socket: console_socket.clone(),
                pid_file: pid_file.clone(),
                preserve_fds: *preserve_fds,
            };
            Ok(create::run(runtime, &args)?)
        }
        Commands::Start { container_id } => {
            start::run(runtime, container_id)?;
            Ok(0)
        }
        Commands::Kill {
            container_id,
            signal,
            all,
            pid,
        } => {
            let args = kill::KillArgs {
                id: container_id.clone(),
                signal: signal.clone(),
                all: *all,
                pid: *pid,
            };
            kill::run(runtime, &args)?;
            Ok(0)
        }
        Commands::Delete {
            container_id,
            force,
        } => {
            delete::run(runtime, container_id, *force)?;
            Ok(0)
        }
        Commands::State { container_id } => {
            let doc = state::run(runtime, container_id)?;
            println!("{doc}");
            Ok(0)
        }
        Commands::Exec {
            container_id,
            process,
            tty,
            detach,
            console_socket,
            pid_file,
            preserve_fds,
        } => {
            let args = exec::ExecArgs {
                id: container_id.clone(),
                process_file: process.clone(),
                tty: *tty,
                detach: *detach,
                console_socket: console_socket.clone(),
                pid_file: pid_file.clone(),
                preserve_fds: *preserve_fds,
            };
            Ok(exec::run(runtime, &args)?)
        }
        Commands::List { quiet, format } => {
            let entries = list::run(runtime)?;
            if *quiet {
                print!("{}", list::render_quiet(&entries));
            } else {
                match format {
                    ListFormat::Table => print!("{}", list::render_table(&entries)),
                    ListFormat::Json => println!("{}", list::render_json(&entries)),
                }
            }
            Ok(0)
        }
        Commands::Features => {
            println!("{}", features::document());
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log.as_ref(), cli.log_format) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    let runtime = Runtime::new(cli.root.clone()).with_test_mode(cli.testing.into());
    match dispatch(&runtime, &cli.command) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            // A configured log file gets the timestamped record; stderr
            // carries exactly one human-readable line either way.
            if cli.log.is_some() {
                error!("{e:#}");
            }
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
