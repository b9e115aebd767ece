//! ctlink CLI - Command-line tool for talking to embedded controllers.
//!
//! ## Features
//!
//! - Read and set the controller clock
//! - Push firmware updates over the air or over serial
//! - Deliver raw network bytecode and device requests
//! - Monitor controller log output and link events
//! - Interactive serial port selection
//! - Simulated controller networks for scripting and demos
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand, ValueEnum},
    console::style,
    env_logger::Env,
    log::{debug, warn},
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;
mod session;

use {commands::device::Payload, config::Config};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl+C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl+C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Failures that carry their own exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or a setup the command cannot resolve (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// No controller could be found (exit 4).
    #[error("{0}")]
    DeviceNotFound(String),
    /// The user cancelled (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error chain to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::DeviceNotFound(_) => 4,
            CliError::Cancelled(_) => 130,
        };
    }
    if let Some(lib_err) = err.downcast_ref::<ctlink::Error>() {
        return match lib_err {
            ctlink::Error::NoDeviceFound => 4,
            ctlink::Error::Config(_) => 3,
            ctlink::Error::Interrupted | ctlink::Error::UserCanceledSelection => 130,
            _ => 1,
        };
    }
    1
}

/// ctlink - Talk to embedded controllers over serial or a simulated network.
///
/// Environment variables:
///   CTLINK_CONNECTOR         - Connector kind (serial, simulated)
///   CTLINK_PORT              - Serial port, or controller name when simulated
///   CTLINK_BAUD              - Serial baud rate (default: 115200)
///   CTLINK_NETWORK           - Simulated network definition (JSON)
///   CTLINK_TIMEOUT           - Selection/connect timeout in milliseconds
///   CTLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "ctlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Connector to use.
    #[arg(long, global = true, env = "CTLINK_CONNECTOR")]
    connector: Option<ConnectorArg>,

    /// Serial port (auto-detected if not specified), or controller name.
    #[arg(short, long, global = true, env = "CTLINK_PORT")]
    port: Option<String>,

    /// Serial baud rate.
    #[arg(short, long, global = true, env = "CTLINK_BAUD")]
    baud: Option<u32>,

    /// Simulated network definition (JSON).
    #[arg(long, global = true, env = "CTLINK_NETWORK", value_name = "PATH")]
    network: Option<PathBuf>,

    /// Selection, connect and exchange timeout in milliseconds.
    #[arg(short, long, global = true, env = "CTLINK_TIMEOUT", value_name = "MS")]
    timeout: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "CTLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Selectable connectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum ConnectorArg {
    /// Framed serial link to a gateway controller (default).
    Serial,
    /// In-process simulated network.
    Simulated,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Read or set the controller clock.
    Clock {
        #[command(subcommand)]
        action: ClockAction,
    },

    /// Push a firmware image to the controller.
    Update {
        /// Firmware image file.
        firmware: PathBuf,
    },

    /// Deliver network bytecode to the controller.
    Execute {
        /// Payload as hex (e.g. "0a0b0c" or "0x0a:0b:0c").
        payload: Payload,
    },

    /// Send a device request and print the response as hex.
    Request {
        /// Payload as hex.
        payload: Payload,

        /// Do not wait for a response.
        #[arg(long)]
        no_response: bool,
    },

    /// Print controller log output and link events.
    Monitor {
        /// Prefix log lines with a timestamp.
        #[arg(long)]
        timestamp: bool,

        /// Also append log lines to this file.
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ClockAction {
    /// Print the controller clock in milliseconds.
    Get {
        /// Output the full sample as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Set the controller clock.
    Set {
        /// Clock value in milliseconds.
        clock_ms: u64,
    },
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn main() {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    debug!(
        "ctlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        warn!("Could not install Ctrl+C handler: {e}");
    }

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Clock { action } => match action {
            ClockAction::Get { json } => commands::clock::cmd_clock_get(cli, &mut config, *json)?,
            ClockAction::Set { clock_ms } => {
                commands::clock::cmd_clock_set(cli, &mut config, *clock_ms)?;
            },
        },
        Commands::Update { firmware } => commands::update::cmd_update(cli, &mut config, firmware)?,
        Commands::Execute { payload } => commands::device::cmd_execute(cli, &mut config, &payload.0)?,
        Commands::Request {
            payload,
            no_response,
        } => commands::device::cmd_request(cli, &mut config, &payload.0, *no_response)?,
        Commands::Monitor {
            timestamp,
            log_file,
        } => commands::monitor::cmd_monitor(cli, &mut config, *timestamp, log_file.as_deref())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ctlink").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_clock_set() {
        let cli = parse(&["clock", "set", "60000"]);
        assert!(matches!(
            cli.command,
            Commands::Clock {
                action: ClockAction::Set { clock_ms: 60000 }
            }
        ));
    }

    #[test]
    fn test_cli_parse_execute_hex() {
        let cli = parse(&["execute", "0x0a0b"]);
        match cli.command {
            Commands::Execute { payload } => assert_eq!(payload, Payload(vec![0x0A, 0x0B])),
            _ => panic!("expected execute"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_hex() {
        assert!(Cli::try_parse_from(["ctlink", "request", "xyz"]).is_err());
    }

    #[test]
    fn test_cli_global_options() {
        let cli = parse(&[
            "--connector",
            "simulated",
            "--network",
            "net.json",
            "-t",
            "250",
            "-vv",
            "monitor",
            "--timestamp",
        ]);
        assert_eq!(cli.connector, Some(ConnectorArg::Simulated));
        assert_eq!(cli.network, Some(PathBuf::from("net.json")));
        assert_eq!(cli.timeout, Some(250));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Monitor {
                timestamp: true,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["ctlink"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&CliError::Usage(String::new()).into()), 2);
        assert_eq!(exit_code(&CliError::Config(String::new()).into()), 3);
        assert_eq!(exit_code(&CliError::DeviceNotFound(String::new()).into()), 4);
        assert_eq!(exit_code(&CliError::Cancelled(String::new()).into()), 130);
        assert_eq!(exit_code(&ctlink::Error::NoDeviceFound.into()), 4);
        assert_eq!(exit_code(&ctlink::Error::Interrupted.into()), 130);
        assert_eq!(
            exit_code(&ctlink::Error::WriteFailed { attempts: 3 }.into()),
            1
        );
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::from(ctlink::Error::NoDeviceFound).context("Failed to select");
        assert_eq!(exit_code(&err), 4);
    }
}
