//! candiag CLI - UDS diagnostics over ISO-TP on CAN
//!
//! Runs one diagnostic command against SocketCAN or the built-in simulated
//! ECU and prints the result.

mod commands;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use candiag::config::{MockConfig, SocketCanConfig, TransportConfig};
use candiag::parse::parse_can_id;
use candiag::{create_transport, DiagConfig, Orchestrator};

use crate::commands::DiagSession;
use crate::output::OutputContext;

#[derive(Parser)]
#[command(name = "candiag")]
#[command(author, version, about = "UDS diagnostics over ISO-TP on CAN")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CANDIAG_CONFIG")]
    config: Option<PathBuf>,

    /// Use the built-in simulated ECU
    #[arg(long, conflicts_with = "interface")]
    mock: bool,

    /// SocketCAN interface (e.g., can0)
    #[arg(short, long, env = "CANDIAG_INTERFACE")]
    interface: Option<String>,

    /// Let the kernel ISO-TP socket do segmentation (requires --interface)
    #[arg(long, requires = "interface")]
    kernel_isotp: bool,

    /// Transmit CAN ID, tester to ECU (e.g., 0x7E0)
    #[arg(long, value_parser = parse_can_id)]
    tx: Option<u32>,

    /// Receive CAN ID, ECU to tester (e.g., 0x7E8)
    #[arg(long, value_parser = parse_can_id)]
    rx: Option<u32>,

    /// Use 29-bit identifiers
    #[arg(long)]
    extended: bool,

    /// Enter this session before running the command
    #[arg(long, value_name = "TYPE")]
    session: Option<String>,

    /// How long to wait for each result, in milliseconds
    #[arg(long, default_value = "5000")]
    wait_ms: u64,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Change diagnostic session
    Session {
        /// Session type: default, programming, extended, eol or a number
        #[arg(value_name = "TYPE")]
        session_type: String,
    },

    /// Read data identifier(s)
    Read {
        /// DID(s) to read (e.g., F190)
        #[arg(required = true)]
        dids: Vec<String>,
    },

    /// Write a data identifier
    Write {
        /// DID to write
        did: String,

        /// Value as hex bytes (e.g., "01 02 03")
        #[arg(required_unless_present = "text")]
        data: Option<String>,

        /// Value as ASCII text
        #[arg(long, conflicts_with = "data")]
        text: Option<String>,
    },

    /// Read diagnostic trouble codes
    Dtcs {
        /// Status mask
        #[arg(long, default_value = "0xFF")]
        mask: String,

        /// ReadDTCInformation sub-function
        #[arg(long, default_value = "0x02")]
        sub_function: String,

        /// Only report the number of matching DTCs
        #[arg(long)]
        count: bool,
    },

    /// Clear diagnostic information
    ClearDtcs {
        /// DTC group (default: all groups)
        #[arg(default_value = "0xFFFFFF")]
        group: String,
    },

    /// Reset ECU
    Reset {
        /// Reset type: hard, key_off_on, soft or a number
        #[arg(long, default_value = "hard")]
        reset_type: String,
    },

    /// Security access (unlock ECU)
    Unlock {
        /// Seed level (odd)
        #[arg(long, default_value = "1")]
        level: String,

        /// Key as hex bytes; computed with the configured algorithm if omitted
        #[arg(long)]
        key: Option<String>,
    },

    /// Send TesterPresent
    TesterPresent {
        /// Ask the ECU not to answer
        #[arg(long)]
        suppress: bool,
    },

    /// Send a raw UDS request
    Raw {
        /// Request bytes as hex, starting with the service id
        payload: String,
    },

    /// Print diagnostic events until Ctrl+C
    Monitor {
        /// Also print every transmitted frame
        #[arg(long)]
        frames: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let mut config = match &cli.config {
        Some(path) => DiagConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DiagConfig::default(),
    };
    apply_overrides(&cli, &mut config);

    let ctx = OutputContext::new(cli.json, cli.no_color, cli.quiet);

    let transport = create_transport(&config.transport).context("Failed to open CAN transport")?;
    let orchestrator = Orchestrator::from_config(transport, &config)?;
    let addressing = config.addressing()?;
    orchestrator
        .connect(addressing)
        .await
        .context("Failed to connect to ECU")?;

    let mut diag = DiagSession::new(&orchestrator, Duration::from_millis(cli.wait_ms));
    let result = commands::with_keepalive(
        &orchestrator,
        &config.keepalive,
        run(&cli, &config, &mut diag, &ctx),
    )
    .await;

    orchestrator.disconnect().await;
    result
}

async fn run(
    cli: &Cli,
    config: &DiagConfig,
    diag: &mut DiagSession<'_>,
    ctx: &OutputContext,
) -> Result<()> {
    if let Some(session_type) = &cli.session {
        commands::session(diag, session_type, ctx).await?;
    }

    match &cli.command {
        Commands::Session { session_type } => {
            // Already entered through --session
            if cli.session.as_deref() != Some(session_type.as_str()) {
                commands::session(diag, session_type, ctx).await?;
            }
        }

        Commands::Read { dids } => {
            commands::read(diag, dids, ctx).await?;
        }

        Commands::Write { did, data, text } => {
            commands::write(diag, did, data.as_deref(), text.as_deref(), ctx).await?;
        }

        Commands::Dtcs {
            mask,
            sub_function,
            count,
        } => {
            commands::dtcs(diag, sub_function, mask, *count, ctx).await?;
        }

        Commands::ClearDtcs { group } => {
            commands::clear_dtcs(diag, group, ctx).await?;
        }

        Commands::Reset { reset_type } => {
            commands::reset(diag, reset_type, ctx).await?;
        }

        Commands::Unlock { level, key } => {
            commands::unlock(diag, level, key.as_deref(), config.security, ctx).await?;
        }

        Commands::TesterPresent { suppress } => {
            commands::tester_present(diag, *suppress, ctx).await?;
        }

        Commands::Raw { payload } => {
            commands::raw(diag, payload, ctx).await?;
        }

        Commands::Monitor { frames } => {
            commands::monitor(diag, *frames, ctx).await?;
        }
    }

    Ok(())
}

/// Command-line options take precedence over the config file
fn apply_overrides(cli: &Cli, config: &mut DiagConfig) {
    if cli.mock {
        if !matches!(config.transport, TransportConfig::Mock(_)) {
            config.transport = TransportConfig::Mock(MockConfig::default());
        }
    } else if let Some(interface) = &cli.interface {
        config.transport = TransportConfig::SocketCan(SocketCanConfig::new(interface.clone()));
    }
    if let TransportConfig::SocketCan(socketcan) = &mut config.transport {
        if cli.kernel_isotp {
            socketcan.kernel_isotp = true;
        }
    }

    if let Some(tx) = cli.tx {
        config.addressing.tx_id = format!("0x{:X}", tx);
    }
    if let Some(rx) = cli.rx {
        config.addressing.rx_id = format!("0x{:X}", rx);
    }
    if cli.extended {
        config.addressing.extended = true;
    }

    // The simulated ECU follows the tester's identifiers
    if let TransportConfig::Mock(mock) = &mut config.transport {
        if let Some(tx) = cli.tx {
            mock.request_id = tx;
        }
        if let Some(rx) = cli.rx {
            mock.response_id = rx;
        }
    }
}
