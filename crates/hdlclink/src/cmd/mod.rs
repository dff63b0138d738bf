use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use hdlclink_rpc::{HdlcRpcTransport, Transport, TransportConfig};

use crate::exit::{rpc_error, transport_error, CliError, CliResult};
use crate::output::OutputFormat;

pub mod call;
pub mod doctor;
pub mod echo;
pub mod logs;
pub mod services;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream device log lines.
    Logs(LogsArgs),
    /// Issue a single RPC call.
    Call(CallArgs),
    /// Round-trip a message through the device echo service.
    Echo(EchoArgs),
    /// List known services with their wire ids.
    Services(ServicesArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Logs(args) => logs::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Echo(args) => echo::run(args, format),
        Command::Services(args) => services::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
    }
}

/// Device selection shared by every command that opens a transport.
#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Serial device node.
    pub device: String,
    /// Transport config file (JSON).
    #[arg(long, value_name = "FILE", env = "HDLCLINK_CONFIG")]
    pub config: Option<PathBuf>,
    /// Baud rate (overrides the config file).
    #[arg(long)]
    pub baud: Option<u32>,
    /// Service descriptor file or directory; may be repeated.
    #[arg(long, value_name = "PATH")]
    pub protobufs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Exit after printing N lines.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Service name, bare or package-qualified.
    pub service: String,
    /// Method name.
    pub method: String,
    /// Request field as NAME=VALUE; may be repeated. Repeated fields take
    /// comma-separated values, bytes take 0x-prefixed hex.
    #[arg(long = "arg", short = 'a', value_name = "NAME=VALUE")]
    pub args: Vec<String>,
    /// Response timeout (e.g. 2s, 500ms). Defaults to the configured RPC timeout.
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Message to echo.
    #[arg(default_value = "ping")]
    pub message: String,
    /// Response timeout (e.g. 2s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct ServicesArgs {
    /// Transport config file (JSON); its descriptor paths are loaded.
    #[arg(long, value_name = "FILE", env = "HDLCLINK_CONFIG")]
    pub config: Option<PathBuf>,
    /// Service descriptor file or directory; may be repeated.
    #[arg(long, value_name = "PATH")]
    pub protobufs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

/// Load the config file, if any, and apply command-line overrides.
pub fn load_config(config: Option<&PathBuf>, protobufs: &[PathBuf]) -> CliResult<TransportConfig> {
    let mut loaded = match config {
        Some(path) => TransportConfig::from_file(path)
            .map_err(|err| rpc_error("config load failed", err))?,
        None => TransportConfig::default(),
    };
    loaded.protobufs.extend(protobufs.iter().cloned());
    Ok(loaded)
}

pub fn transport_config(args: &DeviceArgs) -> CliResult<TransportConfig> {
    let mut config = load_config(args.config.as_ref(), &args.protobufs)?;
    config.comms_address = args.device.clone();
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    Ok(config)
}

pub fn build_transport(args: &DeviceArgs) -> CliResult<HdlcRpcTransport> {
    let config = transport_config(args)?;
    HdlcRpcTransport::new(&config).map_err(|err| rpc_error("transport setup failed", err))
}

/// Close, reporting a stuck reader as a command failure.
pub fn close_transport(transport: &HdlcRpcTransport) -> CliResult<()> {
    transport
        .close()
        .map_err(|err| transport_error("close failed", err))
}

pub fn install_ctrlc_handler(
    running: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, std::sync::atomic::Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

pub fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("timeout must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid timeout value: {input}")))?;

    if value == 0 {
        return Err(CliError::usage("timeout must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

/// Split `NAME=VALUE` tokens.
pub fn parse_pairs(tokens: &[String]) -> CliResult<Vec<(String, String)>> {
    tokens
        .iter()
        .map(|token| match token.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok((name.trim().to_string(), value.to_string()))
            }
            _ => Err(CliError::usage(format!(
                "invalid argument '{token}': expected NAME=VALUE"
            ))),
        })
        .collect()
}
