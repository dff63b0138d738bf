mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "hdlclink",
    version,
    about = "Embedded RPC and device logs over HDLC serial links"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "HDLCLINK_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_subcommand() {
        let cli = Cli::try_parse_from([
            "hdlclink",
            "call",
            "/dev/ttyACM0",
            "pw.rpc.EchoService",
            "Echo",
            "--arg",
            "msg=hello",
            "--timeout",
            "250ms",
        ])
        .expect("call args should parse");

        let Command::Call(args) = cli.command else {
            panic!("expected call");
        };
        assert_eq!(args.device.device, "/dev/ttyACM0");
        assert_eq!(args.service, "pw.rpc.EchoService");
        assert_eq!(args.args, vec!["msg=hello".to_string()]);
        assert_eq!(args.timeout.as_deref(), Some("250ms"));
    }

    #[test]
    fn parses_logs_with_config_and_count() {
        let cli = Cli::try_parse_from([
            "hdlclink",
            "logs",
            "/dev/ttyUSB0",
            "--config",
            "/etc/hdlclink.json",
            "--baud",
            "921600",
            "--count",
            "10",
        ])
        .expect("logs args should parse");

        let Command::Logs(args) = cli.command else {
            panic!("expected logs");
        };
        assert_eq!(args.device.baud, Some(921_600));
        assert_eq!(args.count, Some(10));
        assert!(args.device.config.is_some());
    }

    #[test]
    fn protobufs_flag_repeats() {
        let cli = Cli::try_parse_from([
            "hdlclink",
            "services",
            "--protobufs",
            "a.rpc.json",
            "--protobufs",
            "protos/",
        ])
        .expect("services args should parse");

        let Command::Services(args) = cli.command else {
            panic!("expected services");
        };
        assert_eq!(args.protobufs.len(), 2);
    }

    #[test]
    fn call_requires_method() {
        let err = Cli::try_parse_from(["hdlclink", "call", "/dev/ttyACM0", "EchoService"])
            .expect_err("missing method should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn log_format_is_global() {
        let cli = Cli::try_parse_from(["hdlclink", "doctor", "--log-format", "json"])
            .expect("global flag after subcommand should parse");
        assert!(matches!(cli.log_format, LogFormat::Json));
    }
}
