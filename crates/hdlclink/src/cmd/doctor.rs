use std::path::PathBuf;
use std::time::Duration;

use hdlclink::sim::DeviceSimulator;
use hdlclink_rpc::{HdlcRpcTransport, RegistryConfig, ServiceRegistry, Transport, TransportConfig};
use hdlclink_transport::LoopbackOpener;
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, schema_id, OutputFormat};

const PROBE_MESSAGE: &str = "hdlclink-doctor";

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: String,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        loopback_round_trip_check(),
        descriptor_paths_check(),
        device_node_check(),
        CheckResult::new(
            "compiled_features",
            CheckStatus::Info,
            active_features().join(", "),
        ),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput {
        schema_id: schema_id("doctor-report"),
        checks,
        overall,
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("hdlclink doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<22} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

/// Drive a full transport session against the built-in simulator.
fn loopback_round_trip_check() -> CheckResult {
    const NAME: &str = "loopback_round_trip";
    match loopback_round_trip() {
        Ok(detail) => CheckResult::new(NAME, CheckStatus::Pass, detail),
        Err(detail) => CheckResult::new(NAME, CheckStatus::Fail, detail),
    }
}

fn loopback_round_trip() -> Result<String, String> {
    let opener = LoopbackOpener::new();
    let transport = HdlcRpcTransport::with_opener(
        Box::new(opener.clone()),
        ServiceRegistry::new(),
        &TransportConfig::default(),
    )
    .map_err(|err| format!("transport setup failed: {err}"))?;
    transport
        .open()
        .map_err(|err| format!("open failed: {err}"))?;

    let device = opener
        .take_device_end()
        .ok_or_else(|| "loopback device end missing".to_string())
        .and_then(|end| {
            DeviceSimulator::spawn(end).map_err(|err| format!("simulator failed: {err}"))
        })?;

    let outcome = probe(&transport, &device);
    transport
        .close()
        .map_err(|err| format!("close failed: {err}"))?;
    let _ = device.join();
    outcome
}

fn probe(transport: &HdlcRpcTransport, device: &DeviceSimulator) -> Result<String, String> {
    let (ack, echoed) = transport
        .echo_rpc(PROBE_MESSAGE)
        .map_err(|err| format!("echo failed: {err}"))?;
    if !ack || echoed.as_deref() != Some(PROBE_MESSAGE) {
        return Err(format!("echo mismatch: ack={ack} echoed={echoed:?}"));
    }

    device
        .send_log(PROBE_MESSAGE)
        .map_err(|err| format!("log send failed: {err}"))?;
    let line = transport
        .read(256, Duration::from_secs(1))
        .map_err(|err| format!("log read failed: {err}"))?
        .unwrap_or_default();
    if &line[..] != format!("{PROBE_MESSAGE}\n").as_bytes() {
        return Err(format!("log mismatch: {line:?}"));
    }

    Ok("echo and log stream round-tripped".to_string())
}

fn descriptor_paths_check() -> CheckResult {
    const NAME: &str = "descriptor_paths";
    let Some(value) = std::env::var_os("HDLCLINK_PROTOBUFS") else {
        return CheckResult::new(NAME, CheckStatus::Skip, "HDLCLINK_PROTOBUFS not set");
    };
    let paths: Vec<PathBuf> = std::env::split_paths(&value).collect();

    match ServiceRegistry::from_paths(&paths, RegistryConfig::default()) {
        Ok(registry) => CheckResult::new(
            NAME,
            CheckStatus::Pass,
            format!("{} services loaded", registry.services().len()),
        ),
        Err(err) => CheckResult::new(NAME, CheckStatus::Fail, err.to_string()),
    }
}

fn device_node_check() -> CheckResult {
    const NAME: &str = "device_node";
    let Some(path) = std::env::var_os("HDLCLINK_DEVICE").map(PathBuf::from) else {
        return CheckResult::new(NAME, CheckStatus::Skip, "HDLCLINK_DEVICE not set");
    };

    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) => {
            return CheckResult::new(
                NAME,
                CheckStatus::Fail,
                format!("{}: {err}", path.display()),
            )
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_char_device() {
            return CheckResult::new(
                NAME,
                CheckStatus::Warn,
                format!("{} is not a character device", path.display()),
            );
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    CheckResult::new(NAME, CheckStatus::Pass, format!("{} present", path.display()))
}

fn active_features() -> Vec<&'static str> {
    let mut features = vec!["cli"];
    if cfg!(feature = "async") {
        features.push("async");
    }
    features
}
