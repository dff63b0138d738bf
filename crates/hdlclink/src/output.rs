use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use hdlclink_rpc::{RpcResponse, ServiceSchema};
use serde::Serialize;

const SCHEMA_BASE: &str = "https://schemas.3leaps.dev/hdlclink/cli/v1";

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

pub fn schema_id(name: &str) -> String {
    format!("{SCHEMA_BASE}/{name}.schema.json")
}

#[derive(Serialize)]
struct LogOutput<'a> {
    schema_id: String,
    device: &'a str,
    line: String,
    size: usize,
    timestamp: String,
}

/// Print one log chunk as read from the transport (newline-terminated).
pub fn print_log(chunk: &[u8], device: &str, format: OutputFormat) {
    let line = text_preview(chunk.strip_suffix(b"\n").unwrap_or(chunk));
    match format {
        OutputFormat::Json => {
            let out = LogOutput {
                schema_id: schema_id("log-line"),
                device,
                line,
                size: chunk.len(),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table | OutputFormat::Pretty => println!("{line}"),
        OutputFormat::Raw => print_raw(chunk),
    }
}

#[derive(Serialize)]
struct CallOutput<'a> {
    schema_id: String,
    device: &'a str,
    service: &'a str,
    method: &'a str,
    ack: bool,
    payload_size: Option<usize>,
    payload_hex: Option<String>,
}

pub fn print_call(
    device: &str,
    service: &str,
    method: &str,
    response: &RpcResponse,
    format: OutputFormat,
) {
    let payload = response.payload.as_deref();
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                schema_id: schema_id("rpc-call"),
                device,
                service,
                method,
                ack: response.ack,
                payload_size: payload.map(<[u8]>::len),
                payload_hex: payload.map(hex),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "METHOD", "ACK", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    service.to_string(),
                    method.to_string(),
                    response.ack.to_string(),
                    payload.map_or(0, <[u8]>::len).to_string(),
                    payload.map(hex).unwrap_or_default(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match payload {
            Some(payload) => println!(
                "{service}/{method}: ack size={} payload={}",
                payload.len(),
                hex(payload)
            ),
            None => println!("{service}/{method}: no ack"),
        },
        OutputFormat::Raw => {
            if let Some(payload) = payload {
                print_raw(payload);
            }
        }
    }
}

#[derive(Serialize)]
struct EchoOutput<'a> {
    schema_id: String,
    device: &'a str,
    message: &'a str,
    ack: bool,
    echoed: Option<&'a str>,
}

pub fn print_echo(
    device: &str,
    message: &str,
    ack: bool,
    echoed: Option<&str>,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let out = EchoOutput {
                schema_id: schema_id("echo"),
                device,
                message,
                ack,
                echoed,
            };
            print_json(&out);
        }
        OutputFormat::Table | OutputFormat::Pretty => match echoed {
            Some(echoed) if ack => println!("echo ok: {echoed}"),
            _ => println!("echo failed: no ack from {device}"),
        },
        OutputFormat::Raw => {
            if let Some(echoed) = echoed {
                println!("{echoed}");
            }
        }
    }
}

#[derive(Serialize)]
struct FieldOutput<'a> {
    name: &'a str,
    number: u32,
    kind: &'static str,
    repeated: bool,
}

#[derive(Serialize)]
struct MethodOutput<'a> {
    name: &'a str,
    id: String,
    request: Vec<FieldOutput<'a>>,
}

#[derive(Serialize)]
struct ServiceOutput<'a> {
    name: &'a str,
    id: String,
    methods: Vec<MethodOutput<'a>>,
}

#[derive(Serialize)]
struct ServicesOutput<'a> {
    schema_id: String,
    services: Vec<ServiceOutput<'a>>,
}

pub fn print_services(services: &[ServiceSchema], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ServicesOutput {
                schema_id: schema_id("services"),
                services: services
                    .iter()
                    .map(|service| ServiceOutput {
                        name: &service.full_name,
                        id: format_id(service.id),
                        methods: service
                            .methods
                            .iter()
                            .map(|method| MethodOutput {
                                name: &method.name,
                                id: format_id(method.id),
                                request: method
                                    .request
                                    .iter()
                                    .map(|field| FieldOutput {
                                        name: &field.name,
                                        number: field.number,
                                        kind: field.kind.as_str(),
                                        repeated: field.repeated,
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            };
            print_json(&out);
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "SERVICE ID", "METHOD", "METHOD ID", "REQUEST"]);
            for service in services {
                for method in &service.methods {
                    let fields = method
                        .request
                        .iter()
                        .map(|field| {
                            let repeated = if field.repeated { "repeated " } else { "" };
                            format!("{repeated}{} {} = {}", field.kind.as_str(), field.name, field.number)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    table.add_row(vec![
                        service.full_name.clone(),
                        format_id(service.id),
                        method.name.clone(),
                        format_id(method.id),
                        fields,
                    ]);
                }
            }
            println!("{table}");
        }
        OutputFormat::Raw => {
            for service in services {
                for method in &service.methods {
                    println!("{}/{}", service.full_name, method.name);
                }
            }
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn format_id(id: u32) -> String {
    format!("0x{id:08x}")
}

fn text_preview(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
