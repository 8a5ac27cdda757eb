use std::io::{IsTerminal, Write};
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

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
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ListeningOutput<'a> {
    event: &'static str,
    address: &'a str,
    max_record_size: usize,
}

/// Announce the bound address. Always one line, so scripts can read it.
pub fn print_listening(address: &str, max_record_size: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ListeningOutput {
            event: "listening",
            address,
            max_record_size,
        }),
        OutputFormat::Raw => println!("{address}"),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("listening on {address} (max record {max_record_size})")
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput {
    xid: u32,
    size: usize,
    payload: String,
    elapsed_us: u128,
}

pub fn print_reply(xid: u32, body: &[u8], elapsed: Duration, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ReplyOutput {
            xid,
            size: body.len(),
            payload: payload_preview(body),
            elapsed_us: elapsed.as_micros(),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["XID", "SIZE", "ELAPSED", "PAYLOAD"])
                .add_row(vec![
                    xid.to_string(),
                    body.len().to_string(),
                    format!("{elapsed:?}"),
                    payload_preview(body),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "xid={} size={} elapsed={:?} payload={}",
                xid,
                body.len(),
                elapsed,
                payload_preview(body)
            );
        }
        OutputFormat::Raw => print_raw(body),
    }
}

/// Outcome of a `loopback` run.
#[derive(Debug, Serialize)]
pub struct LoopbackReport {
    pub endpoint: String,
    pub calls: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub payload_size: usize,
    pub max_record_size: usize,
    pub elapsed_ms: u128,
    pub max_latency_us: u128,
    pub descriptors_in_use: usize,
}

pub fn print_loopback(report: &LoopbackReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table | OutputFormat::Pretty => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METRIC", "VALUE"]);
            let rows = [
                ("endpoint", report.endpoint.clone()),
                ("calls", report.calls.to_string()),
                ("succeeded", report.succeeded.to_string()),
                ("failed", report.failed.to_string()),
                ("payload size", report.payload_size.to_string()),
                ("max record", report.max_record_size.to_string()),
                ("elapsed ms", report.elapsed_ms.to_string()),
                ("max latency us", report.max_latency_us.to_string()),
                ("descriptors in use", report.descriptors_in_use.to_string()),
            ];
            for (metric, value) in rows {
                table.add_row(vec![metric.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Raw => println!("{}/{}", report.succeeded, report.calls),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payloads_are_summarized() {
        assert_eq!(payload_preview(b"hi"), "hi");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }

    #[test]
    fn listening_json_carries_address() {
        let json = serde_json::to_string(&ListeningOutput {
            event: "listening",
            address: "127.0.0.1:4000",
            max_record_size: 0,
        })
        .expect("listening output should serialize");
        assert!(json.contains("\"address\":\"127.0.0.1:4000\""));
    }
}
