use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use steplink_frame::{hex_view, Packet};

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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
struct PacketOutput {
    method: &'static str,
    property: &'static str,
    sequence: u16,
    payload_size: usize,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    timestamp: String,
}

impl PacketOutput {
    fn new(packet: &Packet) -> Self {
        Self {
            method: packet.method().name(),
            property: packet.property().name(),
            sequence: packet.sequence(),
            payload_size: packet.payload().len(),
            payload: hex_view(packet.payload()),
            text: packet
                .method()
                .is_textual()
                .then(|| packet.text().into_owned()),
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_packet(packet: &Packet, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&PacketOutput::new(packet)),
        OutputFormat::Table => {
            let out = PacketOutput::new(packet);
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "PROPERTY", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    out.method.to_string(),
                    out.property.to_string(),
                    out.payload_size.to_string(),
                    out.text.unwrap_or(out.payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{packet}"),
    }
}

/// Print a flat record: JSON object, two-column table, or `key: value` lines.
pub fn print_record<T: Serialize>(record: &T, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(record);
        return;
    }
    let fields = match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(fields)) => fields,
        _ => return print_json(record),
    };
    let rows = fields.iter().map(|(key, value)| {
        let value = match value {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        (key.clone(), value)
    });
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (key, value) in rows {
                table.add_row(vec![key, value]);
            }
            println!("{table}");
        }
        _ => {
            for (key, value) in rows {
                println!("{key}: {value}");
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| format!("{:.3}", d.as_secs_f64()))
        .unwrap_or_else(|_| "0".to_string())
}
