//! Telemetry output records.
//!
//! Two record kinds leave the engine: a one-time `HELLO` descriptor line so
//! consumers can build column headers, then one `DATA` line per poll tick.
//! Free-text diagnostics go through `tracing`, not through the sink.

use crate::catalog::{self, DataSource};
use serde::Serialize;

/// Consumer of telemetry record lines. Injected into the session at
/// construction; the engine knows nothing about where the lines end up.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, line: &str);
}

/// Sink writing each record to standard output.
pub struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn emit(&self, line: &str) {
        println!("{}", line);
    }
}

#[derive(Serialize)]
struct HelloField {
    key: String,
    label: &'static str,
    unit: &'static str,
}

#[derive(Serialize)]
struct Hello {
    device: &'static str,
    schema: u32,
    fields: Vec<HelloField>,
}

/// Build the `HELLO` descriptor record, field order matching catalog order.
pub fn build_hello(sources: &[DataSource]) -> String {
    let fields = sources
        .iter()
        .flat_map(|source| source.parameters.iter())
        .map(|p| HelloField {
            key: catalog::make_key(p.name),
            label: p.name,
            unit: p.unit,
        })
        .collect();

    let hello = Hello {
        device: "KWP2000",
        schema: 1,
        fields,
    };

    // Serialization of this static shape cannot fail.
    match serde_json::to_string(&hello) {
        Ok(json) => format!("HELLO {}", json),
        Err(_) => "HELLO {}".to_string(),
    }
}

/// Build one `DATA` record: timestamp plus every decoded value in field
/// order. Non-finite values render as the literal token `NaN`.
pub fn build_data(timestamp_ms: i64, values: &[f64]) -> String {
    let mut line = format!("DATA {}", timestamp_ms);
    for value in values {
        line.push(',');
        if value.is_finite() {
            line.push_str(&format_value(*value));
        } else {
            line.push_str("NaN");
        }
    }
    line
}

/// Shortest plain decimal form (values are pre-rounded by the decoder).
fn format_value(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DATA_SOURCES;

    #[test]
    fn hello_lists_fields_in_catalog_order() {
        let line = build_hello(DATA_SOURCES);
        assert!(line.starts_with("HELLO {"));

        let json: serde_json::Value = serde_json::from_str(&line["HELLO ".len()..]).unwrap();
        assert_eq!(json["device"], "KWP2000");
        assert_eq!(json["schema"], 1);

        let fields = json["fields"].as_array().unwrap();
        assert_eq!(fields.len(), catalog::field_count());
        assert_eq!(fields[0]["key"], "oxygen_sensor_bank1_sensor1");
        assert_eq!(fields[0]["unit"], "mV");
        assert_eq!(fields[6]["label"], "Battery voltage");
    }

    #[test]
    fn data_line_renders_nan_token() {
        let line = build_data(1_700_000_000_000, &[42.0, f64::NAN, 12.19]);
        assert_eq!(line, "DATA 1700000000000,42,NaN,12.19");
    }

    #[test]
    fn data_line_with_no_values_is_just_timestamp() {
        assert_eq!(build_data(5, &[]), "DATA 5");
    }
}
