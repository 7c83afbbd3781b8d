// src/formatting.rs

use crate::core::{DomainRecord, StoreStats};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Converts a byte count into a human-friendly string.
pub fn human_readable_size(num_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = num_bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{:.2} {}", size, UNITS[UNITS.len() - 1])
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_stats(stats: &StoreStats) -> String {
    let mut lines = vec![
        "Database Statistics:".to_string(),
        format!("  Unique domains: {}", stats.count),
        format!(
            "  Latest update: {}",
            stats
                .latest_update
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_else(|| "N/A".to_string())
        ),
        format!(
            "  Longest domain: {}",
            stats.longest_domain.as_deref().unwrap_or("<none>")
        ),
    ];
    if let Some(size) = stats.size_bytes {
        lines.push(format!(
            "  Size: {} bytes ({})",
            size,
            human_readable_size(size)
        ));
    }
    lines.join("\n")
}

/// Renders records as a grid of domain, created and updated columns.
pub fn format_records_table(records: &[DomainRecord]) -> String {
    if records.is_empty() {
        return "No certificates found in database".to_string();
    }

    let headers = ["Domain", "Created", "Updated"];
    let rows: Vec<[String; 3]> = records
        .iter()
        .map(|r| {
            [
                r.domain.clone(),
                format_timestamp(&r.created_at),
                format_timestamp(&r.updated_at),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let separator = format!(
        "+{}+",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let render_row = |cells: [&str; 3]| -> String {
        let body = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!(" {cell:<width$} "))
            .collect::<Vec<_>>()
            .join("|");
        format!("|{body}|")
    };

    let mut out = vec![separator.clone(), render_row(headers), separator.replace('-', "=")];
    for row in &rows {
        out.push(render_row([row[0].as_str(), row[1].as_str(), row[2].as_str()]));
        out.push(separator.clone());
    }
    out.join("\n")
}

/// Renders one record with its pretty-printed payload.
pub fn format_record_detail(record: &DomainRecord) -> Result<String, StoreError> {
    let payload = serde_json::to_string_pretty(&record.payload()?)?;
    Ok(format!(
        "Domain: {}\nCreated: {}\nUpdated: {}\nData: {}",
        record.domain,
        format_timestamp(&record.created_at),
        format_timestamp(&record.updated_at),
        payload
    ))
}

/// A record with its payload expanded, for JSON output.
#[derive(Serialize)]
struct JsonRecord<'a> {
    domain: &'a str,
    data: serde_json::Value,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

impl<'a> JsonRecord<'a> {
    fn from_record(record: &'a DomainRecord) -> Result<Self, StoreError> {
        Ok(Self {
            domain: &record.domain,
            data: record.payload()?,
            created_at: &record.created_at,
            updated_at: &record.updated_at,
        })
    }
}

pub fn records_to_json(records: &[DomainRecord]) -> Result<String, StoreError> {
    let records = records
        .iter()
        .map(JsonRecord::from_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(serde_json::to_string_pretty(&records)?)
}

pub fn record_to_json(record: &DomainRecord) -> Result<String, StoreError> {
    Ok(serde_json::to_string_pretty(&JsonRecord::from_record(record)?)?)
}

pub fn stats_to_json(stats: &StoreStats) -> Result<String, StoreError> {
    Ok(serde_json::to_string_pretty(stats)?)
}
