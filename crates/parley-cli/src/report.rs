//! End-of-run report printed on stderr.

use parley_core::{InstanceReport, RunSummary};
use serde::Serialize;
use std::io::{self, Write};
use std::time::Duration;

const COLUMNS: [&str; 6] = [
    "instance",
    "total time",
    "CPU time",
    "blocked time",
    "messages sent",
    "bytes sent",
];

/// `Duration: <t> (longest running instance: <i>)`
pub fn write_duration<W: Write>(out: &mut W, summary: &RunSummary) -> io::Result<()> {
    match summary.longest_running() {
        Some(longest) => writeln!(
            out,
            "Duration: {:?} (longest running instance: {})",
            longest.virtual_time(),
            longest.id
        ),
        None => writeln!(out, "Duration: {:?}", Duration::ZERO),
    }
}

fn row(report: &InstanceReport) -> [String; 6] {
    [
        report.id.to_string(),
        format!("{:?}", report.virtual_time()),
        report
            .cpu_time
            .map_or_else(|| "-".to_string(), |cpu| format!("{:?}", cpu)),
        format!("{:?}", report.stats.time_blocked),
        report.stats.messages_sent.to_string(),
        report.stats.bytes_sent.to_string(),
    ]
}

/// Per-instance statistics as an aligned table.
pub fn write_table<W: Write>(out: &mut W, instances: &[InstanceReport]) -> io::Result<()> {
    let rows: Vec<[String; 6]> = instances.iter().map(row).collect();
    let mut widths = COLUMNS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let header = COLUMNS.map(str::to_string);
    for cells in std::iter::once(&header).chain(&rows) {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        writeln!(out, "{}", line.join("  ").trim_end())?;
    }
    Ok(())
}

#[derive(Serialize)]
struct JsonReport<'a> {
    duration_ms: u128,
    longest_running: Option<usize>,
    requests_processed: u64,
    undelivered: usize,
    instances: &'a [InstanceReport],
}

/// The run statistics as one JSON document.
pub fn write_json<W: Write>(out: &mut W, summary: &RunSummary) -> io::Result<()> {
    let report = JsonReport {
        duration_ms: summary.duration().as_millis(),
        longest_running: summary.longest_running().map(|r| r.id),
        requests_processed: summary.requests_processed,
        undelivered: summary.undelivered.len(),
        instances: &summary.instances,
    };
    serde_json::to_writer_pretty(&mut *out, &report)?;
    writeln!(out)
}
