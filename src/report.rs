// File: report.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::driver::RaceResult;
use crate::error::RaceErrorKind;
use crate::worker::Outcome;
use chrono::Local;
use serde::Serialize;
use std::fs::File;
use std::io::{Result, Write};
use std::path::Path;

#[derive(Debug, Serialize, Clone)]
pub struct RaceReportEntry {
    pub thread_num: usize,
    pub position: usize,
    pub status: Option<u16>,
    pub error_kind: Option<RaceErrorKind>,
    pub error: Option<String>,
    pub peer_addr: Option<String>,
    pub connection_id: Option<u64>,
    pub release_to_first_byte_ms: Option<u64>,
    pub connect_to_first_byte_ms: Option<u64>,
}

pub fn collect_entries(result: &RaceResult) -> Vec<RaceReportEntry> {
    let mut entries = Vec::new();

    for worker in &result.workers {
        for outcome in &worker.outcomes {
            let entry = match &outcome.outcome {
                Outcome::Response(resp) => RaceReportEntry {
                    thread_num: worker.thread_num,
                    position: outcome.position,
                    status: Some(resp.status),
                    error_kind: None,
                    error: None,
                    peer_addr: resp.peer_addr.map(|a| a.to_string()),
                    connection_id: Some(resp.connection_id),
                    release_to_first_byte_ms: resp
                        .timing
                        .release_to_first_byte()
                        .map(|d| d.as_millis() as u64),
                    connect_to_first_byte_ms: resp
                        .timing
                        .connect_to_first_byte()
                        .map(|d| d.as_millis() as u64),
                },
                Outcome::Failed(record) => RaceReportEntry {
                    thread_num: worker.thread_num,
                    position: outcome.position,
                    status: None,
                    error_kind: Some(record.kind),
                    error: Some(record.message.clone()),
                    peer_addr: None,
                    connection_id: None,
                    release_to_first_byte_ms: None,
                    connect_to_first_byte_ms: None,
                },
            };
            entries.push(entry);
        }
    }

    entries
}

pub fn generate_race_report(result: &RaceResult) -> String {
    let mut report = String::new();

    report.push_str("rrace Run Report\n");
    report.push_str(&format!(
        "Date: {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    report.push_str(&format!("Workers: {}\n", result.workers.len()));

    match &result.error {
        Some(record) => {
            report.push_str(&format!(
                "Run error: {:?} - {}\n",
                record.kind, record.message
            ));
        }
        None => report.push_str("Run error: none\n"),
    }
    report.push_str("----------------------------------------\n");

    for entry in collect_entries(result) {
        report.push_str(&format!(
            "Worker {} position {}: ",
            entry.thread_num, entry.position
        ));
        match entry.status {
            Some(status) => {
                report.push_str(&format!("HTTP {}", status));
                if let Some(ms) = entry.release_to_first_byte_ms {
                    report.push_str(&format!(" ({} ms after release)", ms));
                }
                if let Some(peer) = &entry.peer_addr {
                    report.push_str(&format!(" via {}", peer));
                }
            }
            None => {
                report.push_str(&format!(
                    "FAILED {:?}: {}",
                    entry.error_kind,
                    entry.error.as_deref().unwrap_or("unknown")
                ));
            }
        }
        report.push('\n');
    }

    report.push_str("----------------------------------------\n");
    report.push_str("End of Report\n");
    report
}

pub fn write_jsonl(result: &RaceResult, output_path: &str) -> Result<()> {
    if let Some(parent) = Path::new(output_path).parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = File::create(output_path)?;
    for entry in collect_entries(result) {
        let line = serde_json::to_string(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)?;
    }
    Ok(())
}
