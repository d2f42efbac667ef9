// File: response.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::error::RaceError;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

// Invariant: connect <= ready <= release <= first_byte for marks that are set.
#[derive(Debug, Clone, Default)]
pub struct TimingMarks {
    pub connect: Option<Instant>,
    pub ready: Option<Instant>,
    pub release: Option<Instant>,
    pub first_byte: Option<Instant>,
}

impl TimingMarks {
    pub fn connect_to_first_byte(&self) -> Option<Duration> {
        Some(self.first_byte?.duration_since(self.connect?))
    }

    pub fn release_to_first_byte(&self) -> Option<Duration> {
        Some(self.first_byte?.duration_since(self.release?))
    }

    pub fn ready_to_release(&self) -> Option<Duration> {
        Some(self.release?.duration_since(self.ready?))
    }
}

#[derive(Debug, Clone)]
pub struct RaceResponse {
    pub http_version: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub peer_addr: Option<SocketAddr>,
    pub connection_id: u64,
    pub timing: TimingMarks,
}

impl RaceResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

pub struct ResponseHead {
    pub http_version: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Result<Option<usize>, RaceError> {
        match self.header("content-length") {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| RaceError::protocol(format!("invalid Content-Length: {}", raw))),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

// Parses the status line and header block, everything before the blank line.
pub fn parse_head(raw: &[u8]) -> Result<ResponseHead, RaceError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| RaceError::protocol("response head is not valid UTF-8"))?;

    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RaceError::protocol("no status line in response"))?;

    let mut parts = status_line.splitn(3, ' ');
    let http_version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| RaceError::protocol(format!("invalid status line: {}", status_line)))?
        .to_string();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RaceError::protocol(format!("invalid status line: {}", status_line)))?;
    let status_text = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line
            .find(':')
            .ok_or_else(|| RaceError::protocol(format!("malformed header line: {}", line)))?;
        let name = line[..colon].trim().to_string();
        let value = line[colon + 1..].trim().to_string();
        if name.is_empty() {
            return Err(RaceError::protocol(format!(
                "malformed header line: {}",
                line
            )));
        }
        headers.push((name, value));
    }

    Ok(ResponseHead {
        http_version,
        status,
        status_text,
        headers,
    })
}
