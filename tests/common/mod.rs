// File: mod.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// Loopback fixture recording, per connection, the raw request bytes and the
// instant the frame became complete. Routes:
//   /            -> 200 "hello"
//   /echo        -> 200 echoing the request body
//   /set-cookie  -> 200 with Set-Cookie built from the query string
//   /echo-cookie -> 200 echoing the request's Cookie header
//   /hang        -> reads the request, never answers
#[derive(Debug, Clone)]
pub struct ConnLog {
    pub request: Vec<u8>,
    pub completed_at: Instant,
}

impl ConnLog {
    pub fn request_text(&self) -> String {
        String::from_utf8_lossy(&self.request).to_string()
    }
}

pub struct FixtureServer {
    pub addr: SocketAddr,
    logs: Arc<Mutex<Vec<ConnLog>>>,
}

impl FixtureServer {
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    // First accepted connection stalls forever after reading its request.
    pub async fn start_hanging_first() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(hang_first: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let logs: Arc<Mutex<Vec<ConnLog>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_logs = logs.clone();
        tokio::spawn(async move {
            let mut index = 0usize;
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let hang = hang_first && index == 0;
                index += 1;
                tokio::spawn(handle_conn(stream, accept_logs.clone(), hang));
            }
        });

        Self { addr, logs }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn logs(&self) -> Vec<ConnLog> {
        self.logs.lock().unwrap().clone()
    }

    // Spread between the first and last completed request frame.
    pub fn completion_spread(&self) -> Duration {
        let logs = self.logs.lock().unwrap();
        let first = logs.iter().map(|l| l.completed_at).min();
        let last = logs.iter().map(|l| l.completed_at).max();
        match (first, last) {
            (Some(first), Some(last)) => last.duration_since(first),
            _ => Duration::ZERO,
        }
    }
}

async fn handle_conn(mut stream: TcpStream, logs: Arc<Mutex<Vec<ConnLog>>>, hang: bool) {
    let mut buf: Vec<u8> = Vec::new();
    let mut head_end: Option<usize> = None;

    loop {
        if head_end.is_none() {
            head_end = buf.windows(4).position(|w| w == b"\r\n\r\n");
        }
        if let Some(end) = head_end {
            let length = content_length(&buf[..end]);
            if buf.len() >= end + 4 + length {
                break;
            }
        }

        let mut chunk = [0u8; 4096];
        let n = match stream.read(&mut chunk).await {
            Ok(n) => n,
            Err(_) => return,
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    logs.lock().unwrap().push(ConnLog {
        request: buf.clone(),
        completed_at: Instant::now(),
    });

    if hang {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        return;
    }

    let head_end = head_end.unwrap();
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let body = buf[head_end + 4..].to_vec();
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .unwrap_or("/")
        .to_string();
    let path = target.split('?').next().unwrap_or("/");

    let (extra_header, response_body) = match path {
        "/echo" => (None, body),
        "/set-cookie" => {
            let pair = target.split_once('?').map(|(_, q)| q).unwrap_or("k=1");
            (
                Some(format!("Set-Cookie: {}; Path=/\r\n", pair)),
                b"cookie set".to_vec(),
            )
        }
        "/echo-cookie" => {
            let cookie = head
                .lines()
                .find(|line| line.to_ascii_lowercase().starts_with("cookie:"))
                .map(|line| line[7..].trim().to_string())
                .unwrap_or_default();
            (None, cookie.into_bytes())
        }
        _ => (None, b"hello".to_vec()),
    };

    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n",
        response_body.len()
    );
    if let Some(header) = extra_header {
        response.push_str(&header);
    }
    response.push_str("Connection: close\r\n\r\n");

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.write_all(&response_body).await;
    let _ = stream.flush().await;
}

fn content_length(head: &[u8]) -> usize {
    let text = String::from_utf8_lossy(head);
    text.lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| line[15..].trim().parse().ok())
        .unwrap_or(0)
}
