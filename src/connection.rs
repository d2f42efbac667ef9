// File: connection.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::barrier::{Arrival, BarrierSet, GateState, WaitTimeout};
use crate::config::{ConnectMode, RaceParams};
use crate::error::RaceError;
use crate::pool::PoolKey;
use crate::resolver;
use crate::response::{parse_head, RaceResponse, TimingMarks};
use log::{debug, trace};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsConnector};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const PROXY_REPLY_CAP: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Init,
    Connected,
    HeadersSent,
    BodyPending,
    Ready,
    Released,
    ResponseHeaders,
    ResponseBody,
    Done,
}

enum RaceStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl RaceStream {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            RaceStream::Plain(s) => s.write_all(data).await,
            RaceStream::Tls(s) => s.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            RaceStream::Plain(s) => s.flush().await,
            RaceStream::Tls(s) => s.flush().await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RaceStream::Plain(s) => s.read(buf).await,
            RaceStream::Tls(s) => s.read(buf).await,
        }
    }
}

// One TCP socket (optionally TLS-wrapped) carrying one withheld HTTP/1.1
// exchange. The owning worker drives the state machine in order: connect,
// send_withheld, await_release, flush_tail, read_response.
pub struct RaceConnection {
    pub id: u64,
    key: PoolKey,
    params: RaceParams,
    barriers: Arc<BarrierSet>,
    state: SendState,
    stream: Option<RaceStream>,
    pending_tail: Vec<u8>,
    arrived_ready: bool,
    arrived_received: bool,
    pub peer_addr: Option<SocketAddr>,
    pub timing: TimingMarks,
}

impl RaceConnection {
    pub fn new(key: PoolKey, params: RaceParams, barriers: Arc<BarrierSet>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            params,
            barriers,
            state: SendState::Init,
            stream: None,
            pending_tail: Vec::new(),
            arrived_ready: false,
            arrived_received: false,
            peer_addr: None,
            timing: TimingMarks::default(),
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub async fn connect(&mut self) -> Result<(), RaceError> {
        let config = self.params.config.clone();
        let proxy = config.send_options.proxy.clone();

        let (endpoint_host, endpoint_port) = match &proxy {
            Some(url) => (
                url.host_str().unwrap_or_default().to_string(),
                url.port_or_known_default().unwrap_or(8080),
            ),
            None => (self.key.host.clone(), self.key.port),
        };

        // With a proxy in between, the TCP peer is the proxy and the
        // connect-mode address policy applies to nothing.
        let addr = if proxy.is_some() {
            resolver::resolve(&endpoint_host, endpoint_port).await?[0]
        } else {
            let pinned = self
                .params
                .pinned_addrs
                .get(&(endpoint_host.clone(), endpoint_port))
                .copied();
            match (config.connect_mode, pinned) {
                (ConnectMode::Same, Some(addr)) => addr,
                _ => {
                    let addrs = resolver::resolve(&endpoint_host, endpoint_port).await?;
                    resolver::select_addr(
                        &addrs,
                        config.connect_mode,
                        self.params.worker_id,
                        self.params.worker_count,
                        &endpoint_host,
                    )?
                }
            }
        };

        let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RaceError::transport(
                    format!("connecting to {}", addr),
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                )
            })?
            .map_err(|e| RaceError::transport(format!("connecting to {}", addr), e))?;

        tcp.set_nodelay(true)
            .map_err(|e| RaceError::transport("setting TCP_NODELAY", e))?;
        self.peer_addr = tcp.peer_addr().ok();

        debug!(
            "C{:03} connection {} to {} ({})",
            self.params.worker_id, self.id, addr, self.key.host
        );

        let stream = if self.key.tls {
            let mut tcp = tcp;
            if proxy.is_some() {
                let deadline = Instant::now() + config.read_timeout;
                proxy_tunnel(&mut tcp, &self.key.host, self.key.port, deadline).await?;
            }

            let connector = tls_connector(config.send_options.verify);
            let domain = rustls::ServerName::try_from(self.key.host.as_str()).map_err(|_| {
                RaceError::configuration(format!("invalid TLS server name: {}", self.key.host))
            })?;
            let tls = tokio::time::timeout(config.connect_timeout, connector.connect(domain, tcp))
                .await
                .map_err(|_| {
                    RaceError::transport(
                        "TLS handshake",
                        io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"),
                    )
                })?
                .map_err(|e| RaceError::transport("TLS handshake", e))?;
            RaceStream::Tls(Box::new(tls))
        } else {
            RaceStream::Plain(tcp)
        };

        self.stream = Some(stream);
        self.timing.connect = Some(Instant::now());
        self.state = SendState::Connected;
        Ok(())
    }

    // Writes everything up to `split`, keeping the rest buffered until the
    // release gate opens. `head_len` is where the header block ends.
    pub async fn send_withheld(
        &mut self,
        payload: &[u8],
        head_len: usize,
        split: usize,
    ) -> Result<(), RaceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RaceError::protocol("send on unconnected connection"))?;

        let head_cut = head_len.min(split);
        stream
            .write_all(&payload[..head_cut])
            .await
            .map_err(|e| RaceError::transport("writing request headers", e))?;
        self.state = SendState::HeadersSent;

        if split > head_cut {
            stream
                .write_all(&payload[head_cut..split])
                .await
                .map_err(|e| RaceError::transport("writing request body", e))?;
        }
        stream
            .flush()
            .await
            .map_err(|e| RaceError::transport("flushing pre-send bytes", e))?;

        self.pending_tail = payload[split..].to_vec();
        self.state = SendState::BodyPending;

        trace!(
            "C{:03} connection {} pre-sent {} of {} bytes, withholding {}",
            self.params.worker_id,
            self.id,
            split,
            payload.len(),
            payload.len() - split
        );
        Ok(())
    }

    // Signals READY and blocks until the driver opens the release gate.
    pub async fn await_release(&mut self) -> Result<(), RaceError> {
        self.timing.ready = Some(Instant::now());
        self.state = SendState::Ready;
        self.arrived_ready = true;
        self.barriers.ready.arrive(Arrival::Ready);

        let timeout = self.params.config.barrier_timeout;
        match self.barriers.release.wait_open(timeout).await {
            Ok(GateState::Open) => {
                self.timing.release = Some(Instant::now());
                self.state = SendState::Released;
                Ok(())
            }
            Ok(_) => Err(RaceError::Aborted {
                reason: "release gate aborted".to_string(),
            }),
            Err(WaitTimeout) => Err(RaceError::BarrierTimeout {
                barrier: "RELEASE",
                position: self.barriers.position,
            }),
        }
    }

    pub async fn flush_tail(&mut self) -> Result<(), RaceError> {
        let tail = std::mem::take(&mut self.pending_tail);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RaceError::protocol("flush on unconnected connection"))?;

        stream
            .write_all(&tail)
            .await
            .map_err(|e| RaceError::transport("flushing withheld tail", e))?;
        stream
            .flush()
            .await
            .map_err(|e| RaceError::transport("flushing withheld tail", e))?;
        Ok(())
    }

    // Reads status line + headers, signals RECEIVED, then drains the body.
    pub async fn read_response(&mut self) -> Result<RaceResponse, RaceError> {
        let config = self.params.config.clone();
        let read_timeout = config
            .send_options
            .request_timeout
            .unwrap_or(config.read_timeout);
        let deadline = Instant::now() + read_timeout;
        let cap = config.max_response_bytes;

        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let head_end = loop {
            if let Some(pos) = find_head_end(&buf) {
                break pos;
            }
            if buf.len() > cap {
                return Err(RaceError::protocol("response headers exceed size cap"));
            }
            let n = self.read_some(&mut buf, deadline).await?;
            if n == 0 {
                return Err(RaceError::protocol(
                    "connection closed before response headers",
                ));
            }
            if self.timing.first_byte.is_none() {
                self.timing.first_byte = Some(Instant::now());
            }
        };

        let head = parse_head(&buf[..head_end])?;
        self.state = SendState::ResponseHeaders;

        self.arrived_received = true;
        self.barriers.received.arrive(Arrival::Ready);
        self.state = SendState::ResponseBody;

        let mut body: Vec<u8> = buf[head_end + 4..].to_vec();

        if let Some(length) = head.content_length()? {
            if length > cap {
                return Err(RaceError::protocol("response body exceeds size cap"));
            }
            while body.len() < length {
                let n = self.read_some(&mut body, deadline).await?;
                if n == 0 {
                    return Err(RaceError::protocol(format!(
                        "truncated response body: {} of {} bytes",
                        body.len(),
                        length
                    )));
                }
            }
            body.truncate(length);
        } else if head.is_chunked() {
            body = self.read_chunked(body, deadline, cap).await?;
        } else {
            loop {
                if body.len() > cap {
                    return Err(RaceError::protocol("response body exceeds size cap"));
                }
                let n = self.read_some(&mut body, deadline).await?;
                if n == 0 {
                    break;
                }
            }
        }

        self.state = SendState::Done;

        Ok(RaceResponse {
            http_version: head.http_version,
            status: head.status,
            status_text: head.status_text,
            headers: head.headers,
            body,
            peer_addr: self.peer_addr,
            connection_id: self.id,
            timing: self.timing.clone(),
        })
    }

    // Signals any barrier this connection has not reached so peers are not
    // stranded when the exchange dies early.
    pub fn abort_remaining(&mut self) {
        if !self.arrived_ready {
            self.arrived_ready = true;
            self.barriers.ready.arrive(Arrival::Aborted);
        }
        if !self.arrived_received {
            self.arrived_received = true;
            self.barriers.received.arrive(Arrival::Aborted);
        }
    }

    async fn read_some(&mut self, buf: &mut Vec<u8>, deadline: Instant) -> Result<usize, RaceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RaceError::protocol("read on unconnected connection"))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RaceError::transport(
                "reading response",
                io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
            ));
        }

        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(remaining, stream.read(&mut chunk))
            .await
            .map_err(|_| {
                RaceError::transport(
                    "reading response",
                    io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
                )
            })?
            .map_err(|e| RaceError::transport("reading response", e))?;

        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn read_chunked(
        &mut self,
        mut buf: Vec<u8>,
        deadline: Instant,
        cap: usize,
    ) -> Result<Vec<u8>, RaceError> {
        let mut out = Vec::new();
        let mut pos = 0;

        loop {
            let line_end = loop {
                match find_crlf(&buf[pos..]) {
                    Some(i) => break pos + i,
                    None => {
                        let n = self.read_some(&mut buf, deadline).await?;
                        if n == 0 {
                            return Err(RaceError::protocol("truncated chunked body"));
                        }
                    }
                }
            };

            let size_text = std::str::from_utf8(&buf[pos..line_end])
                .map_err(|_| RaceError::protocol("invalid chunk size line"))?;
            let size_part = size_text.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_part, 16)
                .map_err(|_| RaceError::protocol(format!("invalid chunk size: {}", size_part)))?;
            pos = line_end + 2;

            if size == 0 {
                break;
            }

            if out.len() + size > cap {
                return Err(RaceError::protocol("response body exceeds size cap"));
            }

            while buf.len() < pos + size + 2 {
                let n = self.read_some(&mut buf, deadline).await?;
                if n == 0 {
                    return Err(RaceError::protocol("truncated chunked body"));
                }
            }

            out.extend_from_slice(&buf[pos..pos + size]);
            if &buf[pos + size..pos + size + 2] != b"\r\n" {
                return Err(RaceError::protocol("missing chunk terminator"));
            }
            pos += size + 2;
        }

        Ok(out)
    }
}

fn tls_connector(verify: bool) -> TlsConnector {
    let builder = rustls::ClientConfig::builder().with_safe_defaults();

    let config = if verify {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        let mut config = builder
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureVerifier));
        config
    };

    TlsConnector::from(Arc::new(config))
}

struct InsecureVerifier;

impl rustls::client::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

async fn proxy_tunnel<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    deadline: Instant,
) -> Result<(), RaceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {0}:{1} HTTP/1.1\r\nHost: {0}:{1}\r\n\r\n",
        host, port
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| RaceError::transport("sending CONNECT", e))?;

    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > PROXY_REPLY_CAP {
            return Err(RaceError::protocol("oversized CONNECT reply"));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RaceError::transport(
                "reading CONNECT reply",
                io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
            ));
        }

        let mut chunk = [0u8; 512];
        let n = tokio::time::timeout(remaining, stream.read(&mut chunk))
            .await
            .map_err(|_| {
                RaceError::transport(
                    "reading CONNECT reply",
                    io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
                )
            })?
            .map_err(|e| RaceError::transport("reading CONNECT reply", e))?;
        if n == 0 {
            return Err(RaceError::protocol("proxy closed during CONNECT"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = parse_head(&buf[..head_end])?;
    if head.status != 200 {
        return Err(RaceError::protocol(format!(
            "proxy refused CONNECT: {} {}",
            head.status, head.status_text
        )));
    }
    Ok(())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
