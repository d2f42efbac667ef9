// File: worker.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::barrier::{Arrival, BarrierSet, GateState, WaitTimeout};
use crate::config::RaceParams;
use crate::connection::RaceConnection;
use crate::cookie::CookieJar;
use crate::error::{FailureRecord, RaceError};
use crate::eval::EvalContext;
use crate::pool::{PoolKey, PoolManager};
use crate::request::{split_point, RaceRequest};
use crate::response::RaceResponse;
use http::header::{HeaderMap, HeaderValue};
use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use url::Url;

pub type Callback = Arc<
    dyn Fn(&mut Worker) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
>;

#[derive(Clone)]
pub enum WorkItem {
    Request(RaceRequest),
    Callback(Callback),
}

impl WorkItem {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&mut Worker) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        WorkItem::Callback(Arc::new(f))
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Request(req) => write!(f, "Request({} {})", req.method, req.url),
            WorkItem::Callback(_) => write!(f, "Callback"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Response(RaceResponse),
    Failed(FailureRecord),
}

#[derive(Debug, Clone)]
pub struct PositionOutcome {
    pub position: usize,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub struct WorkerResult {
    pub thread_num: usize,
    pub outcomes: Vec<PositionOutcome>,
    pub aborted: bool,
}

impl WorkerResult {
    pub fn responses(&self) -> impl Iterator<Item = &RaceResponse> {
        self.outcomes.iter().filter_map(|p| match &p.outcome {
            Outcome::Response(resp) => Some(resp),
            Outcome::Failed(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.outcomes.iter().filter_map(|p| match &p.outcome {
            Outcome::Failed(record) => Some(record),
            Outcome::Response(_) => None,
        })
    }
}

pub(crate) struct PositionTicket {
    pub position: usize,
    pub barriers: Arc<BarrierSet>,
}

pub(crate) struct PositionAck {
    pub worker_id: usize,
    pub remaining: usize,
    pub aborted: bool,
}

struct PreparedSend {
    key: PoolKey,
    payload: Vec<u8>,
    head_len: usize,
    split: usize,
    cookie_header: Option<String>,
}

// One request lane. A worker owns its session cookie jar and work queue and
// processes one queue position per driver ticket, cooperating with its peers
// through the ticket's barrier set.
pub struct Worker {
    pub thread_num: usize,
    pub work_queue: VecDeque<WorkItem>,
    pub jar: CookieJar,
    pub outcomes: Vec<PositionOutcome>,
    params: RaceParams,
    eval: EvalContext,
    pools: PoolManager,
    shutdown: watch::Receiver<bool>,
    aborted: bool,
}

impl Worker {
    pub(crate) fn new(
        thread_num: usize,
        work_queue: Vec<WorkItem>,
        params: RaceParams,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            thread_num,
            work_queue: work_queue.into(),
            jar: CookieJar::new(),
            outcomes: Vec::new(),
            eval: EvalContext::new(thread_num),
            pools: PoolManager::new(params.clone()),
            params,
            shutdown,
            aborted: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.work_queue.len()
    }

    pub(crate) fn into_result(self) -> WorkerResult {
        WorkerResult {
            thread_num: self.thread_num,
            outcomes: self.outcomes,
            aborted: self.aborted,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut tickets: mpsc::Receiver<PositionTicket>,
        acks: mpsc::Sender<PositionAck>,
    ) -> Self {
        let mut shutdown = self.shutdown.clone();
        loop {
            let ticket = tokio::select! {
                ticket = tickets.recv() => match ticket {
                    Some(ticket) => ticket,
                    None => break,
                },
                _ = shutdown.wait_for(|stop| *stop) => {
                    self.aborted = true;
                    break;
                }
            };

            debug!(
                "T{:03} starting position {} ({} items left)",
                self.thread_num,
                ticket.position,
                self.work_queue.len()
            );

            let outcome = match self.work_queue.pop_front() {
                Some(WorkItem::Request(req)) => Some(self.run_request(req, &ticket).await),
                Some(WorkItem::Callback(cb)) => self.run_callback(cb, &ticket).await,
                None => {
                    ticket.barriers.ready.arrive(Arrival::Ready);
                    ticket.barriers.received.arrive(Arrival::Ready);
                    None
                }
            };

            if let Some(outcome) = outcome {
                self.outcomes.push(PositionOutcome {
                    position: ticket.position,
                    outcome,
                });
            }

            let ack = PositionAck {
                worker_id: self.thread_num,
                remaining: self.work_queue.len(),
                aborted: self.aborted,
            };
            if acks.send(ack).await.is_err() {
                break;
            }

            if self.aborted {
                break;
            }
        }

        debug!("T{:03} done, {} outcomes", self.thread_num, self.outcomes.len());
        self
    }

    async fn run_request(&mut self, req: RaceRequest, ticket: &PositionTicket) -> Outcome {
        match self.execute_request(req, ticket).await {
            Ok(resp) => Outcome::Response(resp),
            Err(err) => {
                if matches!(err, RaceError::Aborted { .. }) {
                    self.aborted = true;
                }
                warn!(
                    "T{:03} position {} failed: {}",
                    self.thread_num, ticket.position, err
                );
                Outcome::Failed(FailureRecord::from(&err))
            }
        }
    }

    async fn execute_request(
        &mut self,
        req: RaceRequest,
        ticket: &PositionTicket,
    ) -> Result<RaceResponse, RaceError> {
        let prepared = match self.prepare(req) {
            Ok(prepared) => prepared,
            Err(err) => {
                // Nothing has touched the barriers yet.
                ticket.barriers.ready.arrive(Arrival::Aborted);
                ticket.barriers.received.arrive(Arrival::Aborted);
                return Err(err);
            }
        };

        let mut conn = self
            .pools
            .pool_for(&prepared.key)
            .checkout(ticket.barriers.clone());

        let save_sent = self.params.config.save_sent_cookies;
        let mut shutdown = self.shutdown.clone();
        let jar = &mut self.jar;

        let result = tokio::select! {
            result = exchange(&mut conn, &prepared, save_sent, jar) => result,
            _ = shutdown.wait_for(|stop| *stop) => Err(RaceError::Aborted {
                reason: "driver shutdown".to_string(),
            }),
        };

        if result.is_err() {
            conn.abort_remaining();
        }
        let resp = result?;

        for value in resp.headers_named("set-cookie") {
            self.jar.store_set_cookie(&prepared.key.host, value);
        }

        self.pools.pool_for(&prepared.key).checkin(conn);
        Ok(resp)
    }

    async fn run_callback(&mut self, callback: Callback, ticket: &PositionTicket) -> Option<Outcome> {
        let barriers = &ticket.barriers;

        // Callbacks do not race on the wire but must keep pace with peers.
        barriers.ready.arrive(Arrival::Ready);

        let timeout = self.params.config.barrier_timeout;
        let mut shutdown = self.shutdown.clone();
        let gate = tokio::select! {
            gate = barriers.release.wait_open(timeout) => gate,
            _ = shutdown.wait_for(|stop| *stop) => Ok(GateState::Aborted),
        };

        match gate {
            Ok(GateState::Open) => {
                barriers.received.arrive(Arrival::Ready);
                match (*callback)(self) {
                    Ok(()) => {
                        debug!(
                            "T{:03} callback at position {} ran, queue now {}",
                            self.thread_num,
                            ticket.position,
                            self.work_queue.len()
                        );
                        None
                    }
                    Err(err) => Some(Outcome::Failed(
                        RaceError::Callback {
                            reason: err.to_string(),
                        }
                        .into(),
                    )),
                }
            }
            Ok(_) => {
                self.aborted = true;
                barriers.received.arrive(Arrival::Aborted);
                Some(Outcome::Failed(
                    RaceError::Aborted {
                        reason: "driver aborted the run".to_string(),
                    }
                    .into(),
                ))
            }
            Err(WaitTimeout) => {
                barriers.received.arrive(Arrival::Aborted);
                Some(Outcome::Failed(
                    RaceError::BarrierTimeout {
                        barrier: "RELEASE",
                        position: ticket.position,
                    }
                    .into(),
                ))
            }
        }
    }

    fn prepare(&mut self, req: RaceRequest) -> Result<PreparedSend, RaceError> {
        let mut req = if self.params.config.do_eval {
            self.expand_request(req)?
        } else {
            req
        };

        let key = PoolKey::from_request(&req)?;

        let cookie_header = if let Some(existing) = req.headers.get(http::header::COOKIE) {
            // An explicit Cookie header is sent verbatim.
            Some(
                existing
                    .to_str()
                    .map_err(|_| RaceError::configuration("non-ASCII Cookie header"))?
                    .to_string(),
            )
        } else {
            let merged = self.merge_cookies(&req, &key);
            if let Some(header) = &merged {
                let value = HeaderValue::from_str(header)
                    .map_err(|_| RaceError::configuration("invalid cookie value"))?;
                req.headers.insert(http::header::COOKIE, value);
            }
            merged
        };

        let absolute_form = self.params.config.send_options.proxy.is_some() && !key.tls;
        let payload = req.serialize(absolute_form)?;
        let body_len = req.body.len();
        let head_len = payload.len() - body_len;
        let split = split_point(payload.len(), body_len, self.params.config.tail_bytes);

        Ok(PreparedSend {
            key,
            payload,
            head_len,
            split,
            cookie_header,
        })
    }

    // Jar cookies for the target, overridden per name by the request's own
    // cookie pairs.
    fn merge_cookies(&self, req: &RaceRequest, key: &PoolKey) -> Option<String> {
        let mut pairs = self.jar.pairs_for(&key.host, req.url.path());

        for (name, value) in &req.cookies {
            match pairs.iter_mut().find(|(n, _)| n == name) {
                Some(entry) => entry.1 = value.clone(),
                None => pairs.push((name.clone(), value.clone())),
            }
        }

        if pairs.is_empty() {
            None
        } else {
            Some(
                pairs
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        }
    }

    fn expand_request(&mut self, req: RaceRequest) -> Result<RaceRequest, RaceError> {
        let mut req = req;

        // URL parsing percent-encodes the marker delimiters, so they are
        // restored before scanning.
        let raw_url = req
            .url
            .as_str()
            .replace("%3C", "<")
            .replace("%3c", "<")
            .replace("%3E", ">")
            .replace("%3e", ">");
        let url_text = self.eval.expand(&raw_url)?;
        if url_text != raw_url {
            req.url = Url::parse(&url_text).map_err(|e| RaceError::Callback {
                reason: format!("evaluated URL is invalid: {}", e),
            })?;
        }

        let mut headers = HeaderMap::new();
        for (name, value) in req.headers.iter() {
            let text = value.to_str().map_err(|_| RaceError::Callback {
                reason: format!("header {} is not evaluable text", name),
            })?;
            let expanded = self.eval.expand(text)?;
            let value = HeaderValue::from_str(&expanded).map_err(|_| RaceError::Callback {
                reason: format!("evaluated header {} is invalid", name),
            })?;
            headers.append(name.clone(), value);
        }
        req.headers = headers;

        let mut cookies = std::mem::take(&mut req.cookies);
        for (_, value) in cookies.iter_mut() {
            *value = self.eval.expand(value)?;
        }
        req.cookies = cookies;

        if !req.body.is_empty() {
            let expanded = match std::str::from_utf8(&req.body) {
                Ok(text) => Some(self.eval.expand(text)?),
                Err(_) => None,
            };
            if let Some(body) = expanded {
                req.body = body.into_bytes();
            }
        }

        Ok(req)
    }
}

async fn exchange(
    conn: &mut RaceConnection,
    prepared: &PreparedSend,
    save_sent: bool,
    jar: &mut CookieJar,
) -> Result<RaceResponse, RaceError> {
    conn.connect().await?;
    conn.send_withheld(&prepared.payload, prepared.head_len, prepared.split)
        .await?;

    if save_sent {
        if let Some(header) = &prepared.cookie_header {
            jar.store_cookie_header(&prepared.key.host, header);
        }
    }

    conn.await_release().await?;
    conn.flush_tail().await?;
    conn.read_response().await
}
