// File: driver.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::barrier::{Arrival, BarrierSet, WaitTimeout};
use crate::config::{ConnectMode, RaceConfig, RaceParams};
use crate::error::{FailureRecord, RaceError};
use crate::request::RaceRequest;
use crate::resolver;
use crate::worker::{PositionAck, PositionTicket, WorkItem, Worker, WorkerResult};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub enum Work {
    Single(RaceRequest),
    Queue(Vec<WorkItem>),
}

impl Work {
    fn into_items(self) -> Vec<WorkItem> {
        match self {
            Work::Single(req) => vec![WorkItem::Request(req)],
            Work::Queue(items) => items,
        }
    }
}

impl From<RaceRequest> for Work {
    fn from(req: RaceRequest) -> Self {
        Work::Single(req)
    }
}

impl From<Vec<WorkItem>> for Work {
    fn from(items: Vec<WorkItem>) -> Self {
        Work::Queue(items)
    }
}

#[derive(Debug)]
pub struct RaceResult {
    pub workers: Vec<WorkerResult>,
    pub error: Option<FailureRecord>,
}

impl RaceResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

// Creates the worker lanes, hands each a copy of the work queue, and walks
// them through it position by position: READY fills, RELEASE opens with a
// single store, RECEIVED fills, completion acks come back, queue lengths are
// rechecked. Workers whose queues are exhausted are pre-arrived; the run
// ends when every queue is drained.
pub struct Driver {
    config: Arc<RaceConfig>,
    shutdown: watch::Sender<bool>,
}

impl Driver {
    pub fn new(mut config: RaceConfig) -> Result<Self, RaceError> {
        config.validate()?;
        let (shutdown, _rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            shutdown,
        })
    }

    // Aborts an in-flight process() call: outstanding gates flip to the
    // abort state and workers drop their connections without flushing.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn process(
        &self,
        work: impl Into<Work>,
        thread_count: usize,
    ) -> Result<RaceResult, RaceError> {
        if thread_count == 0 {
            return Err(RaceError::configuration("thread_count must be at least 1"));
        }

        let items = work.into().into_items();
        self.shutdown.send_replace(false);

        let pinned = if self.config.connect_mode == ConnectMode::Same {
            Arc::new(self.pin_hosts(&items).await?)
        } else {
            Arc::new(HashMap::new())
        };

        info!(
            "spawning {} workers over {} work items",
            thread_count,
            items.len()
        );

        let (ack_tx, mut ack_rx) = mpsc::channel::<PositionAck>(thread_count.max(1));
        let mut ticket_txs = Vec::with_capacity(thread_count);
        let mut handles = Vec::with_capacity(thread_count);
        let mut remaining: Vec<usize> = vec![items.len(); thread_count];
        let mut dead: Vec<bool> = vec![false; thread_count];

        for worker_id in 0..thread_count {
            let params = RaceParams {
                worker_id,
                worker_count: thread_count,
                config: self.config.clone(),
                pinned_addrs: pinned.clone(),
            };
            let worker = Worker::new(worker_id, items.clone(), params, self.shutdown.subscribe());
            let (ticket_tx, ticket_rx) = mpsc::channel::<PositionTicket>(1);
            ticket_txs.push(ticket_tx);
            handles.push(tokio::spawn(worker.run(ticket_rx, ack_tx.clone())));
        }
        drop(ack_tx);

        let mut error: Option<FailureRecord> = None;
        let mut position = 0usize;

        loop {
            let active: Vec<usize> = (0..thread_count)
                .filter(|&i| !dead[i] && remaining[i] > 0)
                .collect();
            if active.is_empty() {
                break;
            }

            let barriers = Arc::new(BarrierSet::new(position, thread_count));

            for i in 0..thread_count {
                if !active.contains(&i) {
                    let arrival = if dead[i] {
                        Arrival::Aborted
                    } else {
                        Arrival::Ready
                    };
                    barriers.ready.arrive(arrival);
                    barriers.received.arrive(arrival);
                }
            }

            let mut ticketed = 0usize;
            for &i in &active {
                let ticket = PositionTicket {
                    position,
                    barriers: barriers.clone(),
                };
                if ticket_txs[i].send(ticket).await.is_err() {
                    warn!("worker {} is gone, counting it as aborted", i);
                    dead[i] = true;
                    barriers.ready.arrive(Arrival::Aborted);
                    barriers.received.arrive(Arrival::Aborted);
                } else {
                    ticketed += 1;
                }
            }

            debug!(
                "position {}: waiting on READY with {} active workers",
                position,
                active.len()
            );
            match barriers.ready.wait_full(self.config.barrier_timeout).await {
                Ok(aborted) => {
                    if aborted > 0 {
                        debug!("position {}: {} aborted arrivals at READY", position, aborted);
                    }
                }
                Err(WaitTimeout) => {
                    error = Some(
                        RaceError::BarrierTimeout {
                            barrier: "READY",
                            position,
                        }
                        .into(),
                    );
                    self.abort_run(&barriers);
                    break;
                }
            }

            // Let kernel send buffers drain so the withheld tails are the
            // only bytes left in flight.
            if !self.config.release_delay.is_zero() {
                tokio::time::sleep(self.config.release_delay).await;
            }

            debug!("position {}: opening RELEASE", position);
            barriers.release.open();

            match barriers.received.wait_full(self.config.barrier_timeout).await {
                Ok(_) => {}
                Err(WaitTimeout) => {
                    error = Some(
                        RaceError::BarrierTimeout {
                            barrier: "RECEIVED",
                            position,
                        }
                        .into(),
                    );
                    self.abort_run(&barriers);
                    break;
                }
            }

            // Completion acks carry post-position queue lengths, so work
            // appended by callbacks is visible before the recheck.
            let mut pending = ticketed;
            let mut lost = false;
            while pending > 0 {
                match tokio::time::timeout(self.config.barrier_timeout, ack_rx.recv()).await {
                    Ok(Some(ack)) => {
                        remaining[ack.worker_id] = ack.remaining;
                        if ack.aborted {
                            dead[ack.worker_id] = true;
                        }
                        pending -= 1;
                    }
                    Ok(None) | Err(_) => {
                        lost = true;
                        break;
                    }
                }
            }
            if lost {
                error = Some(
                    RaceError::BarrierTimeout {
                        barrier: "RECEIVED",
                        position,
                    }
                    .into(),
                );
                self.abort_run(&barriers);
                break;
            }

            debug!("position {} complete", position);
            position += 1;
        }

        drop(ticket_txs);

        let mut results: Vec<WorkerResult> = Vec::with_capacity(thread_count);
        for (worker_id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(worker) => results.push(worker.into_result()),
                Err(err) => {
                    warn!("worker {} failed to join: {}", worker_id, err);
                    results.push(WorkerResult {
                        thread_num: worker_id,
                        outcomes: Vec::new(),
                        aborted: true,
                    });
                }
            }
        }
        results.sort_by_key(|r| r.thread_num);

        info!(
            "run finished after {} positions, {} workers, error: {}",
            position,
            results.len(),
            error.is_some()
        );

        Ok(RaceResult {
            workers: results,
            error,
        })
    }

    fn abort_run(&self, barriers: &BarrierSet) {
        warn!("aborting run at position {}", barriers.position);
        self.shutdown.send_replace(true);
        barriers.release.abort();
    }

    // One resolution per host, injected into every connection, so all
    // workers share the same remote address in connect_mode=same.
    async fn pin_hosts(
        &self,
        items: &[WorkItem],
    ) -> Result<HashMap<(String, u16), SocketAddr>, RaceError> {
        let mut pinned = HashMap::new();
        for item in items {
            if let WorkItem::Request(req) = item {
                let host = req.host().to_string();
                let port = req.port();
                if host.is_empty() || pinned.contains_key(&(host.clone(), port)) {
                    continue;
                }
                let addrs = resolver::resolve(&host, port).await?;
                pinned.insert((host, port), addrs[0]);
            }
        }
        Ok(pinned)
    }
}
