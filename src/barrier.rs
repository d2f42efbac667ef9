// File: barrier.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    Ready,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout;

#[derive(Debug, Clone, Copy, Default)]
struct LatchState {
    arrived: usize,
    aborted: usize,
}

// Counting barrier: workers arrive (possibly in the aborted state), one
// waiter observes it filling. Arrivals are monotonic within a queue
// position; a fresh Latch is built for the next one.
#[derive(Debug)]
pub struct Latch {
    capacity: usize,
    tx: watch::Sender<LatchState>,
}

impl Latch {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = watch::channel(LatchState::default());
        Self { capacity, tx }
    }

    pub fn arrive(&self, arrival: Arrival) {
        self.tx.send_modify(|state| {
            state.arrived += 1;
            if arrival == Arrival::Aborted {
                state.aborted += 1;
            }
        });
    }

    pub fn arrived(&self) -> usize {
        self.tx.borrow().arrived
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Waits until `capacity` arrivals happened, returning how many of them
    // were aborted arrivals.
    pub async fn wait_full(&self, limit: Duration) -> Result<usize, WaitTimeout> {
        let mut rx = self.tx.subscribe();
        let capacity = self.capacity;
        let result = match tokio::time::timeout(limit, rx.wait_for(|s| s.arrived >= capacity)).await {
            Ok(Ok(state)) => Ok(state.aborted),
            Ok(Err(_)) | Err(_) => Err(WaitTimeout),
        };
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Closed,
    Open,
    Aborted,
}

// One-shot broadcast gate. Only the driver transitions it, with a single
// store that every waiter observes; transitions out of Closed are final.
#[derive(Debug)]
pub struct Gate {
    tx: watch::Sender<GateState>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Closed);
        Self { tx }
    }

    pub fn open(&self) {
        self.tx.send_modify(|state| {
            if *state == GateState::Closed {
                *state = GateState::Open;
            }
        });
    }

    pub fn abort(&self) {
        self.tx.send_modify(|state| {
            if *state == GateState::Closed {
                *state = GateState::Aborted;
            }
        });
    }

    pub fn state(&self) -> GateState {
        *self.tx.borrow()
    }

    pub async fn wait_open(&self, limit: Duration) -> Result<GateState, WaitTimeout> {
        let mut rx = self.tx.subscribe();
        let result = match tokio::time::timeout(limit, rx.wait_for(|s| *s != GateState::Closed)).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) | Err(_) => Err(WaitTimeout),
        };
        result
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

// The three barriers scoped to one queue position.
#[derive(Debug)]
pub struct BarrierSet {
    pub position: usize,
    pub ready: Latch,
    pub release: Gate,
    pub received: Latch,
}

impl BarrierSet {
    pub fn new(position: usize, capacity: usize) -> Self {
        Self {
            position,
            ready: Latch::new(capacity),
            release: Gate::new(),
            received: Latch::new(capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_latch_fills() {
        let latch = Arc::new(Latch::new(3));
        for _ in 0..3 {
            let latch = latch.clone();
            tokio::spawn(async move {
                latch.arrive(Arrival::Ready);
            });
        }
        let aborted = latch.wait_full(Duration::from_secs(1)).await.unwrap();
        assert_eq!(aborted, 0);
        assert_eq!(latch.arrived(), 3);
    }

    #[tokio::test]
    async fn test_latch_counts_aborted_arrivals() {
        let latch = Latch::new(2);
        latch.arrive(Arrival::Ready);
        latch.arrive(Arrival::Aborted);
        let aborted = latch.wait_full(Duration::from_secs(1)).await.unwrap();
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn test_latch_times_out() {
        let latch = Latch::new(2);
        latch.arrive(Arrival::Ready);
        let result = latch.wait_full(Duration::from_millis(50)).await;
        assert_eq!(result, Err(WaitTimeout));
    }

    #[tokio::test]
    async fn test_gate_broadcasts_open() {
        let gate = Arc::new(Gate::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.wait_open(Duration::from_secs(1)).await
            }));
        }
        gate.open();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(GateState::Open));
        }
    }

    #[tokio::test]
    async fn test_gate_abort_wakes_waiters() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_open(Duration::from_secs(1)).await })
        };
        gate.abort();
        assert_eq!(waiter.await.unwrap(), Ok(GateState::Aborted));
        // Once aborted, a later open does not rewrite the state.
        gate.open();
        assert_eq!(gate.state(), GateState::Aborted);
    }

    #[tokio::test]
    async fn test_gate_wait_times_out() {
        let gate = Gate::new();
        assert_eq!(
            gate.wait_open(Duration::from_millis(50)).await,
            Err(WaitTimeout)
        );
    }

    #[tokio::test]
    async fn test_barrier_set_capacity() {
        let set = BarrierSet::new(4, 5);
        assert_eq!(set.position, 4);
        assert_eq!(set.ready.capacity(), 5);
        assert_eq!(set.received.capacity(), 5);
        assert_eq!(set.release.state(), GateState::Closed);
    }
}
