// File: pool.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::barrier::BarrierSet;
use crate::config::RaceParams;
use crate::connection::RaceConnection;
use crate::error::RaceError;
use crate::request::RaceRequest;
use log::trace;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PoolKey {
    pub fn from_request(request: &RaceRequest) -> Result<Self, RaceError> {
        let host = request.url.host_str().ok_or_else(|| {
            RaceError::configuration(format!("URL has no host: {}", request.url))
        })?;
        Ok(Self {
            host: host.to_string(),
            port: request.port(),
            tls: request.is_tls(),
        })
    }
}

// Lends connections for one (scheme, host, port) target. Keep-alive is
// deliberately disabled: a reused socket would already have a complete
// request behind it and the withheld tail of the next one could be
// coalesced with stale buffered data, so every checkout builds a fresh
// connection carrying the current race parameters and barrier set.
pub struct ConnectionPool {
    key: PoolKey,
    params: RaceParams,
    handed_out: u64,
}

impl ConnectionPool {
    pub fn new(key: PoolKey, params: RaceParams) -> Self {
        Self {
            key,
            params,
            handed_out: 0,
        }
    }

    pub fn checkout(&mut self, barriers: Arc<BarrierSet>) -> RaceConnection {
        self.handed_out += 1;
        RaceConnection::new(self.key.clone(), self.params.clone(), barriers)
    }

    pub fn checkin(&mut self, connection: RaceConnection) {
        trace!(
            "pool {}:{} discarding connection {}",
            self.key.host,
            self.key.port,
            connection.id
        );
        drop(connection);
    }

    pub fn handed_out(&self) -> u64 {
        self.handed_out
    }
}

// Routes checkouts to a pool per target, creating pools on first use.
pub struct PoolManager {
    params: RaceParams,
    pools: HashMap<PoolKey, ConnectionPool>,
}

impl PoolManager {
    pub fn new(params: RaceParams) -> Self {
        Self {
            params,
            pools: HashMap::new(),
        }
    }

    pub fn pool_for(&mut self, key: &PoolKey) -> &mut ConnectionPool {
        if !self.pools.contains_key(key) {
            let pool = ConnectionPool::new(key.clone(), self.params.clone());
            self.pools.insert(key.clone(), pool);
        }
        self.pools.get_mut(key).unwrap()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}
