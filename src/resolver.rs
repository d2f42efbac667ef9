// File: resolver.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::config::ConnectMode;
use crate::error::RaceError;
use log::debug;
use lru::LruCache;
use once_cell::sync::Lazy;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// The OS may reorder or vary lookup results between calls from different
// tasks. Caching one result per (host, port) keeps every connection of a run
// working from the same address list, which the same/different modes rely on.
static RESOLVE_CACHE: Lazy<Mutex<LruCache<(String, u16), CachedLookup>>> =
    Lazy::new(|| Mutex::new(LruCache::new(NonZeroUsize::new(128).unwrap())));

const CACHE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct CachedLookup {
    addrs: Vec<SocketAddr>,
    resolved_at: Instant,
}

pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, RaceError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let key = (host.to_string(), port);

    {
        let mut cache = RESOLVE_CACHE.lock().unwrap();
        if let Some(cached) = cache.get(&key) {
            if cached.resolved_at.elapsed() < CACHE_TTL {
                return Ok(cached.addrs.clone());
            }
        }
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| RaceError::Resolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(RaceError::Resolution {
            host: host.to_string(),
            reason: "lookup returned no addresses".to_string(),
        });
    }

    debug!("resolved {}:{} to {} addresses", host, port, addrs.len());

    let mut cache = RESOLVE_CACHE.lock().unwrap();
    cache.put(
        key,
        CachedLookup {
            addrs: addrs.clone(),
            resolved_at: Instant::now(),
        },
    );

    Ok(addrs)
}

pub fn select_addr(
    addrs: &[SocketAddr],
    mode: ConnectMode,
    worker_id: usize,
    worker_count: usize,
    host: &str,
) -> Result<SocketAddr, RaceError> {
    if addrs.is_empty() {
        return Err(RaceError::Resolution {
            host: host.to_string(),
            reason: "no addresses to choose from".to_string(),
        });
    }

    match mode {
        ConnectMode::Same => Ok(addrs[0]),
        ConnectMode::Different => {
            if addrs.len() < worker_count {
                return Err(RaceError::InsufficientAddresses {
                    host: host.to_string(),
                    available: addrs.len(),
                    required: worker_count,
                });
            }
            Ok(addrs[worker_id % addrs.len()])
        }
        ConnectMode::Random => {
            let index = rand::thread_rng().gen_range(0..addrs.len());
            Ok(addrs[index])
        }
    }
}
