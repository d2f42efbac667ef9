// File: config.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::error::RaceError;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectMode {
    Same,
    Different,
    Random,
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub verify: bool,
    pub proxy: Option<Url>,
    pub request_timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            verify: true,
            proxy: None,
            request_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub do_eval: bool,
    pub save_sent_cookies: bool,
    pub send_options: SendOptions,
    pub connect_mode: ConnectMode,
    pub tail_bytes: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub barrier_timeout: Duration,
    pub release_delay: Duration,
    pub max_response_bytes: usize,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            do_eval: false,
            save_sent_cookies: true,
            send_options: SendOptions::default(),
            connect_mode: ConnectMode::Same,
            tail_bytes: 2,
            connect_timeout: Duration::from_millis(3000),
            read_timeout: Duration::from_millis(8000),
            barrier_timeout: Duration::from_secs(30),
            release_delay: Duration::from_millis(100),
            max_response_bytes: 1 << 20,
        }
    }
}

impl RaceConfig {
    pub fn validate(&mut self) -> Result<(), RaceError> {
        if self.tail_bytes < 1 {
            return Err(RaceError::configuration("tail_bytes must be at least 1"));
        }

        if self.tail_bytes > 64 {
            self.tail_bytes = 64;
        }

        if self.connect_timeout.is_zero() {
            return Err(RaceError::configuration("connect_timeout must be non-zero"));
        }

        if self.read_timeout.is_zero() {
            return Err(RaceError::configuration("read_timeout must be non-zero"));
        }

        if self.barrier_timeout.is_zero() {
            return Err(RaceError::configuration("barrier_timeout must be non-zero"));
        }

        if self.max_response_bytes > (1 << 26) {
            self.max_response_bytes = 1 << 26;
        }

        if let Some(proxy) = &self.send_options.proxy {
            if proxy.scheme() != "http" {
                return Err(RaceError::configuration(format!(
                    "unsupported proxy scheme: {}",
                    proxy.scheme()
                )));
            }
            if proxy.host_str().is_none() {
                return Err(RaceError::configuration("proxy URL has no host"));
            }
        }

        Ok(())
    }
}

// The options bag plumbed from the driver down to every connection.
#[derive(Debug, Clone)]
pub struct RaceParams {
    pub worker_id: usize,
    pub worker_count: usize,
    pub config: Arc<RaceConfig>,
    pub pinned_addrs: Arc<HashMap<(String, u16), SocketAddr>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_race_config_default() {
        let config = RaceConfig::default();
        assert!(!config.do_eval);
        assert!(config.save_sent_cookies);
        assert_eq!(config.connect_mode, ConnectMode::Same);
        assert_eq!(config.tail_bytes, 2);
        assert_eq!(config.barrier_timeout, Duration::from_secs(30));
        assert!(config.send_options.verify);
        assert!(config.send_options.proxy.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_tail() {
        let mut config = RaceConfig {
            tail_bytes: 0,
            ..RaceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_clamps_oversized_tail() {
        let mut config = RaceConfig {
            tail_bytes: 4096,
            ..RaceConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.tail_bytes, 64);
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = RaceConfig {
            barrier_timeout: Duration::ZERO,
            ..RaceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_socks_proxy() {
        let mut config = RaceConfig::default();
        config.send_options.proxy = Some(Url::parse("socks5://127.0.0.1:1080").unwrap());
        assert!(config.validate().is_err());
    }
}
